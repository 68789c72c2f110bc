//! Trainable parameters, parameter groups, and address-based identity
//!
//! Parameters are owned by the host training loop and shared with the
//! optimizer (and the override registry) as [`SharedParam`] handles. Identity
//! is address equality on the shared allocation, never value equality: two
//! parameters with identical contents are still distinct targets for
//! overrides and state.

use std::sync::{Arc, RwLock};

use crate::config::GroupDefaults;
use crate::tensor::Tensor;

/// A trainable tensor and its current gradient
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Parameter values
    pub data: Tensor,
    /// Gradient from the last backward pass; `None` means "skip this step"
    pub grad: Option<Tensor>,
}

impl Parameter {
    /// Parameter with no gradient
    #[must_use]
    pub fn new(data: Tensor) -> Self {
        Self { data, grad: None }
    }

    /// Attach a gradient
    #[must_use]
    pub fn with_grad(mut self, grad: Tensor) -> Self {
        self.grad = Some(grad);
        self
    }
}

/// Shared handle to a parameter
pub type SharedParam = Arc<RwLock<Parameter>>;

/// Wrap a parameter into a shared handle
#[must_use]
pub fn shared(param: Parameter) -> SharedParam {
    Arc::new(RwLock::new(param))
}

/// Identity of a shared parameter, by allocation address
///
/// Stable for as long as any handle to the parameter is alive; cloned
/// handles share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    /// Identity of the given handle
    #[must_use]
    pub fn of(param: &SharedParam) -> Self {
        Self(Arc::as_ptr(param) as usize)
    }
}

/// An ordered set of parameters sharing hyperparameter defaults
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Parameters, in a fixed order that defines step traversal
    pub params: Vec<SharedParam>,
    /// Hyperparameter defaults for every parameter in the group
    pub defaults: GroupDefaults,
}

impl ParamGroup {
    /// Create a group
    #[must_use]
    pub fn new(params: Vec<SharedParam>, defaults: GroupDefaults) -> Self {
        Self { params, defaults }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Device};

    fn param(numel: usize) -> SharedParam {
        shared(Parameter::new(
            Tensor::zeros(vec![numel], DType::F32, Device::Host).unwrap(),
        ))
    }

    #[test]
    fn test_cloned_handles_share_identity() {
        let p = param(4);
        let q = Arc::clone(&p);
        assert_eq!(ParamId::of(&p), ParamId::of(&q));
    }

    #[test]
    fn test_distinct_parameters_have_distinct_ids() {
        // Both handles held alive, so addresses cannot be reused
        let p = param(4);
        let q = param(4);
        assert_ne!(ParamId::of(&p), ParamId::of(&q));
    }

    #[test]
    fn test_with_grad() {
        let data = Tensor::zeros(vec![2], DType::F32, Device::Host).unwrap();
        let grad = Tensor::from_f32(vec![2], vec![0.1, -0.1]).unwrap();
        let p = Parameter::new(data).with_grad(grad);
        assert!(p.grad.is_some());
    }

    #[test]
    fn test_group_preserves_order() {
        let a = param(1);
        let b = param(2);
        let group = ParamGroup::new(vec![Arc::clone(&a), Arc::clone(&b)], GroupDefaults::default());
        assert_eq!(ParamId::of(&group.params[0]), ParamId::of(&a));
        assert_eq!(ParamId::of(&group.params[1]), ParamId::of(&b));
    }
}
