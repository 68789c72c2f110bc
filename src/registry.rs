//! Per-parameter configuration override registry
//!
//! Model code often wants to pin special optimizer behavior to individual
//! parameters (keep an embedding's state in full precision, give a norm
//! layer its own learning rate) without threading configuration through
//! every call site. The registry is that side channel: the host constructs
//! one [`OverrideRegistry`], hands a handle to model code and to each
//! optimizer, and model code registers `(parameter, fragment)` pairs any
//! time before the optimizer's first step.
//!
//! The optimizer snapshots the registry exactly once, on its first `step()`:
//! registered identities are matched against the live parameter list by
//! address equality and cached by `(group_index, param_index)`.
//! Registrations added after that snapshot are silently unobserved for that
//! optimizer instance; this is documented behavior, not a bug.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::ConfigOverride;
use crate::error::{AfinarError, Result};
use crate::param::{ParamGroup, ParamId, SharedParam};

#[derive(Debug, Clone)]
struct OverrideEntry {
    target: ParamId,
    attr: String,
    fragment: ConfigOverride,
}

/// Registry of per-parameter configuration overrides
///
/// Shared between host model code and optimizers; all methods take `&self`.
/// Intentionally shareable across optimizer instances within a process.
#[derive(Debug, Default)]
pub struct OverrideRegistry {
    entries: Mutex<Vec<OverrideEntry>>,
}

impl OverrideRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an override fragment for a parameter
    ///
    /// `attr` is the name the parameter is known by in the model (used only
    /// in diagnostics). No validation happens here; matching against the
    /// managed parameter set is deferred to [`OverrideRegistry::resolve`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry lock is poisoned.
    pub fn register(
        &self,
        param: &SharedParam,
        attr: impl Into<String>,
        fragment: ConfigOverride,
    ) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("override registry".to_string()))?;
        entries.push(OverrideEntry {
            target: ParamId::of(param),
            attr: attr.into(),
            fragment,
        });
        Ok(())
    }

    /// Number of registered overrides
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("override registry".to_string()))?;
        Ok(entries.len())
    }

    /// Whether no overrides are registered
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Match every registered override against the live parameter groups
    ///
    /// Produces the `(group_index, param_index) → fragment` map the
    /// coordinator caches. When the same parameter is registered more than
    /// once, the last registration wins. Registration is a programming-time
    /// contract: an identity with no match among the managed parameters is
    /// fatal rather than skipped, since skipping would silently diverge from
    /// the requested policy.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::OverrideTargetNotFound`] for an unmatched
    /// registration, or a lock-poisoning error.
    pub fn resolve(
        &self,
        groups: &[ParamGroup],
    ) -> Result<HashMap<(usize, usize), ConfigOverride>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("override registry".to_string()))?;
        let mut resolved = HashMap::new();
        for entry in entries.iter() {
            let mut found = false;
            'groups: for (gindex, group) in groups.iter().enumerate() {
                for (pindex, param) in group.params.iter().enumerate() {
                    if ParamId::of(param) == entry.target {
                        resolved.insert((gindex, pindex), entry.fragment.clone());
                        found = true;
                        break 'groups;
                    }
                }
            }
            if !found {
                return Err(AfinarError::OverrideTargetNotFound {
                    attr: entry.attr.clone(),
                });
            }
        }
        Ok(resolved)
    }
}
