//! Dense buffers for parameters and optimizer state
//!
//! Optimizer state mixes full-precision (`f32`), half-precision (`f16`) and
//! byte-code (`u8`) buffers at runtime, so the tensor here is dtype-tagged
//! rather than generic: a flat row-major buffer plus shape, residency
//! ([`Device`]) and a managed bit marking host/device-shareable allocations.
//!
//! `U8` buffers hold codebook indices, not numbers. They can be moved between
//! devices but never cast to a numeric dtype; see [`Tensor::cast`].

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{AfinarError, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// Unsigned byte (quantization codes)
    U8,
}

impl DType {
    /// Whether this dtype is a floating-point type
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }

    /// Size of one element in bytes
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::U8 => 1,
        }
    }
}

/// Where a buffer currently resides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    Host,
    /// Accelerator memory, by ordinal
    Device(u32),
}

/// Backing storage, tagged by element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    /// 32-bit float elements
    F32(Vec<f32>),
    /// 16-bit float elements
    F16(Vec<f16>),
    /// Byte-code elements
    U8(Vec<u8>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::U8(v) => v.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::U8(_) => DType::U8,
        }
    }
}

/// Dense row-major tensor
///
/// # Examples
///
/// ```
/// use afinar::{DType, Device, Tensor};
///
/// let t = Tensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.numel(), 6);
/// assert_eq!(t.dtype(), DType::F32);
/// assert_eq!(t.device(), Device::Host);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    device: Device,
    managed: bool,
    data: TensorData,
}

impl Tensor {
    /// Create an `F32` tensor from a vector and shape, resident on the host
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is empty, contains a zero dimension, or
    /// its element count does not match the data length.
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = validate_shape(&shape)?;
        if data.len() != expected {
            return Err(AfinarError::DataShapeMismatch {
                data_len: data.len(),
                shape,
                expected,
            });
        }
        Ok(Self {
            shape,
            device: Device::Host,
            managed: false,
            data: TensorData::F32(data),
        })
    }

    /// Create a zero-filled tensor of the given shape, dtype and device
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is empty or contains a zero dimension.
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Result<Self> {
        let numel = validate_shape(&shape)?;
        let data = match dtype {
            DType::F32 => TensorData::F32(vec![0.0; numel]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; numel]),
            DType::U8 => TensorData::U8(vec![0; numel]),
        };
        Ok(Self {
            shape,
            device,
            managed: false,
            data,
        })
    }

    /// Create a zero-filled tensor shaped like `other`, with the given dtype,
    /// on `other`'s device
    #[must_use]
    pub fn zeros_like(other: &Tensor, dtype: DType) -> Self {
        // other's shape is already validated
        let numel = other.numel();
        let data = match dtype {
            DType::F32 => TensorData::F32(vec![0.0; numel]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; numel]),
            DType::U8 => TensorData::U8(vec![0; numel]),
        };
        Self {
            shape: other.shape.clone(),
            device: other.device,
            managed: false,
            data,
        }
    }

    /// Zero-filled managed (host/device-shareable) tensor, host-resident
    pub(crate) fn zeros_managed(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let mut t = Self::zeros(shape, dtype, Device::Host)?;
        t.managed = true;
        Ok(t)
    }

    /// Shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Element type
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Current residency
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether this buffer is a managed host/device-shareable allocation
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Borrow the backing storage
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Mutably borrow the backing storage
    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    /// Borrow as an `f32` slice, if this is an `F32` tensor
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a byte slice, if this is a `U8` tensor
    #[must_use]
    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Fill every element with `value`
    ///
    /// For `U8` buffers the value is truncated to a byte; state buffers are
    /// only ever filled with zero.
    pub fn fill(&mut self, value: f32) {
        match &mut self.data {
            TensorData::F32(v) => v.iter_mut().for_each(|x| *x = value),
            TensorData::F16(v) => {
                let value = f16::from_f32(value);
                v.iter_mut().for_each(|x| *x = value);
            },
            TensorData::U8(v) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let value = value as u8;
                v.iter_mut().for_each(|x| *x = value);
            },
        }
    }

    /// Return a copy of this tensor resident on `device`
    ///
    /// Pure: the receiver is untouched. Dtype and managed bit are preserved.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Tensor {
        let mut t = self.clone();
        t.device = device;
        t
    }

    /// Transition this buffer's residency in place
    ///
    /// Used for owned buffers (device migration, prefetch); checkpoint
    /// restore goes through the pure [`Tensor::to_device`] instead.
    pub(crate) fn move_to(&mut self, device: Device) {
        self.device = device;
    }

    /// Return a copy of this tensor converted to `dtype`
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::CodeBufferCast`] if either side of the
    /// conversion is `U8`: code buffers are codebook indices, not numbers.
    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let data = match (&self.data, dtype) {
            (TensorData::F32(v), DType::F16) => {
                TensorData::F16(v.iter().map(|&x| f16::from_f32(x)).collect())
            },
            (TensorData::F16(v), DType::F32) => {
                TensorData::F32(v.iter().map(|x| x.to_f32()).collect())
            },
            _ => {
                return Err(AfinarError::CodeBufferCast {
                    from: self.dtype(),
                    to: dtype,
                })
            },
        };
        Ok(Self {
            shape: self.shape.clone(),
            device: self.device,
            managed: self.managed,
            data,
        })
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={:?}, dtype={:?}, device={:?})",
            self.shape,
            self.dtype(),
            self.device
        )
    }
}

fn validate_shape(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() {
        return Err(AfinarError::InvalidShape {
            reason: "shape cannot be empty".to_string(),
        });
    }
    if shape.contains(&0) {
        return Err(AfinarError::InvalidShape {
            reason: "shape dimensions cannot be zero".to_string(),
        });
    }
    Ok(shape.iter().product())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32() {
        let t = Tensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DType::F32);
        assert!(!t.is_managed());
    }

    #[test]
    fn test_empty_shape_error() {
        let result = Tensor::from_f32(vec![], vec![1.0]);
        assert!(matches!(
            result.unwrap_err(),
            AfinarError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_zero_dimension_error() {
        let result = Tensor::zeros(vec![2, 0], DType::F32, Device::Host);
        assert!(matches!(
            result.unwrap_err(),
            AfinarError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_size_mismatch_error() {
        let result = Tensor::from_f32(vec![2, 3], vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            AfinarError::DataShapeMismatch {
                data_len: 2,
                expected: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_zeros_dtypes() {
        for dtype in [DType::F32, DType::F16, DType::U8] {
            let t = Tensor::zeros(vec![4], dtype, Device::Device(0)).unwrap();
            assert_eq!(t.dtype(), dtype);
            assert_eq!(t.numel(), 4);
            assert_eq!(t.device(), Device::Device(0));
        }
    }

    #[test]
    fn test_zeros_like_inherits_shape_and_device() {
        let base = Tensor::zeros(vec![3, 2], DType::F32, Device::Device(1)).unwrap();
        let t = Tensor::zeros_like(&base, DType::U8);
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.device(), Device::Device(1));
        assert_eq!(t.dtype(), DType::U8);
    }

    #[test]
    fn test_fill() {
        let mut t = Tensor::zeros(vec![3], DType::F32, Device::Host).unwrap();
        t.fill(2.5);
        assert_eq!(t.as_f32().unwrap(), &[2.5, 2.5, 2.5]);

        let mut b = Tensor::zeros(vec![3], DType::U8, Device::Host).unwrap();
        b.fill(7.0);
        assert_eq!(b.as_u8().unwrap(), &[7, 7, 7]);
    }

    #[test]
    fn test_to_device_is_pure() {
        let t = Tensor::zeros(vec![2], DType::F32, Device::Host).unwrap();
        let moved = t.to_device(Device::Device(0));
        assert_eq!(t.device(), Device::Host);
        assert_eq!(moved.device(), Device::Device(0));
        assert_eq!(moved.as_f32(), t.as_f32());
    }

    #[test]
    fn test_cast_f32_f16_roundtrip() {
        let t = Tensor::from_f32(vec![3], vec![1.0, -0.5, 0.25]).unwrap();
        let h = t.cast(DType::F16).unwrap();
        assert_eq!(h.dtype(), DType::F16);
        let back = h.cast(DType::F32).unwrap();
        // These values are exactly representable in f16
        assert_eq!(back.as_f32().unwrap(), &[1.0, -0.5, 0.25]);
    }

    #[test]
    fn test_cast_u8_rejected() {
        let codes = Tensor::zeros(vec![4], DType::U8, Device::Host).unwrap();
        assert!(matches!(
            codes.cast(DType::F32).unwrap_err(),
            AfinarError::CodeBufferCast {
                from: DType::U8,
                to: DType::F32,
            }
        ));
        let floats = Tensor::zeros(vec![4], DType::F32, Device::Host).unwrap();
        assert!(floats.cast(DType::U8).is_err());
    }

    #[test]
    fn test_cast_same_dtype_is_identity() {
        let t = Tensor::from_f32(vec![2], vec![1.0, 2.0]).unwrap();
        let c = t.cast(DType::F32).unwrap();
        assert_eq!(c, t);
    }

    #[test]
    fn test_managed_zeros() {
        let t = Tensor::zeros_managed(vec![2, 2], DType::F32).unwrap();
        assert!(t.is_managed());
        assert_eq!(t.device(), Device::Host);
    }

    #[test]
    fn test_display() {
        let t = Tensor::zeros(vec![2, 2], DType::U8, Device::Host).unwrap();
        let s = format!("{t}");
        assert!(s.contains("shape=[2, 2]"));
        assert!(s.contains("U8"));
    }
}
