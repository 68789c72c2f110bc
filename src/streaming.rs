//! Managed state buffers and asynchronous host/device prefetch
//!
//! Oversized full-precision state does not have to stay resident on the
//! device: the streaming manager allocates it in a managed (host/device
//! shareable) region and the step coordinator prefetches it back to the
//! device just ahead of use, overlapping the copy for the next parameter
//! with the update of the current one.
//!
//! ## Ordering contract
//!
//! `prefetch` is fire-and-forget: the coordinator never awaits completion.
//! Correctness rests on the device execution stream's FIFO guarantee.
//! Operations issue in order, so an update kernel enqueued after a prefetch
//! of the buffers it reads can never observe stale data. This is a contract
//! of the design, not an accident; any backing runtime must preserve
//! issue-order execution on the stream the coordinator uses.
//!
//! Managed allocations attempt best-effort `mlock` pinning so the device can
//! DMA from stable host pages. Pinning failure degrades to ordinary pageable
//! memory and is never an error.

use std::sync::Mutex;

use crate::error::{AfinarError, Result};
use crate::tensor::{DType, Device, Tensor, TensorData};

/// Element count at and above which 2-D full-precision state buffers are
/// allocated in managed memory when streaming is enabled
pub const STREAM_THRESHOLD: usize = 204_800;

/// Streaming manager configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Whether to attempt `mlock` pinning of managed allocations
    pub pin_host_memory: bool,
    /// Per-allocation pinning limit in bytes (0 = unlimited)
    pub max_pinned_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pin_host_memory: true,
            max_pinned_bytes: 0,
        }
    }
}

/// Outcome of a pin attempt on a managed allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Pages are locked
    Pinned,
    /// Pinning disabled in config
    Disabled,
    /// `mlock` refused (insufficient privileges)
    InsufficientPrivileges,
    /// Allocation exceeds the configured or system limit
    ResourceLimit,
    /// Platform without `mlock`
    Unsupported,
}

/// A locked host-memory range, unlocked on drop
#[derive(Debug)]
struct PinnedRegion {
    ptr: *const u8,
    len: usize,
    locked: bool,
}

// Safety: the region only tracks the pointer for munlock, never reads it
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    fn pin(ptr: *const u8, len: usize, config: &StreamConfig) -> (Self, PinOutcome) {
        if !config.pin_host_memory {
            return (
                Self {
                    ptr,
                    len,
                    locked: false,
                },
                PinOutcome::Disabled,
            );
        }
        if config.max_pinned_bytes > 0 && len > config.max_pinned_bytes {
            return (
                Self {
                    ptr,
                    len,
                    locked: false,
                },
                PinOutcome::ResourceLimit,
            );
        }
        let outcome = Self::mlock_impl(ptr, len);
        let locked = outcome == PinOutcome::Pinned;
        (Self { ptr, len, locked }, outcome)
    }

    #[cfg(target_family = "unix")]
    fn mlock_impl(ptr: *const u8, len: usize) -> PinOutcome {
        // SAFETY: ptr/len describe a live allocation owned by the caller
        let result = unsafe { libc::mlock(ptr.cast(), len) };
        if result == 0 {
            PinOutcome::Pinned
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EPERM {
                PinOutcome::InsufficientPrivileges
            } else {
                PinOutcome::ResourceLimit
            }
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn mlock_impl(_ptr: *const u8, _len: usize) -> PinOutcome {
        PinOutcome::Unsupported
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if self.locked {
            #[cfg(target_family = "unix")]
            // SAFETY: ptr/len were accepted by mlock above
            unsafe {
                libc::munlock(self.ptr.cast(), self.len);
            }
        }
    }
}

/// One issued prefetch, in issue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchEvent {
    /// Shape of the transferred buffer
    pub shape: Vec<usize>,
    /// Element type of the transferred buffer
    pub dtype: DType,
    /// Destination device
    pub device: Device,
}

/// Allocator and prefetcher for managed optimizer-state buffers
#[derive(Debug, Default)]
pub struct StreamingManager {
    config: StreamConfig,
    pinned: Mutex<Vec<PinnedRegion>>,
    issued: Mutex<Vec<PrefetchEvent>>,
}

impl StreamingManager {
    /// Manager with the given configuration
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            pinned: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a zero-filled managed buffer, host-resident
    ///
    /// Attempts to pin the allocation per the manager's config; the pin
    /// outcome is not surfaced since unpinned managed memory is still
    /// functional.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid shape or a poisoned internal lock.
    pub fn allocate_managed(&self, shape: Vec<usize>, dtype: DType) -> Result<Tensor> {
        let tensor = Tensor::zeros_managed(shape, dtype)?;
        let (ptr, len) = match tensor.data() {
            TensorData::F32(v) => (v.as_ptr().cast::<u8>(), std::mem::size_of_val(&v[..])),
            TensorData::F16(v) => (v.as_ptr().cast::<u8>(), std::mem::size_of_val(&v[..])),
            TensorData::U8(v) => (v.as_ptr(), v.len()),
        };
        let (region, _outcome) = PinnedRegion::pin(ptr, len, &self.config);
        self.pinned
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("streaming pin table".to_string()))?
            .push(region);
        Ok(tensor)
    }

    /// Issue an asynchronous prefetch of `buffers` to `device`
    ///
    /// Returns as soon as the transfer is enqueued; completion is ordered by
    /// the device stream (see module docs). Residency is updated at issue
    /// time, since any consumer on the same stream observes the
    /// post-transfer state.
    ///
    /// # Errors
    ///
    /// Returns an error only if the issue-queue lock is poisoned.
    pub fn prefetch(&self, buffers: &mut [&mut Tensor], device: Device) -> Result<()> {
        let mut issued = self
            .issued
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("streaming issue queue".to_string()))?;
        for buffer in buffers {
            issued.push(PrefetchEvent {
                shape: buffer.shape().to_vec(),
                dtype: buffer.dtype(),
                device,
            });
            buffer.move_to(device);
        }
        Ok(())
    }

    /// Fill a buffer with a constant
    pub fn fill(&self, tensor: &mut Tensor, value: f32) {
        tensor.fill(value);
    }

    /// Every prefetch issued so far, in issue order
    ///
    /// # Errors
    ///
    /// Returns an error only if the issue-queue lock is poisoned.
    pub fn issued(&self) -> Result<Vec<PrefetchEvent>> {
        Ok(self
            .issued
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("streaming issue queue".to_string()))?
            .clone())
    }

    /// Number of live managed allocations
    ///
    /// # Errors
    ///
    /// Returns an error only if the pin-table lock is poisoned.
    pub fn allocation_count(&self) -> Result<usize> {
        Ok(self
            .pinned
            .lock()
            .map_err(|_| AfinarError::LockPoisoned("streaming pin table".to_string()))?
            .len())
    }
}
