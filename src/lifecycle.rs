//! Model slot lifecycle with a packed state/in-flight counter.
//!
//! A registered model can be reached from the service thread, from explicit
//! callers and from its own background thread at the same time. Shutdown must
//! not call `cleanup` while any of them is still inside a capability, so every
//! dispatch takes an access token first and removal drains those tokens.
//!
//! Layout of the packed word: `[state(8 bits) | in_flight(24 bits)]`

use core::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle state of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModelState {
    /// Accepting requests.
    Active = 0,
    /// Draining; new requests are rejected.
    Removing = 1,
    /// Cleaned up.
    Removed = 2,
}

impl ModelState {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Active,
            1 => Self::Removing,
            _ => Self::Removed,
        }
    }
}

const STATE_SHIFT: u32 = 24;
const COUNT_MASK: u32 = (1 << STATE_SHIFT) - 1;

/// Tracks the lifecycle state and the number of in-flight accesses of one
/// model slot.
///
/// ```text
/// Active --begin_removal()--> Removing --drain()--> Removed
/// ```
///
/// The state check and the counter increment happen in one CAS, so an access
/// that got a token is always seen by `drain`.
pub struct ModelLifecycle(AtomicU32);

impl ModelLifecycle {
    pub const fn new() -> Self {
        Self(AtomicU32::new((ModelState::Active as u32) << STATE_SHIFT))
    }

    #[inline]
    pub fn state(&self) -> ModelState {
        ModelState::from_bits(self.0.load(Ordering::Acquire) >> STATE_SHIFT)
    }

    /// Number of capability calls currently in progress.
    #[inline]
    pub fn in_flight(&self) -> usize {
        (self.0.load(Ordering::Acquire) & COUNT_MASK) as usize
    }

    /// Takes an access token if the slot is still active.
    pub fn try_begin_access(&self) -> Result<(), ModelState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ModelState::from_bits(current >> STATE_SHIFT);
            if state != ModelState::Active {
                return Err(state);
            }
            if current & COUNT_MASK == COUNT_MASK {
                return Err(state);
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    #[inline]
    pub fn end_access(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }

    /// Moves an active slot to `Removing`. Returns `false` if it was not active.
    pub fn begin_removal(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >> STATE_SHIFT != ModelState::Active as u32 {
                return false;
            }
            let next = ((ModelState::Removing as u32) << STATE_SHIFT) | (current & COUNT_MASK);
            match self.0.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Waits until no access is in flight, then marks the slot `Removed`.
    pub fn drain(&self) {
        while self.in_flight() != 0 {
            std::thread::yield_now();
        }
        self.0
            .store((ModelState::Removed as u32) << STATE_SHIFT, Ordering::Release);
    }
}

impl Default for ModelLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ModelLifecycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lifecycle_access_counting() {
        let lc = ModelLifecycle::new();
        assert_eq!(lc.state(), ModelState::Active);
        assert!(lc.try_begin_access().is_ok());
        assert!(lc.try_begin_access().is_ok());
        assert_eq!(lc.in_flight(), 2);
        lc.end_access();
        lc.end_access();
        assert_eq!(lc.in_flight(), 0);
    }

    #[test]
    fn test_lifecycle_rejects_after_removal() {
        let lc = ModelLifecycle::new();
        assert!(lc.begin_removal());
        assert!(!lc.begin_removal());
        assert_eq!(lc.try_begin_access(), Err(ModelState::Removing));
        lc.drain();
        assert_eq!(lc.state(), ModelState::Removed);
        assert_eq!(lc.try_begin_access(), Err(ModelState::Removed));
    }

    #[test]
    fn test_drain_waits_for_in_flight_access() {
        let lc = Arc::new(ModelLifecycle::new());
        lc.try_begin_access().unwrap();
        assert!(lc.begin_removal());
        assert_eq!(lc.in_flight(), 1);

        let worker = {
            let lc = lc.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                lc.end_access();
            })
        };
        lc.drain();
        assert_eq!(lc.state(), ModelState::Removed);
        worker.join().unwrap();
    }
}
