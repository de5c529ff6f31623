//! The device-model capability contract.

use axerrno::AxResult;

use crate::protocol::{AccessWidth, ClockAction, ResetAction};

/// A simulated peripheral.
///
/// Models are shared between the service thread, explicit callers and the
/// model's own background thread, so every capability takes `&self` and the
/// model keeps its state behind its own lock. The registry additionally
/// serializes capability calls per model.
///
/// Only `name`, `register_read` and `register_write` are mandatory. The
/// remaining capabilities default to doing nothing and succeeding.
pub trait DeviceModel: Send + Sync {
    /// Unique, non-empty name (at most 31 bytes) used to route requests.
    fn name(&self) -> &str;

    /// Called once on registration. An error aborts the registration.
    fn init(&self) -> AxResult {
        Ok(())
    }

    /// Called once when the registry shuts down. Must stop background work.
    fn cleanup(&self) {}

    fn clock(&self, _action: ClockAction, _cycles: u32) -> AxResult {
        Ok(())
    }

    fn reset(&self, _action: ResetAction) -> AxResult {
        Ok(())
    }

    /// Reads the register at the absolute `addr`.
    ///
    /// Reads never fail; unknown registers read as zero.
    fn register_read(&self, addr: usize, width: AccessWidth) -> u32;

    /// Writes `value` to the register at the absolute `addr`.
    fn register_write(&self, addr: usize, width: AccessWidth, value: u32) -> AxResult;

    /// Acknowledges interrupt line `irq` of this model.
    fn interrupt(&self, _irq: u32) -> AxResult {
        Ok(())
    }
}

/// The outbound side a model uses to assert one of its interrupt lines.
///
/// Models must not hold their own state lock while calling [`raise`], since
/// delivery may run an interrupt handler that reads the model's registers.
///
/// [`raise`]: InterruptRaiser::raise
pub trait InterruptRaiser: Send + Sync {
    fn raise(&self, irq: u32) -> AxResult;
}
