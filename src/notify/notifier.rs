//! Per-model handle for raising interrupts.

use std::sync::Arc;

use axerrno::AxResult;

use super::delivery::AsyncDelivery;
use crate::device::InterruptRaiser;
use crate::protocol::{ModuleName, module_name};

/// Bound to one module name; models call [`InterruptRaiser::raise`] on it
/// with their own IRQ numbers.
pub struct DeviceNotifier {
    module: ModuleName,
    delivery: Arc<AsyncDelivery>,
}

impl DeviceNotifier {
    pub fn new(module: &str, delivery: Arc<AsyncDelivery>) -> AxResult<Self> {
        Ok(Self {
            module: module_name(module)?,
            delivery,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

impl InterruptRaiser for DeviceNotifier {
    fn raise(&self, irq: u32) -> AxResult {
        self.delivery.raise(&self.module, irq)
    }
}
