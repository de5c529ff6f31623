//! Reference device models.
//!
//! Each model is constructed with its config and an [`InterruptRaiser`]
//! (normally a [`DeviceNotifier`](crate::notify::DeviceNotifier) for the
//! model's name) and registered with the simulator like any other
//! [`DeviceModel`](crate::DeviceModel).
//!
//! [`InterruptRaiser`]: crate::InterruptRaiser

pub mod dma;
pub mod memory;
pub mod uart;

pub use dma::{Dma, DmaConfig};
pub use memory::{DmaBus, HostMemory, SparseMemory};
pub use uart::{Uart, UartConfig};

#[cfg(test)]
pub(crate) mod tests {
    use axerrno::AxResult;
    use spin::Mutex;

    use crate::device::InterruptRaiser;

    /// Records every raised IRQ.
    #[derive(Default)]
    pub struct RecordingRaiser {
        raised: Mutex<Vec<u32>>,
    }

    impl RecordingRaiser {
        pub fn raised(&self) -> Vec<u32> {
            self.raised.lock().clone()
        }

        pub fn count(&self, irq: u32) -> usize {
            self.raised.lock().iter().filter(|&&i| i == irq).count()
        }
    }

    impl InterruptRaiser for RecordingRaiser {
        fn raise(&self, irq: u32) -> AxResult {
            self.raised.lock().push(irq);
            Ok(())
        }
    }
}
