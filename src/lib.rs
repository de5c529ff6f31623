//! # MMIO Trap
//!
//! A trap-and-emulate engine for memory-mapped peripheral registers. Driver
//! code performs ordinary loads and stores on register addresses; those
//! addresses are reserved as inaccessible memory, every access faults, and
//! the fault is turned into a request to a software device model. The
//! model's answer is written back into the faulting thread's registers and
//! the thread resumes after the access instruction. Models raise interrupts
//! asynchronously; those are delivered to driver interrupt handlers on the
//! driver thread.
//!
//! ## Architecture
//!
//! ### Trap Layer
//! - [`TrapLayer`]: register ranges, fault handler, instruction decoding and
//!   register-context patching
//! - [`FaultDecoder`]: ISA-specific classification of the faulting access
//!   ([`X86Decoder`] on x86-64)
//! - [`RangeTable`]: half-open address ranges owned by modules
//!
//! ### Device Models
//! - [`DeviceModel`]: capability contract implemented by every simulated peripheral
//! - [`ModelRegistry`]: models by name, with lifecycle tracking and statistics
//! - [`MessageRouter`]: structured request in, structured response out
//! - [`models`]: reference UART and DMA controller models
//!
//! ### Interrupt Path
//! - [`AsyncDelivery`]: model interrupts to driver handlers, as real-time
//!   signals or through an in-process queue
//! - [`InterruptTable`]: IRQ number to handler, with an enable flag per line
//!
//! ### Assembly
//! - [`Simulator`]: owns every component; [`SimConfig`] describes the ranges
//!   and notification mappings it applies at start-up
//!
//! ## Platform
//!
//! Native trapping needs Linux on x86-64. Elsewhere the tables, router,
//! models and queued delivery work unchanged and faults can be fed in
//! explicitly with [`TrapLayer::service_with`].
//!
//! ## Examples
//!
//! ### Emulating a UART
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mmio_trap::{DeliveryMethod, RangeBacking, SimConfig, Simulator};
//! use mmio_trap::models::{Uart, UartConfig};
//!
//! let config = SimConfig::new(DeliveryMethod::Signal)
//!     .with_range(0x4000_1000, 0x4000_2000, "uart0", RangeBacking::Reserved)
//!     .with_notification(libc::SIGRTMIN() + 2, "uart0", 5);
//! let (sim, report) = Simulator::with_config(&config);
//! assert!(report.is_clean());
//!
//! let uart = Arc::new(Uart::new(UartConfig::default(), sim.notifier("uart0")?));
//! sim.register_model(uart.clone())?;
//! sim.register_interrupt(5, |irq| { /* transmit-complete handler */ })?;
//! sim.start_trapping()?;
//!
//! // Plain driver code from here on.
//! let regs = 0x4000_1000 as *mut u32;
//! unsafe {
//!     regs.add(0x30 / 4).write_volatile(1); // CR.UARTEN
//!     regs.write_volatile(b'A' as u32);     // DR
//! }
//! ```
//!
//! ### Without native trapping
//!
//! ```rust,ignore
//! let sim = Simulator::new(DeliveryMethod::Queued);
//! sim.trap().record_range(0x4000_1000, 0x4000_2000, "uart0")?;
//! // `mov dword ptr [rdx], eax` with rdx = 0x4000_1000
//! let mut regs: mmio_trap::Registers = unsafe { core::mem::zeroed() };
//! regs[libc::REG_RAX as usize] = 0x41;
//! sim.service(0x4000_1000, &[0x89, 0x02], &mut regs)?;
//! ```

#[macro_use]
extern crate log;

mod config;
mod device;
mod irq;
mod lifecycle;
mod notify;
mod protocol;
mod registry;
mod router;
mod signal;
mod system;
mod ticker;
mod trap;
mod wrapper;

pub mod models;

pub use config::{
    ConfigEntry, ConfigRejection, ConfigReport, NotificationConfig, RangeBacking, RangeConfig,
    SimConfig,
};
pub use device::{DeviceModel, InterruptRaiser};
pub use irq::{InterruptHandler, InterruptTable, MAX_INTERRUPTS};
pub use lifecycle::{ModelLifecycle, ModelState};
pub use notify::{
    AsyncDelivery, DeliveryMethod, DeliveryStats, DeviceNotifier, MAX_NOTIFICATIONS,
    NotificationMapping, NotificationTable, PendingNotification,
};
pub use protocol::{
    AccessWidth, ClockAction, MODULE_NAME_CAP, MessageKind, ModuleName, Payload, ResetAction,
    SimMessage, error_code, module_name,
};
pub use registry::{MAX_MODELS, ModelRegistry};
pub use router::MessageRouter;
pub use signal::IrqGuard;
pub use system::Simulator;
pub use ticker::Ticker;
pub use trap::{
    DecodedAccess, FaultDecoder, FaultOutcome, MAX_INSN_LEN, MAX_RANGES, Operation, RangeHit,
    RangeTable, RegisterSlot, Reservation, TrapError, TrapLayer, Undecodable,
};
pub use wrapper::{ModelId, ModelStats, ModelWrapper};

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub use trap::{Registers, X86Decoder};
