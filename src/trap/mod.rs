//! Trap layer: protected register ranges, fault decoding and context patching.
//!
//! # Fault path
//!
//! ```text
//! driver load/store ──► SIGSEGV ──► resolve range ──► classify instruction
//!                                                         │
//!          resume at next instruction ◄── patch context ◄─┤ request/response
//!                                                         ▼
//!                                         service thread ─► MessageRouter
//! ```
//!
//! The same processing is available without signals through
//! [`TrapLayer::service_with`], which routes the request on the calling
//! thread. That path is what hosts without native trapping and the tests use.

mod decoder;
mod range;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "linux"))] {
        mod handler;
        mod handoff;
        mod x86_64;

        pub use x86_64::{Registers, X86Decoder};
    }
}

use std::sync::Arc;

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use axerrno::AxResult;

pub use decoder::{
    DecodedAccess, FaultDecoder, MAX_INSN_LEN, Operation, RegisterSlot, Undecodable,
};
pub use range::{MAX_RANGES, RangeHit, RangeTable, Reservation};

use crate::notify::{AsyncDelivery, DeliveryMethod};
use crate::protocol::SimMessage;
use crate::router::MessageRouter;

/// A fault the trap layer cannot recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapError {
    /// The faulting address is in no register range.
    UnknownAddress(usize),
    /// The router rejected the access (or never answered).
    RouterFailure { id: u32, error: i32 },
}

impl fmt::Display for TrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAddress(addr) => write!(f, "no register range contains {addr:#x}"),
            Self::RouterFailure { id, error } => {
                write!(f, "request {id} failed with error {error}")
            }
        }
    }
}

/// What happened to one trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The access was emulated.
    Serviced {
        request: SimMessage,
        response: SimMessage,
    },
    /// The instruction is not an emulated access; it was stepped over
    /// without touching any model.
    Skipped { pc: usize, len: usize },
    /// The bytes at the faulting PC did not decode. Nothing was routed or
    /// patched and the PC was left where it is, so the instruction runs
    /// (and faults) again.
    Undecoded { pc: usize, first_byte: u8 },
}

/// Where decoded accesses go.
pub(crate) trait AccessSink {
    fn submit(&self, request: &SimMessage) -> Option<SimMessage>;
    fn report_skipped(&self, pc: usize, len: usize, first_byte: u8);
    fn report_undecoded(&self, pc: usize, first_byte: u8);
}

/// Routes on the calling thread.
struct InlineSink<'a>(&'a MessageRouter);

impl AccessSink for InlineSink<'_> {
    fn submit(&self, request: &SimMessage) -> Option<SimMessage> {
        Some(self.0.dispatch(request))
    }

    fn report_skipped(&self, pc: usize, len: usize, first_byte: u8) {
        warn!(
            "skipped unsupported instruction (first byte {:#04x}, {} bytes) at {:#x}",
            first_byte, len, pc
        );
    }

    fn report_undecoded(&self, pc: usize, first_byte: u8) {
        warn!(
            "undecodable instruction (first byte {:#04x}) at {:#x}, treated as a no-op",
            first_byte, pc
        );
    }
}

/// Owns the register ranges and turns faults inside them into requests.
pub struct TrapLayer {
    ranges: RangeTable,
    router: Arc<MessageRouter>,
    delivery: Arc<AsyncDelivery>,
    next_id: AtomicU32,
    /// PC of the last undecodable fault, reported once per PC.
    last_undecoded: AtomicUsize,
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    service: spin::Mutex<Option<handoff::ServiceThread>>,
}

impl TrapLayer {
    pub fn new(router: Arc<MessageRouter>, delivery: Arc<AsyncDelivery>) -> Self {
        Self {
            ranges: RangeTable::new(),
            router,
            delivery,
            next_id: AtomicU32::new(1),
            last_undecoded: AtomicUsize::new(usize::MAX),
            #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
            service: spin::Mutex::new(None),
        }
    }

    /// Reserves `[start, end)` as an inaccessible mapping owned by `module`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty range or a bad module name.
    /// - `AlreadyExists` if the range overlaps a recorded one.
    /// - `NoMemory` if the range table is full.
    /// - `AddrInUse` / `BadAddress` if the pages cannot be reserved.
    pub fn reserve_range(&self, start: usize, end: usize, module: &str) -> AxResult {
        let hit = self.ranges.reserve(start, end, module)?;
        info!(
            "reserved [{:#x}, {:#x}) for {}",
            hit.start(),
            hit.end(),
            hit.module
        );
        Ok(())
    }

    /// Records `[start, end)` for `module` without reserving memory.
    pub fn record_range(&self, start: usize, end: usize, module: &str) -> AxResult {
        let hit = self.ranges.record(start, end, module)?;
        debug!(
            "recorded [{:#x}, {:#x}) for {}",
            hit.start(),
            hit.end(),
            hit.module
        );
        Ok(())
    }

    pub fn resolve(&self, addr: usize) -> Option<RangeHit> {
        self.ranges.resolve(addr)
    }

    pub fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    /// Next correlation id. Starts at 1.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The fault-processing core shared by the signal handler and
    /// [`service_with`](Self::service_with).
    ///
    /// Runs in signal context when called from the handler: everything here
    /// is allocation-free and lock-free apart from the spin read locks of
    /// the range table.
    pub(crate) fn handle<D: FaultDecoder, S: AccessSink + ?Sized>(
        &self,
        decoder: &D,
        sink: &S,
        fault_addr: usize,
        code: &[u8],
        regs: &mut D::Registers,
    ) -> Result<FaultOutcome, TrapError> {
        let hit = self
            .ranges
            .resolve(fault_addr)
            .ok_or(TrapError::UnknownAddress(fault_addr))?;

        let pc = decoder.pc(regs);
        let access = match decoder.classify(pc, code) {
            Ok(access) => access,
            Err(Undecodable { pc, first_byte }) => {
                if self.last_undecoded.swap(pc, Ordering::Relaxed) != pc {
                    sink.report_undecoded(pc, first_byte);
                }
                return Ok(FaultOutcome::Undecoded { pc, first_byte });
            }
        };

        if access.op == Operation::Unsupported {
            sink.report_skipped(pc, access.len, code.first().copied().unwrap_or(0));
            decoder.advance_pc(regs, access.len);
            return Ok(FaultOutcome::Skipped {
                pc,
                len: access.len,
            });
        }

        let id = self.next_id();
        let request = if access.is_store() {
            // The wire value is 32 bits wide; 64-bit stores keep the low half.
            let value = decoder.store_value(regs, &access) as u32;
            SimMessage::register_write(hit.module, fault_addr, value, access.width)
        } else {
            SimMessage::register_read(hit.module, fault_addr, access.width)
        }
        .with_id(id);

        let response = sink
            .submit(&request)
            .ok_or(TrapError::RouterFailure { id, error: -1 })?;
        if !response.is_ok() || response.id != id {
            return Err(TrapError::RouterFailure {
                id,
                error: response.error(),
            });
        }

        if !access.is_store() {
            decoder.complete_load(regs, &access, u64::from(response.result()));
        }
        decoder.advance_pc(regs, access.len);
        Ok(FaultOutcome::Serviced { request, response })
    }

    /// Processes a fault at `fault_addr` on the calling thread, as if the
    /// instruction `code` at the PC in `regs` had trapped.
    ///
    /// Under queued delivery any interrupt raised by the access is delivered
    /// before returning, i.e. at the next instruction boundary.
    pub fn service_with<D: FaultDecoder>(
        &self,
        decoder: &D,
        fault_addr: usize,
        code: &[u8],
        regs: &mut D::Registers,
    ) -> Result<FaultOutcome, TrapError> {
        let outcome = self.handle(decoder, &InlineSink(&self.router), fault_addr, code, regs);
        if let Err(err) = &outcome {
            error!("trapped access failed: {}", err);
        }
        if self.delivery.method() == DeliveryMethod::Queued {
            self.delivery.flush();
        }
        outcome
    }

    /// [`service_with`](Self::service_with) using the native decoder.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn service(
        &self,
        fault_addr: usize,
        code: &[u8],
        regs: &mut Registers,
    ) -> Result<FaultOutcome, TrapError> {
        self.service_with(&X86Decoder, fault_addr, code, regs)
    }

    /// Starts the service thread and installs the process-wide fault handler.
    ///
    /// Only one trap layer per process can be installed. Under queued
    /// delivery, raised interrupts stay pending until the driver calls
    /// [`AsyncDelivery::flush`].
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn install(self: &Arc<Self>) -> AxResult {
        let mut service = self.service.lock();
        if service.is_some() {
            return axerrno::ax_err!(AlreadyExists, "fault handler already installed");
        }
        let handoff = Arc::new(handoff::Handoff::new()?);
        let thread = handoff::ServiceThread::spawn(handoff.clone(), self.router.clone())?;
        let hook = handler::FaultHook {
            trap: Arc::clone(self),
            handoff,
            service_thread: thread.thread(),
        };
        if let Err(err) = handler::install(hook) {
            thread.stop();
            return Err(err);
        }
        *service = Some(thread);
        info!("fault handler installed");
        Ok(())
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
    pub fn install(self: &Arc<Self>) -> AxResult {
        axerrno::ax_err!(Unsupported, "native trapping needs Linux on x86-64")
    }

    /// Removes the fault handler and stops the service thread. Idempotent.
    pub fn uninstall(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        {
            let thread = self.service.lock().take();
            if let Some(thread) = thread {
                handler::uninstall();
                thread.stop();
                info!("fault handler removed");
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        return self.service.lock().is_some();
        #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
        return false;
    }

    /// Unmaps every reservation and forgets every range.
    pub fn release(&self) {
        let unmapped = self.ranges.release();
        if unmapped > 0 {
            debug!("released {} register reservations", unmapped);
        }
    }
}
