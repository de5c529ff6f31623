//! Asynchronous delivery of model interrupts to driver handlers.
//!
//! Two delivery methods share one routing table:
//!
//! - [`DeliveryMethod::Signal`]: a raise sends the mapped real-time signal to
//!   the delivery target thread; the installed handler resolves the signal
//!   number back to an IRQ and runs the interrupt handler in signal context.
//! - [`DeliveryMethod::Queued`]: a raise appends to a FIFO, and [`flush`]
//!   delivers pending notifications on the calling thread.
//!
//! [`flush`]: AsyncDelivery::flush

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use axerrno::{AxError, AxResult, ax_err};
use spin::{Mutex, RwLock};

use super::queue::PendingQueue;
use super::routing::{MAX_NOTIFICATIONS, NotificationMapping, NotificationTable};
use crate::irq::InterruptTable;
use crate::signal::{self, IrqGuard};

/// How raised interrupts reach the interrupt dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMethod {
    /// Real-time signal to the target thread.
    #[default]
    Signal,
    /// In-process FIFO drained by [`AsyncDelivery::flush`].
    Queued,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Raises that resolved to a notification id.
    pub raised: u64,
    /// Notifications that reached an enabled handler.
    pub delivered: u64,
    /// Raises without a mapping, and notifications whose IRQ was unknown or
    /// disabled.
    pub dropped: u64,
}

/// The delivery layer whose signal handler is currently installed.
static ACTIVE: RwLock<Option<Arc<AsyncDelivery>>> = RwLock::new(None);

extern "C" fn on_notification(sig: libc::c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: errno is thread-local; it is restored before returning so the
    // interrupted code never sees it change.
    let saved_errno = unsafe { *libc::__errno_location() };
    let active = ACTIVE.read().clone();
    if let Some(delivery) = active {
        delivery.deliver_quiet(sig);
    }
    unsafe { *libc::__errno_location() = saved_errno };
}

/// Routes raised `(module, irq)` pairs to the interrupt dispatch table.
pub struct AsyncDelivery {
    method: DeliveryMethod,
    table: NotificationTable,
    interrupts: Arc<InterruptTable>,
    pending: PendingQueue,
    target: AtomicU64,
    armed: Mutex<ArrayVec<(i32, libc::sigaction), MAX_NOTIFICATIONS>>,
    closed: AtomicBool,
    raised: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl AsyncDelivery {
    /// Creates a delivery layer. The calling thread becomes the signal target.
    pub fn new(method: DeliveryMethod, interrupts: Arc<InterruptTable>) -> Self {
        Self {
            method,
            table: NotificationTable::new(),
            interrupts,
            pending: PendingQueue::new(),
            target: AtomicU64::new(signal::current_thread() as u64),
            armed: Mutex::new(ArrayVec::new()),
            closed: AtomicBool::new(false),
            raised: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> DeliveryMethod {
        self.method
    }

    pub fn interrupts(&self) -> &Arc<InterruptTable> {
        &self.interrupts
    }

    /// Makes the calling thread the one that receives signal deliveries.
    pub fn set_target_current_thread(&self) {
        self.target
            .store(signal::current_thread() as u64, Ordering::Release);
    }

    /// Binds notification `id` to `(module, irq)`.
    ///
    /// Under signal delivery `id` must be a real-time signal number, and the
    /// first bind installs this layer's signal handler process-wide.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `id` is not a real-time signal under signal delivery.
    /// - `ResourceBusy` if another delivery layer owns the signal handler.
    /// - The table errors of [`NotificationTable::bind`].
    pub fn bind(self: &Arc<Self>, id: i32, module: &str, irq: u32) -> AxResult {
        if self.method == DeliveryMethod::Signal {
            if !signal::is_rt_signal(id) {
                return ax_err!(InvalidInput, "notification id is not a real-time signal");
            }
            self.activate()?;
        }

        let mapping = self.table.bind(id, module, irq)?;

        if self.method == DeliveryMethod::Signal {
            let old = signal::install_handler(id, on_notification, libc::SA_RESTART | libc::SA_ONSTACK)?;
            // Capacity matches the routing table, which already accepted the id.
            let _ = self.armed.lock().try_push((id, old));
        }
        info!(
            "notification {} -> {}:{} ({:?})",
            mapping.id, mapping.module, mapping.irq, self.method
        );
        Ok(())
    }

    fn activate(self: &Arc<Self>) -> AxResult {
        let _irq = IrqGuard::new();
        let mut active = ACTIVE.write();
        match active.as_ref() {
            Some(current) if Arc::ptr_eq(current, self) => Ok(()),
            Some(_) => ax_err!(ResourceBusy, "another delivery layer owns the signal handler"),
            None => {
                *active = Some(Arc::clone(self));
                Ok(())
            }
        }
    }

    /// Called by a model to assert interrupt line `irq`.
    ///
    /// Fails with `NotFound` (and counts a drop) if the pair has no mapping,
    /// and with `BadState` after [`shutdown`](Self::shutdown).
    pub fn raise(&self, module: &str, irq: u32) -> AxResult {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(AxError::BadState);
        }
        let Some(mapping) = self.table.by_target(module, irq) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("{}:{} raised without a notification mapping", module, irq);
            return Err(AxError::NotFound);
        };
        self.raised.fetch_add(1, Ordering::Relaxed);
        trace!("{}:{} raised as notification {}", module, irq, mapping.id);

        match self.method {
            DeliveryMethod::Signal => {
                let target = self.target.load(Ordering::Acquire) as libc::pthread_t;
                signal::send(target, mapping.id)
            }
            DeliveryMethod::Queued => {
                self.pending.push(mapping.id, mapping.module, mapping.irq);
                Ok(())
            }
        }
    }

    /// Delivers notification `id` on the calling thread.
    ///
    /// A masked IRQ is not an error. Fails with `NotFound` if `id` is
    /// unmapped or the IRQ has no handler.
    pub fn deliver(&self, id: i32) -> AxResult {
        let Some(mapping) = self.table.by_id(id) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("notification {} has no mapping", id);
            return Err(AxError::NotFound);
        };
        self.dispatch(&mapping, true).map(|_| ())
    }

    /// Signal-context delivery: no logging, no allocation.
    fn deliver_quiet(&self, id: i32) {
        match self.table.by_id(id) {
            Some(mapping) => {
                let _ = self.dispatch(&mapping, false);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn dispatch(&self, mapping: &NotificationMapping, verbose: bool) -> AxResult<bool> {
        let result = if verbose {
            self.interrupts.dispatch(mapping.irq)
        } else {
            self.interrupts.try_dispatch(mapping.irq)
        };
        match result {
            Ok(true) => self.delivered.fetch_add(1, Ordering::Relaxed),
            _ => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Delivers every queued notification in raise order, including any
    /// raised by the handlers themselves. Returns how many reached a handler.
    ///
    /// A no-op under signal delivery.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        while let Some(pending) = self.pending.pop() {
            let mapping = NotificationMapping {
                id: pending.id,
                module: pending.module,
                irq: pending.irq,
            };
            if let Ok(true) = self.dispatch(&mapping, true) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of queued notifications not yet flushed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn mapping(&self, id: i32) -> Option<NotificationMapping> {
        self.table.by_id(id)
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            raised: self.raised.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops delivery: later raises fail, the actions that bound signals had
    /// before [`bind`](Self::bind) are restored, the signal handler is
    /// released and queued notifications are discarded.
    pub fn shutdown(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        let armed: ArrayVec<_, MAX_NOTIFICATIONS> = self.armed.lock().drain(..).collect();
        for (sig, old) in &armed {
            // Ignoring first discards a delivery still pending.
            signal::ignore(*sig);
            signal::restore_handler(*sig, old);
        }
        {
            let _irq = IrqGuard::new();
            let mut active = ACTIVE.write();
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, self)) {
                *active = None;
            }
        }
        let discarded = self.pending.clear();
        if discarded > 0 {
            debug!("discarded {} undelivered notifications", discarded);
        }
    }
}
