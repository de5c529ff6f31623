//! Top-level assembly of the engine.

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::AxResult;

use crate::config::{ConfigEntry, ConfigReport, RangeBacking, SimConfig};
use crate::device::DeviceModel;
use crate::irq::InterruptTable;
use crate::notify::{AsyncDelivery, DeliveryMethod, DeviceNotifier};
use crate::protocol::SimMessage;
use crate::registry::ModelRegistry;
use crate::router::MessageRouter;
use crate::trap::{FaultDecoder, FaultOutcome, TrapError, TrapLayer};
use crate::wrapper::ModelId;

/// Owns every component and wires them together.
///
/// The thread that creates the simulator is the interrupt target: under
/// [`DeliveryMethod::Signal`] handlers run on it, asynchronously; under
/// [`DeliveryMethod::Queued`] they run wherever pending notifications are
/// flushed.
pub struct Simulator {
    registry: Arc<ModelRegistry>,
    router: Arc<MessageRouter>,
    interrupts: Arc<InterruptTable>,
    delivery: Arc<AsyncDelivery>,
    trap: Arc<TrapLayer>,
    shut_down: AtomicBool,
}

impl Simulator {
    pub fn new(method: DeliveryMethod) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone()));
        let interrupts = Arc::new(InterruptTable::new());
        let delivery = Arc::new(AsyncDelivery::new(method, interrupts.clone()));
        let trap = Arc::new(TrapLayer::new(router.clone(), delivery.clone()));
        debug!("simulator created ({:?} delivery)", method);
        Self {
            registry,
            router,
            interrupts,
            delivery,
            trap,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Creates a simulator with `config.delivery` and applies `config`.
    pub fn with_config(config: &SimConfig) -> (Self, ConfigReport) {
        let sim = Self::new(config.delivery);
        let report = sim.configure(config);
        (sim, report)
    }

    /// Applies ranges, then notification mappings, in order.
    ///
    /// A rejected entry does not stop the others; the report lists it.
    pub fn configure(&self, config: &SimConfig) -> ConfigReport {
        if config.delivery != self.delivery.method() {
            warn!(
                "configured for {:?} delivery but running {:?}",
                config.delivery,
                self.delivery.method()
            );
        }
        let mut report = ConfigReport::default();
        for range in &config.ranges {
            let outcome = match range.backing {
                RangeBacking::Reserved => {
                    self.trap.reserve_range(range.start, range.end, &range.module)
                }
                RangeBacking::Recorded => {
                    self.trap.record_range(range.start, range.end, &range.module)
                }
            };
            report.record(ConfigEntry::Range(range.clone()), outcome);
        }
        for notification in &config.notifications {
            let outcome =
                self.delivery
                    .bind(notification.id, &notification.module, notification.irq);
            report.record(ConfigEntry::Notification(notification.clone()), outcome);
        }
        info!(
            "configuration applied: {} entries, {} rejected",
            report.applied,
            report.rejected.len()
        );
        report
    }

    /// The handle a model uses to raise its interrupts.
    pub fn notifier(&self, module: &str) -> AxResult<Arc<DeviceNotifier>> {
        Ok(Arc::new(DeviceNotifier::new(module, self.delivery.clone())?))
    }

    pub fn register_model(&self, model: Arc<dyn DeviceModel>) -> AxResult<ModelId> {
        self.registry.register_model(model)
    }

    /// Installs `handler` for `irq`, enabled.
    pub fn register_interrupt<F>(&self, irq: u32, handler: F) -> AxResult
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.interrupts.register(irq, Arc::new(handler))
    }

    pub fn enable_interrupt(&self, irq: u32) -> AxResult {
        self.interrupts.enable(irq)
    }

    pub fn disable_interrupt(&self, irq: u32) -> AxResult {
        self.interrupts.disable(irq)
    }

    /// Routes an explicit request (register access, clock, reset or interrupt
    /// acknowledge) and returns the response. Under queued delivery, pending
    /// interrupts are delivered afterwards.
    pub fn dispatch(&self, request: &SimMessage) -> SimMessage {
        let response = self.router.dispatch(request);
        if self.delivery.method() == DeliveryMethod::Queued {
            self.delivery.flush();
        }
        response
    }

    /// Processes a fault without signals; see [`TrapLayer::service_with`].
    pub fn service_with<D: FaultDecoder>(
        &self,
        decoder: &D,
        fault_addr: usize,
        code: &[u8],
        regs: &mut D::Registers,
    ) -> Result<FaultOutcome, TrapError> {
        self.trap.service_with(decoder, fault_addr, code, regs)
    }

    /// Processes a fault without signals, using the native decoder.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub fn service(
        &self,
        fault_addr: usize,
        code: &[u8],
        regs: &mut crate::trap::Registers,
    ) -> Result<FaultOutcome, TrapError> {
        self.trap.service(fault_addr, code, regs)
    }

    /// Installs the fault handler so native accesses to reserved ranges are
    /// emulated.
    pub fn start_trapping(&self) -> AxResult {
        self.trap.install()
    }

    /// Delivers queued notifications on the calling thread.
    pub fn flush(&self) -> usize {
        self.delivery.flush()
    }

    /// Removes the fault handler, stops the service thread, cleans up the
    /// models in registration order, stops interrupt delivery and releases
    /// the reservations. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.trap.uninstall();
        // Models stop their threads before delivery gives the signals back.
        self.registry.shutdown();
        self.delivery.shutdown();
        self.trap.release();
        info!("simulator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn interrupts(&self) -> &Arc<InterruptTable> {
        &self.interrupts
    }

    pub fn delivery(&self) -> &Arc<AsyncDelivery> {
        &self.delivery
    }

    pub fn trap(&self) -> &Arc<TrapLayer> {
        &self.trap
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
