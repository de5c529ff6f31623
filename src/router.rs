//! Message router: turns a structured request into a model capability call.

use std::sync::Arc;

use axerrno::{AxError, AxResult};

use crate::protocol::{MessageKind, Payload, SimMessage};
use crate::registry::ModelRegistry;

/// Routes requests to the model named in the request.
pub struct MessageRouter {
    registry: Arc<ModelRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Dispatches `request` and always returns a response with the same
    /// correlation id.
    ///
    /// Failures (unknown module, unsupported kind, model error) are reported
    /// through the response's error field.
    pub fn dispatch(&self, request: &SimMessage) -> SimMessage {
        let outcome = self.route(request);
        if let Err(err) = outcome {
            debug!(
                "request {} to {} ({:?}) failed: {:?}",
                request.id, request.module, request.kind, err
            );
        } else {
            trace!("request {} to {} ({:?}) ok", request.id, request.module, request.kind);
        }
        SimMessage::response_to(request, outcome)
    }

    /// Like [`dispatch`](Self::dispatch) but hands back the outcome directly.
    pub fn call(&self, request: &SimMessage) -> AxResult<u32> {
        self.route(request)
    }

    fn route(&self, request: &SimMessage) -> AxResult<u32> {
        let model = self
            .registry
            .lookup(&request.module)
            .ok_or(AxError::NotFound)?;

        match (request.kind, request.payload) {
            (MessageKind::RegisterRead, _) => model.read(request.address, request.width),
            (MessageKind::RegisterWrite, _) => model
                .write(request.address, request.width, request.value)
                .map(|_| 0),
            (MessageKind::Clock, Payload::Clock { action, cycles }) => {
                model.clock(action, cycles).map(|_| 0)
            }
            (MessageKind::Reset, Payload::Reset { action }) => model.reset(action).map(|_| 0),
            (MessageKind::Interrupt, Payload::Interrupt { irq }) => {
                model.interrupt(irq).map(|_| 0)
            }
            _ => Err(AxError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceModel;
    use crate::protocol::{AccessWidth, ClockAction, ModuleName, module_name};
    use spin::Mutex;

    #[derive(Default)]
    struct Recorder {
        regs: Mutex<[u32; 4]>,
        ticks: Mutex<u32>,
    }

    impl DeviceModel for Recorder {
        fn name(&self) -> &str {
            "rec"
        }
        fn clock(&self, action: ClockAction, cycles: u32) -> AxResult {
            if action == ClockAction::Tick {
                *self.ticks.lock() += cycles;
            }
            Ok(())
        }
        fn register_read(&self, addr: usize, _width: AccessWidth) -> u32 {
            self.regs.lock().get(addr / 4).copied().unwrap_or(0)
        }
        fn register_write(&self, addr: usize, _width: AccessWidth, value: u32) -> AxResult {
            let mut regs = self.regs.lock();
            let slot = regs.get_mut(addr / 4).ok_or(AxError::NotFound)?;
            *slot = value;
            Ok(())
        }
    }

    fn router() -> (MessageRouter, Arc<Recorder>) {
        let registry = Arc::new(ModelRegistry::new());
        let model = Arc::new(Recorder::default());
        registry.register_model(model.clone()).unwrap();
        (MessageRouter::new(registry), model)
    }

    fn rec() -> ModuleName {
        module_name("rec").unwrap()
    }

    #[test]
    fn test_dispatch_write_then_read() {
        let (router, _) = router();
        let write = SimMessage::register_write(rec(), 4, 0xabcd, AccessWidth::Dword).with_id(1);
        let resp = router.dispatch(&write);
        assert!(resp.is_ok());
        assert_eq!(resp.id, 1);

        let read = SimMessage::register_read(rec(), 4, AccessWidth::Dword).with_id(2);
        let resp = router.dispatch(&read);
        assert_eq!(resp.result(), 0xabcd);
        assert_eq!(resp.id, 2);
    }

    #[test]
    fn test_dispatch_unknown_module() {
        let (router, _) = router();
        let req = SimMessage::register_read(module_name("nope").unwrap(), 0, AccessWidth::Dword)
            .with_id(5);
        let resp = router.dispatch(&req);
        assert!(resp.error() < 0);
        assert_eq!(resp.id, 5);
    }

    #[test]
    fn test_dispatch_model_error() {
        let (router, _) = router();
        let req = SimMessage::register_write(rec(), 0x100, 1, AccessWidth::Dword);
        assert!(router.dispatch(&req).error() < 0);
    }

    #[test]
    fn test_dispatch_clock() {
        let (router, model) = router();
        let req = SimMessage::clock(rec(), ClockAction::Tick, 3);
        assert!(router.dispatch(&req).is_ok());
        assert_eq!(*model.ticks.lock(), 3);
    }

    #[test]
    fn test_response_is_rejected_as_request() {
        let (router, _) = router();
        let req = SimMessage::register_read(rec(), 0, AccessWidth::Dword);
        let resp = router.dispatch(&req);
        assert_eq!(router.call(&resp), Err(AxError::Unsupported));
    }
}
