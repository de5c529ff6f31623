//! Hand-off between the fault handler and the service thread.
//!
//! The fault handler may not lock anything a normal thread could hold, log,
//! or allocate. It only fills a pre-allocated request slot, wakes the service
//! thread through a pipe and sleeps in `read` on a second pipe until the
//! service thread has filled the response slot. All business logic (routing,
//! model code, logging) runs on the service thread.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use axerrno::{AxError, AxResult, ax_err};
use spin::Mutex;

use super::AccessSink;
use crate::protocol::SimMessage;
use crate::router::MessageRouter;
use crate::signal::{self, IrqGuard};

/// What the fault handler asks of the service thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Submission {
    Access(SimMessage),
    Skipped { pc: usize, len: usize, first_byte: u8 },
    Undecoded { pc: usize, first_byte: u8 },
    Shutdown,
}

/// A one-byte doorbell.
struct Pipe {
    rd: libc::c_int,
    wr: libc::c_int,
}

fn errno() -> libc::c_int {
    // SAFETY: errno is thread-local and always readable.
    unsafe { *libc::__errno_location() }
}

impl Pipe {
    fn new() -> AxResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return ax_err!(BadState, "cannot create hand-off pipe");
        }
        Ok(Self {
            rd: fds[0],
            wr: fds[1],
        })
    }

    /// Async-signal-safe.
    fn ring(&self) {
        let byte = 1u8;
        loop {
            // SAFETY: writes one byte from a valid stack location.
            let n = unsafe { libc::write(self.wr, (&byte as *const u8).cast(), 1) };
            if n == 1 || errno() != libc::EINTR {
                return;
            }
        }
    }

    /// Async-signal-safe. Returns `false` if the pipe is broken.
    fn wait(&self) -> bool {
        let mut byte = 0u8;
        loop {
            // SAFETY: reads one byte into a valid stack location.
            let n = unsafe { libc::read(self.rd, (&mut byte as *mut u8).cast(), 1) };
            if n == 1 {
                return true;
            }
            if n < 0 && errno() == libc::EINTR {
                continue;
            }
            return false;
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this value.
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

pub(crate) struct Handoff {
    /// Serializes faulting threads.
    gate: Mutex<()>,
    request: Mutex<Option<Submission>>,
    response: Mutex<Option<SimMessage>>,
    requests: Pipe,
    responses: Pipe,
}

impl Handoff {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            gate: Mutex::new(()),
            request: Mutex::new(None),
            response: Mutex::new(None),
            requests: Pipe::new()?,
            responses: Pipe::new()?,
        })
    }

    /// Posts `submission` and blocks until the service thread answers.
    ///
    /// Async-signal-safe.
    pub fn exchange(&self, submission: Submission) -> Option<SimMessage> {
        let _gate = self.gate.lock();
        *self.request.lock() = Some(submission);
        self.requests.ring();
        if !self.responses.wait() {
            return None;
        }
        self.response.lock().take()
    }

    fn next(&self) -> Option<Submission> {
        if !self.requests.wait() {
            return None;
        }
        self.request.lock().take()
    }

    fn reply(&self, response: Option<SimMessage>) {
        *self.response.lock() = response;
        self.responses.ring();
    }
}

impl AccessSink for Handoff {
    fn submit(&self, request: &SimMessage) -> Option<SimMessage> {
        self.exchange(Submission::Access(*request))
    }

    fn report_skipped(&self, pc: usize, len: usize, first_byte: u8) {
        self.exchange(Submission::Skipped { pc, len, first_byte });
    }

    fn report_undecoded(&self, pc: usize, first_byte: u8) {
        self.exchange(Submission::Undecoded { pc, first_byte });
    }
}

/// The thread that executes requests posted by the fault handler.
pub(crate) struct ServiceThread {
    handoff: Arc<Handoff>,
    handle: Option<JoinHandle<()>>,
    thread: libc::pthread_t,
}

impl ServiceThread {
    pub fn spawn(handoff: Arc<Handoff>, router: Arc<MessageRouter>) -> AxResult<Self> {
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = handoff.clone();
        let handle = thread::Builder::new()
            .name("mmio-trap-service".into())
            .spawn(move || {
                // Interrupts are delivered to driver threads, never here.
                let _irq = IrqGuard::new();
                let _ = tx.send(signal::current_thread());
                serve(&worker, &router);
            })
            .map_err(|_| AxError::NoMemory)?;
        let thread = rx.recv().map_err(|_| AxError::BadState)?;
        Ok(Self {
            handoff,
            handle: Some(handle),
            thread,
        })
    }

    pub fn thread(&self) -> libc::pthread_t {
        self.thread
    }

    pub fn stop(mut self) {
        self.handoff.exchange(Submission::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(handoff: &Handoff, router: &MessageRouter) {
    debug!("trap service thread running");
    loop {
        match handoff.next() {
            Some(Submission::Access(request)) => {
                let response = router.dispatch(&request);
                trace!(
                    "trapped {:?} {}@{:#x} -> {:#x} (error {})",
                    request.kind,
                    request.module,
                    request.address,
                    response.result(),
                    response.error()
                );
                handoff.reply(Some(response));
            }
            Some(Submission::Skipped { pc, len, first_byte }) => {
                warn!(
                    "skipped unsupported instruction (first byte {:#04x}, {} bytes) at {:#x}",
                    first_byte, len, pc
                );
                handoff.reply(None);
            }
            Some(Submission::Undecoded { pc, first_byte }) => {
                warn!(
                    "undecodable instruction (first byte {:#04x}) at {:#x}, treated as a no-op",
                    first_byte, pc
                );
                handoff.reply(None);
            }
            Some(Submission::Shutdown) | None => {
                handoff.reply(None);
                break;
            }
        }
    }
    debug!("trap service thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceModel;
    use crate::protocol::{AccessWidth, module_name};
    use crate::registry::ModelRegistry;

    struct Echo;

    impl DeviceModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn register_read(&self, addr: usize, _width: AccessWidth) -> u32 {
            addr as u32 ^ 0xffff
        }
        fn register_write(&self, _addr: usize, _width: AccessWidth, _value: u32) -> axerrno::AxResult {
            Ok(())
        }
    }

    #[test]
    fn test_exchange_round_trip_through_service_thread() {
        let registry = Arc::new(ModelRegistry::new());
        registry.register_model(Arc::new(Echo)).unwrap();
        let router = Arc::new(MessageRouter::new(registry));

        let handoff = Arc::new(Handoff::new().unwrap());
        let service = ServiceThread::spawn(handoff.clone(), router).unwrap();
        assert_ne!(service.thread(), signal::current_thread());

        let request = SimMessage::register_read(module_name("echo").unwrap(), 0x10, AccessWidth::Dword)
            .with_id(4);
        let response = handoff.submit(&request).unwrap();
        assert_eq!(response.id, 4);
        assert_eq!(response.result(), 0x10 ^ 0xffff);

        assert!(handoff.exchange(Submission::Skipped { pc: 0, len: 2, first_byte: 1 }).is_none());
        service.stop();
    }
}
