//! The process-wide `SIGSEGV` handler.

use std::sync::Arc;

use axerrno::{AxResult, ax_err};
use memory_addr::align_up_4k;
use spin::{Mutex, RwLock};

use super::decoder::{FaultDecoder, MAX_INSN_LEN};
use super::handoff::Handoff;
use super::range::code_at;
use super::x86_64::X86Decoder;
use super::{TrapError, TrapLayer};
use crate::signal::{self, IrqGuard};

/// Everything the handler needs, published before the handler is installed.
pub(crate) struct FaultHook {
    pub trap: Arc<TrapLayer>,
    pub handoff: Arc<Handoff>,
    pub service_thread: libc::pthread_t,
}

static FAULT_HOOK: RwLock<Option<Arc<FaultHook>>> = RwLock::new(None);
static PREVIOUS: Mutex<Option<libc::sigaction>> = Mutex::new(None);

pub(crate) fn install(hook: FaultHook) -> AxResult {
    {
        let _irq = IrqGuard::new();
        let mut slot = FAULT_HOOK.write();
        if slot.is_some() {
            return ax_err!(ResourceBusy, "a fault handler is already installed");
        }
        *slot = Some(Arc::new(hook));
    }
    match signal::install_handler(libc::SIGSEGV, on_fault, libc::SA_ONSTACK) {
        Ok(old) => {
            *PREVIOUS.lock() = Some(old);
            Ok(())
        }
        Err(err) => {
            *FAULT_HOOK.write() = None;
            Err(err)
        }
    }
}

pub(crate) fn uninstall() {
    if let Some(old) = PREVIOUS.lock().take() {
        signal::restore_handler(libc::SIGSEGV, &old);
    }
    let _irq = IrqGuard::new();
    *FAULT_HOOK.write() = None;
}

/// Writes `msg` and `value` to stderr and exits without unwinding.
fn fatal(msg: &[u8], value: usize) -> ! {
    let mut hex = [0u8; 19];
    hex[0] = b'0';
    hex[1] = b'x';
    for (i, byte) in hex[2..18].iter_mut().enumerate() {
        let nibble = (value >> ((15 - i) * 4)) & 0xf;
        *byte = b"0123456789abcdef"[nibble];
    }
    hex[18] = b'\n';
    // SAFETY: write and _exit are async-signal-safe; both buffers are valid.
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, hex.as_ptr().cast(), hex.len());
        libc::_exit(1)
    }
}

/// How many instruction bytes at `pc` can be read without faulting again.
fn readable_code_len(pc: usize) -> usize {
    let page_end = align_up_4k(pc + 1);
    if page_end - pc >= MAX_INSN_LEN {
        return MAX_INSN_LEN;
    }
    let mut resident = 0u8;
    // SAFETY: mincore only inspects the mapping; it fails with ENOMEM if the
    // next page is unmapped.
    let mapped = unsafe { libc::mincore(page_end as *mut libc::c_void, 1, &mut resident) } == 0;
    if mapped { MAX_INSN_LEN } else { page_end - pc }
}

extern "C" fn on_fault(_sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // SAFETY: the kernel passes valid siginfo and ucontext pointers to an
    // SA_SIGINFO handler.
    let saved_errno = unsafe { *libc::__errno_location() };
    let fault_addr = unsafe { (*info).si_addr() } as usize;

    let Some(hook) = FAULT_HOOK.read().clone() else {
        fatal(b"mmio-trap: segmentation fault outside any trap layer at ", fault_addr);
    };
    if signal::current_thread() == hook.service_thread {
        fatal(b"mmio-trap: fault on the trap service thread at ", fault_addr);
    }

    let uc = ctx.cast::<libc::ucontext_t>();
    let regs = unsafe { &mut (*uc).uc_mcontext.gregs };
    let pc = X86Decoder.pc(regs);
    // SAFETY: the faulting instruction is mapped code; readable_code_len
    // stops at an unmapped page boundary.
    let code = unsafe { code_at(pc, readable_code_len(pc)) };

    match hook.trap.handle(&X86Decoder, hook.handoff.as_ref(), fault_addr, code, regs) {
        // An undecodable instruction leaves the PC alone and faults again.
        Ok(_) => {}
        Err(TrapError::UnknownAddress(addr)) => {
            fatal(b"mmio-trap: access to an unmapped address ", addr)
        }
        Err(TrapError::RouterFailure { .. }) => {
            fatal(b"mmio-trap: register access failed at ", fault_addr)
        }
    }
    unsafe { *libc::__errno_location() = saved_errno };
}
