//! Thin wrappers over the POSIX signal calls used for interrupt delivery.
//!
//! Simulated interrupts are real-time signals. Any table that a signal
//! handler reads is written only while the writing thread has the whole
//! real-time range blocked (see [`IrqGuard`]), so a handler can never observe
//! a half-updated table on the thread that is updating it.

use core::mem::MaybeUninit;
use core::ptr;

use axerrno::{AxError, AxResult};

/// Signature of an `SA_SIGINFO` handler.
pub type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// First usable real-time signal.
#[inline]
pub fn rt_min() -> i32 {
    libc::SIGRTMIN()
}

/// Last usable real-time signal.
#[inline]
pub fn rt_max() -> i32 {
    libc::SIGRTMAX()
}

/// Whether `sig` is a real-time signal usable as a notification id.
#[inline]
pub fn is_rt_signal(sig: i32) -> bool {
    (rt_min()..=rt_max()).contains(&sig)
}

/// A signal set containing every real-time signal.
pub fn rt_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the set before any other use.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for sig in rt_min()..=rt_max() {
            libc::sigaddset(set.as_mut_ptr(), sig);
        }
        set.assume_init()
    }
}

/// Installs `handler` for `sig` with the real-time range masked while it runs.
///
/// Returns the previously installed action.
pub fn install_handler(sig: i32, handler: SigInfoHandler, flags: i32) -> AxResult<libc::sigaction> {
    // SAFETY: a zeroed sigaction is a valid "no flags, empty mask" value and
    // both pointers passed to sigaction are valid for the call.
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_mask = rt_sigset();
        action.sa_flags = libc::SA_SIGINFO | flags;
        let mut old: libc::sigaction = core::mem::zeroed();
        if libc::sigaction(sig, &action, &mut old) != 0 {
            return Err(AxError::BadState);
        }
        Ok(old)
    }
}

/// Restores a previously saved action for `sig`.
pub fn restore_handler(sig: i32, old: &libc::sigaction) {
    // SAFETY: `old` was filled in by a successful sigaction call.
    unsafe {
        libc::sigaction(sig, old, ptr::null_mut());
    }
}

/// Makes the process ignore `sig`, discarding anything still pending.
pub fn ignore(sig: i32) {
    // SAFETY: see `install_handler`.
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, ptr::null_mut());
    }
}

/// Opaque handle of the calling thread, usable with [`send`].
#[inline]
pub fn current_thread() -> libc::pthread_t {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() }
}

/// Sends `sig` to `thread`. Async-signal-safe.
#[inline]
pub fn send(thread: libc::pthread_t, sig: i32) -> AxResult {
    // SAFETY: `thread` came from pthread_self of a thread that registered
    // itself as the delivery target.
    match unsafe { libc::pthread_kill(thread, sig) } {
        0 => Ok(()),
        _ => Err(AxError::BadState),
    }
}

/// Blocks every real-time signal on the current thread until dropped.
///
/// Held while writing tables that signal handlers read.
pub struct IrqGuard {
    saved: libc::sigset_t,
}

impl IrqGuard {
    pub fn new() -> Self {
        let set = rt_sigset();
        let mut saved = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: pthread_sigmask fills `saved` with the previous mask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, saved.as_mut_ptr());
            Self {
                saved: saved.assume_init(),
            }
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        // SAFETY: `saved` holds the mask returned by pthread_sigmask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.saved, ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_blocked(sig: i32) -> bool {
        let mut current = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), current.as_mut_ptr());
            libc::sigismember(current.as_ptr(), sig) == 1
        }
    }

    #[test]
    fn test_irq_guard_masks_and_restores() {
        let sig = rt_min() + 3;
        assert!(!is_blocked(sig));
        {
            let _guard = IrqGuard::new();
            assert!(is_blocked(sig));
            assert!(is_blocked(rt_max()));
        }
        assert!(!is_blocked(sig));
    }

    #[test]
    fn test_rt_range() {
        assert!(is_rt_signal(rt_min()));
        assert!(is_rt_signal(rt_max()));
        assert!(!is_rt_signal(libc::SIGSEGV));
        assert!(!is_rt_signal(0));
    }
}
