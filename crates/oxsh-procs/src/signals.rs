//! Signal forwarding for foreground pipelines.
//!
//! While a captured foreground pipeline runs, the session wants `SIGINT`,
//! `SIGTSTP` and `SIGQUIT` delivered to the children rather than tearing
//! down the shell. Handlers installed here do only async-signal-safe work:
//! forward the signal to the registered process group with `killpg(2)` so
//! every pipeline stage sees it at once, or latch an atomic resize flag
//! that the pump thread polls. The resulting state changes surface through
//! `waitpid(2)` like any other.
//!
//! [`SignalGuard`] saves the previous dispositions and restores them on
//! drop, so every exit path (including panics in the drain) puts the
//! handlers back. Guards nest LIFO when pipelines nest. Install only from
//! the main thread.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::ProcsResult;

static WINCH_PENDING: AtomicBool = AtomicBool::new(false);
static FORWARD_PGID: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_forward(sig: libc::c_int) {
    forward(sig);
}

extern "C" fn on_sigwinch(_sig: libc::c_int) {
    WINCH_PENDING.store(true, Ordering::SeqCst);
}

fn forward(sig: libc::c_int) {
    let pgid = FORWARD_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        unsafe {
            libc::killpg(pgid, sig);
        }
    }
}

/// Point the forwarding handlers at a pipeline's process group, or clear
/// with `None`.
pub fn set_forward_target(pgid: Option<Pid>) {
    FORWARD_PGID.store(pgid.map_or(0, Pid::as_raw), Ordering::SeqCst);
}

/// Consume a pending terminal-resize notification.
pub fn take_winch() -> bool {
    WINCH_PENDING.swap(false, Ordering::SeqCst)
}

/// True when the calling thread is the process main thread.
pub fn on_main_thread() -> bool {
    #[cfg(target_os = "linux")]
    {
        nix::unistd::gettid().as_raw() == nix::unistd::getpid().as_raw()
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::thread::current().name() == Some("main")
    }
}

/// Installed forwarding handlers, restored on drop.
pub struct SignalGuard {
    saved: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    /// Install forwarding handlers for `SIGINT`, `SIGTSTP` and `SIGQUIT`,
    /// plus `SIGWINCH` tracking when asked for.
    pub fn install(with_winch: bool) -> ProcsResult<Self> {
        let mut guard = SignalGuard { saved: Vec::new() };
        guard.hook(Signal::SIGINT, SigHandler::Handler(on_forward))?;
        guard.hook(Signal::SIGTSTP, SigHandler::Handler(on_forward))?;
        guard.hook(Signal::SIGQUIT, SigHandler::Handler(on_forward))?;
        if with_winch {
            guard.hook(Signal::SIGWINCH, SigHandler::Handler(on_sigwinch))?;
        }
        Ok(guard)
    }

    fn hook(&mut self, signal: Signal, handler: SigHandler) -> ProcsResult<()> {
        let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
        let old = unsafe { nix::sys::signal::sigaction(signal, &action) }?;
        self.saved.push((signal, old));
        Ok(())
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // restore in reverse install order
        while let Some((signal, old)) = self.saved.pop() {
            let _ = unsafe { nix::sys::signal::sigaction(signal, &old) };
        }
        set_forward_target(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winch_flag_latches_and_clears() {
        WINCH_PENDING.store(true, Ordering::SeqCst);
        assert!(take_winch());
        assert!(!take_winch());
    }

    #[test]
    fn forward_target_roundtrip() {
        set_forward_target(Some(Pid::from_raw(12345)));
        assert_eq!(FORWARD_PGID.load(Ordering::SeqCst), 12345);
        set_forward_target(None);
        assert_eq!(FORWARD_PGID.load(Ordering::SeqCst), 0);
    }
}
