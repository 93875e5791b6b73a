//! Controlling-terminal handoff and tty mode helpers.
//!
//! Terminal ownership moves between the session's process group and a
//! foreground pipeline's group. The handoff blocks the job-control signals
//! for its duration so the session never stops itself with `SIGTTOU` while
//! calling `tcsetpgrp(3)`.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::termios::{
    self, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
};
use nix::unistd::Pid;
use tracing::{debug, warn};

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// Hand the controlling terminal to `pgid`.
///
/// Returns false when there is no terminal to give, the group is gone, or
/// the descriptor is not a tty. Those are normal in redirected and
/// non-interactive sessions and never raise.
pub fn give_terminal_to(pgid: Pid) -> bool {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTTOU);
    mask.add(Signal::SIGTTIN);
    mask.add(Signal::SIGTSTP);
    mask.add(Signal::SIGCHLD);
    let mut old = SigSet::empty();
    if nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old))
        .is_err()
    {
        return false;
    }

    let stderr = std::io::stderr();
    let result = nix::unistd::tcsetpgrp(stderr.as_fd(), pgid);

    let _ = nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);

    match result {
        Ok(()) => true,
        Err(Errno::ESRCH) | Err(Errno::EINVAL) | Err(Errno::ENOTTY) | Err(Errno::EBADF)
        | Err(Errno::EPERM) => {
            debug!(pgid = pgid.as_raw(), "terminal handoff skipped");
            false
        }
        Err(err) => {
            warn!(pgid = pgid.as_raw(), %err, "terminal handoff failed");
            false
        }
    }
}

/// Take the terminal back for the session's own process group.
pub fn reclaim_terminal() -> bool {
    give_terminal_to(nix::unistd::getpgrp())
}

/// Current window size of `fd`, when it is a tty.
pub fn get_winsize(fd: RawFd) -> Option<libc::winsize> {
    if !is_tty(fd) {
        return None;
    }
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    match unsafe { tiocgwinsz(fd, &mut ws) } {
        Ok(_) => Some(ws),
        Err(_) => None,
    }
}

pub fn set_winsize(fd: RawFd, ws: &libc::winsize) {
    if is_tty(fd) {
        let _ = unsafe { tiocswinsz(fd, ws) };
    }
}

/// Copy the window size from the first real tty among the standard streams
/// onto `fd`. Keeps a pty-backed child in sync with the user's terminal.
pub fn copy_winsize_to(fd: RawFd) {
    for src in [0, 1, 2] {
        if let Some(ws) = get_winsize(src) {
            set_winsize(fd, &ws);
            return;
        }
    }
}

/// Condition a fresh pty slave for capture: turn off `ONLCR` so captured
/// bytes match what the child wrote, keep `ONLRET`, and adopt the real
/// terminal's window size.
pub fn prepare_pty_slave<F: AsFd>(fd: &F) {
    if let Ok(mut term) = termios::tcgetattr(fd) {
        term.output_flags.remove(OutputFlags::ONLCR);
        term.output_flags.insert(OutputFlags::ONLRET);
        let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &term);
    }
    copy_winsize_to(fd.as_fd().as_raw_fd());
}

/// Put the real stdin into character-at-a-time mode while a child drives an
/// alternate screen.
pub fn enable_cbreak() {
    let stdin = std::io::stdin();
    if !is_tty(stdin.as_fd().as_raw_fd()) {
        return;
    }
    if let Ok(mut term) = termios::tcgetattr(stdin.as_fd()) {
        term.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON);
        term.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        term.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &term);
    }
}

/// Undo [`enable_cbreak`].
pub fn disable_cbreak() {
    let stdin = std::io::stdin();
    if !is_tty(stdin.as_fd().as_raw_fd()) {
        return;
    }
    if let Ok(mut term) = termios::tcgetattr(stdin.as_fd()) {
        term.local_flags
            .insert(LocalFlags::ECHO | LocalFlags::ICANON);
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &term);
    }
}

/// Disables the terminal's suspend character (usually ^Z) so suspension
/// flows through the session's own `SIGTSTP` handler instead of stopping
/// reader threads mid-copy. Restores the saved character on drop.
pub struct SuspendKeyGuard {
    saved: Option<Termios>,
}

impl SuspendKeyGuard {
    pub fn install() -> Self {
        let stdin = std::io::stdin();
        if !is_tty(stdin.as_fd().as_raw_fd()) {
            return SuspendKeyGuard { saved: None };
        }
        match termios::tcgetattr(stdin.as_fd()) {
            Ok(orig) => {
                let mut muted = orig.clone();
                muted.control_chars[SpecialCharacterIndices::VSUSP as usize] = 0;
                let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &muted);
                SuspendKeyGuard { saved: Some(orig) }
            }
            Err(_) => SuspendKeyGuard { saved: None },
        }
    }
}

impl Drop for SuspendKeyGuard {
    fn drop(&mut self) {
        if let Some(orig) = self.saved.take() {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &orig);
        }
    }
}
