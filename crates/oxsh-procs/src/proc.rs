//! Process handles.
//!
//! Every pipeline stage runs behind a [`ProcHandle`]: native child
//! processes here, callable aliases in [`crate::proxies`], and the pumped
//! wrapper in [`crate::pump`]. The orchestrator only ever talks to the
//! trait.
//!
//! Return code convention follows the usual POSIX shape: a process killed
//! by signal N reports `-N`, with the core-dump bit carried separately in
//! [`SignalInfo`].

use std::process::Child;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use oxsh_types::SignalInfo;

use crate::error::ProcsResult;
use crate::readers::SharedOutBuf;

/// What a blocking wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Exited(i32),
    /// Terminating signal number and whether a core was dumped.
    Signaled(i32, bool),
    /// Stopping signal number; the process still exists.
    Stopped(i32),
}

/// One running (or finished) pipeline stage.
pub trait ProcHandle: Send {
    /// OS pid, `None` for in-process callables.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking: the return code once the stage has ended.
    fn poll(&mut self) -> Option<i32>;

    /// Block until the stage ends or stops.
    fn wait(&mut self) -> ProcsResult<WaitResult>;

    /// Bounded wait; `None` when the timeout lapses first.
    fn wait_timeout(&mut self, timeout: Duration) -> ProcsResult<Option<WaitResult>>;

    fn send_signal(&mut self, signal: Signal) -> ProcsResult<()>;

    fn terminate(&mut self) -> ProcsResult<()> {
        self.send_signal(Signal::SIGTERM)
    }

    fn kill(&mut self) -> ProcsResult<()> {
        self.send_signal(Signal::SIGKILL)
    }

    fn returncode(&self) -> Option<i32>;

    /// Set when the stage was ended or stopped by a signal.
    fn signal_info(&self) -> Option<SignalInfo>;

    fn suspended(&self) -> bool {
        false
    }

    fn clear_suspended(&mut self) {}

    /// True while the child drives the terminal's alternate screen.
    fn in_alt_mode(&self) -> bool {
        false
    }

    /// Pump-fed output buffers, when this handle copies its own output.
    fn output_buffers(&self) -> Option<(Arc<SharedOutBuf>, Arc<SharedOutBuf>)> {
        None
    }

    /// Bytes replayed into the stage's stdin, when recorded.
    fn stdin_replay(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Message printed when a foreground pipeline dies to one of the usual
/// fatal signals.
pub fn signal_message(number: i32) -> Option<&'static str> {
    match number {
        libc::SIGABRT => Some("Aborted"),
        libc::SIGFPE => Some("Floating point exception"),
        libc::SIGILL => Some("Illegal instructions"),
        libc::SIGSEGV => Some("Segmentation fault"),
        libc::SIGTERM => Some("Terminated"),
        libc::SIGQUIT => Some("Quit"),
        libc::SIGHUP => Some("Hangup"),
        libc::SIGKILL => Some("Killed"),
        _ => None,
    }
}

/// A spawned OS process, reaped through `waitpid(2)` with `WUNTRACED` so
/// job-control stops are visible.
pub struct NativeProc {
    child: Child,
    pid: Pid,
    returncode: Option<i32>,
    signal_info: Option<SignalInfo>,
    suspended: bool,
}

impl NativeProc {
    pub fn new(child: Child) -> Self {
        let pid = Pid::from_raw(child.id() as libc::pid_t);
        NativeProc {
            child,
            pid,
            returncode: None,
            signal_info: None,
            suspended: false,
        }
    }

    pub fn os_pid(&self) -> Pid {
        self.pid
    }

    /// One `waitpid` round. Records exit and stop state; `None` means the
    /// child is still running (or still stopped).
    fn reap(&mut self, flags: WaitPidFlag) -> ProcsResult<Option<WaitResult>> {
        loop {
            match nix::sys::wait::waitpid(self.pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(WaitStatus::Exited(_, code)) => {
                    self.returncode = Some(code);
                    return Ok(Some(WaitResult::Exited(code)));
                }
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                    let number = signal as i32;
                    self.returncode = Some(-number);
                    self.signal_info = Some(SignalInfo {
                        number,
                        core_dumped,
                    });
                    return Ok(Some(WaitResult::Signaled(number, core_dumped)));
                }
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.suspended = true;
                    return Ok(Some(WaitResult::Stopped(signal as i32)));
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn finished_result(&self) -> Option<WaitResult> {
        let code = self.returncode?;
        Some(match self.signal_info {
            Some(info) => WaitResult::Signaled(info.number, info.core_dumped),
            None => WaitResult::Exited(code),
        })
    }
}

impl ProcHandle for NativeProc {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn poll(&mut self) -> Option<i32> {
        if self.returncode.is_some() {
            return self.returncode;
        }
        let _ = self.reap(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED);
        self.returncode
    }

    fn wait(&mut self) -> ProcsResult<WaitResult> {
        loop {
            if let Some(done) = self.finished_result() {
                return Ok(done);
            }
            if let Some(result) = self.reap(WaitPidFlag::WUNTRACED)? {
                return Ok(result);
            }
        }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> ProcsResult<Option<WaitResult>> {
        if let Some(done) = self.finished_result() {
            return Ok(Some(done));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.reap(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)? {
                return Ok(Some(result));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn send_signal(&mut self, signal: Signal) -> ProcsResult<()> {
        if self.returncode.is_some() {
            return Ok(());
        }
        match nix::sys::signal::kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    fn signal_info(&self) -> Option<SignalInfo> {
        self.signal_info
    }

    fn suspended(&self) -> bool {
        self.suspended
    }

    fn clear_suspended(&mut self) {
        self.suspended = false;
    }
}

impl std::fmt::Debug for NativeProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeProc")
            .field("pid", &self.pid.as_raw())
            .field("returncode", &self.returncode)
            .field("suspended", &self.suspended)
            .finish()
    }
}
