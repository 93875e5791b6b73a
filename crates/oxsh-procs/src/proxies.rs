//! Handles for callable aliases.
//!
//! A callable alias runs inside the session process but still occupies a
//! pipeline stage: it gets the stage's stream slots, produces a return
//! code, and hides behind [`ProcHandle`] like any spawned child.
//!
//! [`ThreadedProxy`] runs the callable on a named worker thread so the
//! orchestrator can drain its output concurrently. [`ForegroundProxy`]
//! defers the callable until the orchestrator blocks in `wait()`, for
//! callables that must own the calling thread (line editors, things that
//! touch the tty directly).

use std::fs::File;
use std::io::{Read, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::debug;

use oxsh_types::{AliasReturn, SignalInfo};

use crate::error::ProcsResult;
use crate::proc::{ProcHandle, WaitResult};
use crate::redirect::StreamSlot;
use crate::session::{AliasCall, CallableAlias};

/// The stage's stream assignments, moved into the proxy at launch.
#[derive(Debug, Default)]
pub struct ProxyStreams {
    pub stdin: Option<StreamSlot>,
    pub stdout: Option<StreamSlot>,
    pub stderr: Option<StreamSlot>,
}

/// Writer that treats a vanished downstream reader as success: the
/// callable keeps "writing" and finishes normally, mirroring how a native
/// `head`-terminated producer exits quietly.
struct SwallowBrokenPipe<W> {
    inner: W,
    broken: bool,
}

impl<W: Write> SwallowBrokenPipe<W> {
    fn new(inner: W) -> Self {
        SwallowBrokenPipe {
            inner,
            broken: false,
        }
    }
}

impl<W: Write> Write for SwallowBrokenPipe<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.broken {
            return Ok(buf.len());
        }
        match self.inner.write(buf) {
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                self.broken = true;
                Ok(buf.len())
            }
            other => other,
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.broken {
            return Ok(());
        }
        match self.inner.flush() {
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                self.broken = true;
                Ok(())
            }
            other => other,
        }
    }
}

fn ensure_newline(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

/// Map a callable's return value onto streams and an exit code.
pub fn parse_proxy_return(
    ret: Result<AliasReturn, String>,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> i32 {
    match ret {
        Ok(AliasReturn::Done) => 0,
        Ok(AliasReturn::Code(code)) => code,
        Ok(AliasReturn::Text(text)) => {
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
            0
        }
        Ok(AliasReturn::Streams { out, err, code }) => {
            if let Some(out) = out {
                let _ = stdout.write_all(out.as_bytes());
                let _ = stdout.flush();
            }
            if let Some(err) = err {
                let _ = stderr.write_all(err.as_bytes());
                let _ = stderr.flush();
            }
            code.unwrap_or(0)
        }
        Err(message) => {
            let _ = stderr.write_all(ensure_newline(&message).as_bytes());
            let _ = stderr.flush();
            1
        }
    }
}

/// Concrete destination for one output stream after merge resolution.
enum WriteTarget {
    RealOut,
    RealErr,
    Owned(File),
}

impl WriteTarget {
    fn from_slot(slot: Option<StreamSlot>, err_side: bool) -> WriteTarget {
        match slot {
            Some(StreamSlot::Pipe(fd)) => WriteTarget::Owned(File::from(fd)),
            Some(StreamSlot::File(file)) => WriteTarget::Owned(file),
            _ if err_side => WriteTarget::RealErr,
            _ => WriteTarget::RealOut,
        }
    }

    /// Second handle onto the same destination, for `2>&1`-style merges.
    fn duplicate(&self) -> WriteTarget {
        match self {
            WriteTarget::RealOut => WriteTarget::RealOut,
            WriteTarget::RealErr => WriteTarget::RealErr,
            WriteTarget::Owned(file) => match file.try_clone() {
                Ok(clone) => WriteTarget::Owned(clone),
                Err(_) => WriteTarget::RealErr,
            },
        }
    }

    fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            WriteTarget::RealOut => Box::new(std::io::stdout()),
            WriteTarget::RealErr => Box::new(std::io::stderr()),
            WriteTarget::Owned(file) => Box::new(file),
        }
    }
}

/// Resolve slots into concrete streams and run the callable to completion.
/// Dropping the writers at the end is what closes the stage's pipe ends,
/// so downstream stages see EOF exactly when the callable finishes.
fn run_alias(callable: &CallableAlias, args: &[String], streams: ProxyStreams) -> i32 {
    let mut stdin: Option<Box<dyn Read + Send>> = match streams.stdin {
        Some(StreamSlot::Pipe(fd)) => Some(Box::new(File::from(fd))),
        Some(StreamSlot::File(file)) => Some(Box::new(file)),
        Some(StreamSlot::Inherit) => Some(Box::new(std::io::stdin())),
        Some(StreamSlot::MergeWithOut) | Some(StreamSlot::MergeWithErr) | None => None,
    };

    let stdout_merges = matches!(streams.stdout, Some(StreamSlot::MergeWithErr));
    let stderr_merges = matches!(streams.stderr, Some(StreamSlot::MergeWithOut));
    let (out_target, err_target) = if stdout_merges {
        let err = WriteTarget::from_slot(streams.stderr, true);
        (err.duplicate(), err)
    } else if stderr_merges {
        let out = WriteTarget::from_slot(streams.stdout, false);
        let dup = out.duplicate();
        (out, dup)
    } else {
        (
            WriteTarget::from_slot(streams.stdout, false),
            WriteTarget::from_slot(streams.stderr, true),
        )
    };

    let mut stdout = SwallowBrokenPipe::new(out_target.into_writer());
    let mut stderr = SwallowBrokenPipe::new(err_target.into_writer());

    let call = AliasCall {
        args,
        stdin: stdin.as_mut().map(|b| &mut **b as &mut dyn Read),
        stdout: &mut stdout,
        stderr: &mut stderr,
    };
    let result = (callable.func)(call);
    let code = parse_proxy_return(result, &mut stdout, &mut stderr);
    let _ = stdout.flush();
    let _ = stderr.flush();
    code
}

/// A callable alias running on its own worker thread.
///
/// The worker cannot be signalled mid-flight, so interrupts latch on the
/// handle instead: the first delivery marks the proxy interrupted and the
/// join reports failure, repeats are no-ops.
pub struct ThreadedProxy {
    name: String,
    thread: Option<JoinHandle<i32>>,
    returncode: Option<i32>,
    interrupted: bool,
}

impl ThreadedProxy {
    pub fn spawn(
        name: &str,
        callable: CallableAlias,
        args: Vec<String>,
        streams: ProxyStreams,
    ) -> Self {
        let thread_name = format!("oxsh-proxy-{name}");
        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_alias(&callable, &args, streams));
        match spawned {
            Ok(handle) => ThreadedProxy {
                name: name.to_string(),
                thread: Some(handle),
                returncode: None,
                interrupted: false,
            },
            Err(err) => {
                debug!(%err, "proxy thread failed to start");
                ThreadedProxy {
                    name: name.to_string(),
                    thread: None,
                    returncode: Some(1),
                    interrupted: false,
                }
            }
        }
    }

    fn join_now(&mut self) {
        if let Some(handle) = self.thread.take() {
            // a panicking alias counts as exit code 1
            let code = handle.join().unwrap_or(1);
            // an interrupted alias reports failure even when it returned cleanly
            self.returncode = Some(if self.interrupted { 1 } else { code });
        }
    }
}

impl ProcHandle for ThreadedProxy {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn poll(&mut self) -> Option<i32> {
        if self.returncode.is_some() {
            return self.returncode;
        }
        if self.thread.as_ref().map_or(true, JoinHandle::is_finished) {
            self.join_now();
        }
        self.returncode
    }

    fn wait(&mut self) -> ProcsResult<WaitResult> {
        self.join_now();
        Ok(WaitResult::Exited(self.returncode.unwrap_or(1)))
    }

    fn wait_timeout(&mut self, timeout: Duration) -> ProcsResult<Option<WaitResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll() {
                return Ok(Some(WaitResult::Exited(code)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn send_signal(&mut self, signal: Signal) -> ProcsResult<()> {
        if self.returncode.is_some() || self.interrupted {
            return Ok(());
        }
        if matches!(
            signal,
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGKILL
        ) {
            self.interrupted = true;
        }
        Ok(())
    }

    fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    fn signal_info(&self) -> Option<SignalInfo> {
        None
    }
}

impl std::fmt::Debug for ThreadedProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedProxy")
            .field("name", &self.name)
            .field("returncode", &self.returncode)
            .field("interrupted", &self.interrupted)
            .finish()
    }
}

/// A callable alias that runs on the orchestrator's thread, inside the
/// first blocking `wait()`.
pub struct ForegroundProxy {
    name: String,
    pending: Option<(CallableAlias, Vec<String>, ProxyStreams)>,
    returncode: Option<i32>,
}

impl ForegroundProxy {
    pub fn new(name: &str, callable: CallableAlias, args: Vec<String>, streams: ProxyStreams) -> Self {
        ForegroundProxy {
            name: name.to_string(),
            pending: Some((callable, args, streams)),
            returncode: None,
        }
    }
}

impl ProcHandle for ForegroundProxy {
    fn pid(&self) -> Option<u32> {
        None
    }

    /// `None` until the orchestrator has run the callable via `wait()`.
    fn poll(&mut self) -> Option<i32> {
        self.returncode
    }

    fn wait(&mut self) -> ProcsResult<WaitResult> {
        if let Some((callable, args, streams)) = self.pending.take() {
            self.returncode = Some(run_alias(&callable, &args, streams));
        }
        Ok(WaitResult::Exited(self.returncode.unwrap_or(1)))
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> ProcsResult<Option<WaitResult>> {
        // the callable runs to completion on this thread; a bound makes no
        // difference once it starts
        self.wait().map(Some)
    }

    fn send_signal(&mut self, _signal: Signal) -> ProcsResult<()> {
        // the callable runs inside `wait()` on the caller's own thread, so
        // a signal either precedes it or finds it already done
        Ok(())
    }

    fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    fn signal_info(&self) -> Option<SignalInfo> {
        None
    }
}

impl std::fmt::Debug for ForegroundProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForegroundProxy")
            .field("name", &self.name)
            .field("returncode", &self.returncode)
            .field("ran", &self.pending.is_none())
            .finish()
    }
}
