//! Threaded native processes.
//!
//! A [`PumpedProc`] wraps a spawned child whose output streams were routed
//! through capture descriptors. A pump thread copies those descriptors into
//! shared in-memory buffers while the child runs, so the child never blocks
//! on a full pipe and the orchestrator can surface output lines while other
//! work happens.
//!
//! Full-screen programs are the exception: when the child emits an
//! alternate-screen switch (`ESC [ ? 1049/47/1047 h`), copied bytes go
//! straight to the real terminal until the matching `l` sequence leaves the
//! alternate screen. The switch sequences themselves always reach the
//! terminal.

use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

use oxsh_types::SignalInfo;

use crate::error::ProcsResult;
use crate::proc::{NativeProc, ProcHandle, WaitResult};
use crate::readers::{QueueReader, SharedOutBuf, READ_CHUNK_SIZE};
use crate::signals::{self, SignalGuard};
use crate::terminal::{self, SuspendKeyGuard};

static ALT_SWITCH: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r"(?-u)\x1b\[\?(1049|1047|47)([hl])").expect("fixed pattern compiles")
});

/// Geometric backoff cap for the pump's idle sleep.
const BACKOFF_CAP: u32 = 1000;

/// Parent-side capture descriptors handed to the pump.
#[derive(Debug, Default)]
pub struct PumpStreams {
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    /// Duplicate of the pty master when the child runs on a pty; used to
    /// forward window-size changes.
    pub pty_winsize: Option<OwnedFd>,
}

/// Copy a redirected stdin through a fresh pipe, recording the bytes.
///
/// Returns the read end to wire into the child and the replay buffer. The
/// copy thread exits on source EOF or when the child stops reading.
pub fn stdin_tee(source: OwnedFd) -> ProcsResult<(OwnedFd, Arc<SharedOutBuf>)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    let replay = SharedOutBuf::new();
    let thread_replay = Arc::clone(&replay);
    let builder = thread::Builder::new().name("oxsh-stdin-tee".to_string());
    builder
        .spawn(move || {
            let mut src = std::fs::File::from(source);
            let mut sink = std::fs::File::from(write_end);
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match std::io::Read::read(&mut src, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        thread_replay.write_all(&buf[..n]);
                        if sink.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
            thread_replay.close();
        })
        .map_err(|err| crate::error::ProcsError::Io(err.to_string()))?;
    Ok((read_end, replay))
}

struct PumpWorker {
    stdout: Option<QueueReader>,
    stderr: Option<QueueReader>,
    stdout_buf: Arc<SharedOutBuf>,
    stderr_buf: Arc<SharedOutBuf>,
    alt_mode: Arc<AtomicBool>,
    interactive: bool,
    pty_winsize: Option<OwnedFd>,
    child: Pid,
    timeout: Duration,
}

impl PumpWorker {
    fn run(mut self) {
        if let Some(fd) = &self.pty_winsize {
            terminal::copy_winsize_to(fd.as_raw_fd());
        }
        let mut cnt: u32 = 1;
        loop {
            let mut moved = false;
            if let Some(reader) = self.stdout.as_mut() {
                let chunk = reader.read_available();
                if !chunk.is_empty() {
                    moved = true;
                    route_chunk(
                        &chunk,
                        &self.stdout_buf,
                        &mut std::io::stdout(),
                        &self.alt_mode,
                        self.interactive,
                    );
                }
            }
            if let Some(reader) = self.stderr.as_mut() {
                let chunk = reader.read_available();
                if !chunk.is_empty() {
                    moved = true;
                    route_chunk(
                        &chunk,
                        &self.stderr_buf,
                        &mut std::io::stderr(),
                        &self.alt_mode,
                        self.interactive,
                    );
                }
            }

            if self.interactive && signals::take_winch() {
                if let Some(fd) = &self.pty_winsize {
                    terminal::copy_winsize_to(fd.as_raw_fd());
                }
                let _ = nix::sys::signal::kill(self.child, Signal::SIGWINCH);
            }

            let out_done = self.stdout.as_mut().map_or(true, QueueReader::is_fully_read);
            let err_done = self.stderr.as_mut().map_or(true, QueueReader::is_fully_read);
            if out_done && err_done {
                break;
            }

            if moved {
                cnt = 1;
            } else {
                cnt = (cnt + 1).min(BACKOFF_CAP);
                thread::sleep(self.timeout * cnt);
            }
        }
        self.stdout_buf.close();
        self.stderr_buf.close();
        if self.alt_mode.load(Ordering::SeqCst) {
            // child died inside the alternate screen; undo our tty tweak
            self.alt_mode.store(false, Ordering::SeqCst);
            if self.interactive {
                terminal::disable_cbreak();
            }
        }
        debug!(child = self.child.as_raw(), "pump finished");
    }
}

/// Copy one chunk, honoring alternate-screen switches embedded in it.
fn route_chunk(
    chunk: &[u8],
    buf: &SharedOutBuf,
    real: &mut dyn Write,
    alt_mode: &AtomicBool,
    interactive: bool,
) {
    let mut rest = chunk;
    loop {
        let Some(caps) = ALT_SWITCH.captures(rest) else {
            write_part(rest, buf, real, alt_mode);
            return;
        };
        let Some(whole) = caps.get(0) else {
            write_part(rest, buf, real, alt_mode);
            return;
        };
        let entering = caps.get(2).is_some_and(|m| m.as_bytes() == b"h");

        write_part(&rest[..whole.start()], buf, real, alt_mode);
        let _ = real.write_all(&rest[whole.start()..whole.end()]);
        let _ = real.flush();
        alt_mode.store(entering, Ordering::SeqCst);
        if interactive {
            if entering {
                terminal::enable_cbreak();
            } else {
                terminal::disable_cbreak();
            }
        }
        rest = &rest[whole.end()..];
    }
}

fn write_part(part: &[u8], buf: &SharedOutBuf, real: &mut dyn Write, alt_mode: &AtomicBool) {
    if part.is_empty() {
        return;
    }
    if alt_mode.load(Ordering::SeqCst) {
        let _ = real.write_all(part);
        let _ = real.flush();
    } else {
        buf.write_all(part);
    }
}

/// A native child plus the pump thread feeding its output buffers.
pub struct PumpedProc {
    inner: NativeProc,
    stdout_buf: Arc<SharedOutBuf>,
    stderr_buf: Arc<SharedOutBuf>,
    alt_mode: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    signal_guard: Option<SignalGuard>,
    suspend_guard: Option<SuspendKeyGuard>,
    stdin_replay: Option<Arc<SharedOutBuf>>,
}

impl PumpedProc {
    pub fn new(
        child: std::process::Child,
        streams: PumpStreams,
        pipeline_group: Option<Pid>,
        interactive: bool,
        poll_timeout: Duration,
        stdin_replay: Option<Arc<SharedOutBuf>>,
    ) -> Self {
        let inner = NativeProc::new(child);
        let pid = inner.os_pid();
        let stdout_buf = SharedOutBuf::new();
        let stderr_buf = SharedOutBuf::new();
        let alt_mode = Arc::new(AtomicBool::new(false));

        let signal_guard = if interactive && signals::on_main_thread() {
            SignalGuard::install(true).ok()
        } else {
            None
        };
        let suspend_guard = signal_guard.as_ref().map(|_| SuspendKeyGuard::install());
        if signal_guard.is_some() {
            // with no earlier group this child led its own, so its pid is
            // the pgid
            signals::set_forward_target(Some(pipeline_group.unwrap_or(pid)));
        }

        let worker = PumpWorker {
            stdout: streams
                .stdout
                .map(|fd| QueueReader::from_fd(fd, poll_timeout)),
            stderr: streams
                .stderr
                .map(|fd| QueueReader::from_fd(fd, poll_timeout)),
            stdout_buf: Arc::clone(&stdout_buf),
            stderr_buf: Arc::clone(&stderr_buf),
            alt_mode: Arc::clone(&alt_mode),
            interactive,
            pty_winsize: streams.pty_winsize,
            child: pid,
            timeout: poll_timeout,
        };
        let pump = thread::Builder::new()
            .name("oxsh-pump".to_string())
            .spawn(move || worker.run())
            .ok();
        if pump.is_none() {
            stdout_buf.close();
            stderr_buf.close();
        }

        PumpedProc {
            inner,
            stdout_buf,
            stderr_buf,
            alt_mode,
            pump,
            signal_guard,
            suspend_guard,
            stdin_replay,
        }
    }

    /// Drop signal state without joining the pump; used when the child
    /// stopped rather than exited.
    fn release_guards(&mut self) {
        self.signal_guard = None;
        self.suspend_guard = None;
    }

    /// Join the pump after the child ended, so the buffers hold everything
    /// the child wrote.
    fn settle(&mut self) {
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
        self.release_guards();
    }
}

impl ProcHandle for PumpedProc {
    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    fn poll(&mut self) -> Option<i32> {
        self.inner.poll()
    }

    fn wait(&mut self) -> ProcsResult<WaitResult> {
        let result = self.inner.wait()?;
        match result {
            WaitResult::Stopped(_) => self.release_guards(),
            _ => self.settle(),
        }
        Ok(result)
    }

    fn wait_timeout(&mut self, timeout: Duration) -> ProcsResult<Option<WaitResult>> {
        let result = self.inner.wait_timeout(timeout)?;
        match result {
            Some(WaitResult::Stopped(_)) => self.release_guards(),
            Some(_) => self.settle(),
            None => {}
        }
        Ok(result)
    }

    fn send_signal(&mut self, signal: Signal) -> ProcsResult<()> {
        self.inner.send_signal(signal)
    }

    fn returncode(&self) -> Option<i32> {
        self.inner.returncode()
    }

    fn signal_info(&self) -> Option<SignalInfo> {
        self.inner.signal_info()
    }

    fn suspended(&self) -> bool {
        self.inner.suspended()
    }

    fn clear_suspended(&mut self) {
        self.inner.clear_suspended();
    }

    fn in_alt_mode(&self) -> bool {
        self.alt_mode.load(Ordering::SeqCst)
    }

    fn output_buffers(&self) -> Option<(Arc<SharedOutBuf>, Arc<SharedOutBuf>)> {
        Some((Arc::clone(&self.stdout_buf), Arc::clone(&self.stderr_buf)))
    }

    fn stdin_replay(&self) -> Option<Vec<u8>> {
        self.stdin_replay.as_ref().map(|buf| buf.contents())
    }
}

impl std::fmt::Debug for PumpedProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpedProc")
            .field("inner", &self.inner)
            .field("alt_mode", &self.alt_mode.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
