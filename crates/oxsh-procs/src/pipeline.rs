//! The command pipeline orchestrator.
//!
//! A [`CommandPipeline`] owns every launched stage of one pipeline: the
//! specs, the process handles, and the capture state. Its lifecycle is
//! `Constructed -> Running -> (Suspended <-> Running) -> Ended`:
//!
//! - construction launches the stages strictly in order, electing the first
//!   native stage's pid as the pipeline's process group and (interactive,
//!   foreground) handing it the terminal;
//! - [`end`](CommandPipeline::end) drains the last stage's captured output
//!   to completion, waits for it, and runs the close/bookkeeping sequence;
//! - a job-control stop leaves the pipeline suspended instead of ended, and
//!   [`resume`](CommandPipeline::resume) continues it.
//!
//! Draining takes one of two shapes. Non-streaming captures (plain string
//! capture, or a stage that cannot be driven from another thread) block in
//! `wait` and then read everything at once. Streaming captures poll the
//! last stage's output sources in a backoff loop, echoing lines as they
//! arrive; for multi-stage pipelines the loop only trusts "upstream looks
//! finished" after a debounce window, so slow-starting upstream tools are
//! not cut off.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use oxsh_types::{CaptureKind, DecodePolicy, SignalInfo};

use crate::error::{ProcsError, ProcsResult};
use crate::proc::{self, ProcHandle, WaitResult};
use crate::readers::{QueueReader, SharedOutBuf, READ_CHUNK_SIZE};
use crate::session::SessionContext;
use crate::signals;
use crate::spec::SubprocSpec;
use crate::terminal;
use crate::text;

/// How long upstream stages must look finished before the drain loop
/// believes them.
const PIPELINE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Idle iterations multiply the poll timeout up to this factor.
const BACKOFF_CAP: u32 = 1000;

/// Nap taken while the child owns the alternate screen.
const ALT_MODE_NAP: Duration = Duration::from_millis(100);

/// Where the last stage's captured bytes come from.
enum DrainSource {
    /// Pump-thread buffer owned by a [`crate::pump::PumpedProc`].
    Buf(Arc<SharedOutBuf>),
    /// Reader thread over a raw capture descriptor.
    Reader(QueueReader),
}

impl DrainSource {
    fn read_lines(&mut self) -> Vec<Vec<u8>> {
        match self {
            DrainSource::Buf(buf) => buf.read_lines_available(),
            DrainSource::Reader(reader) => reader.read_lines_available(READ_CHUNK_SIZE),
        }
    }

    /// Non-blocking sweep of whatever is queued right now.
    fn read_available(&mut self) -> Vec<u8> {
        match self {
            DrainSource::Buf(buf) => buf.read_available(),
            DrainSource::Reader(reader) => reader.read_available(),
        }
    }

    /// Everything left. Only called once the writers are gone, so the
    /// reader variant's blocking read terminates promptly.
    fn read_remaining(&mut self) -> Vec<u8> {
        match self {
            DrainSource::Buf(buf) => buf.read_available(),
            DrainSource::Reader(reader) => reader.read_to_end(),
        }
    }
}

/// All launched stages of one pipeline, plus its captured output.
pub struct CommandPipeline {
    ctx: SessionContext,
    specs: Vec<SubprocSpec>,
    procs: Vec<Box<dyn ProcHandle>>,
    launch_error: Option<ProcsError>,
    captured: CaptureKind,
    background: bool,
    /// First native stage's pid; the process group id when interactive.
    pipeline_group: Option<Pid>,
    /// Process group currently holding the terminal, when we moved it.
    term_pgid: Option<Pid>,
    stdout_src: Option<DrainSource>,
    stderr_src: Option<DrainSource>,
    /// Cleaned decoded output lines, endings kept.
    lines: Vec<String>,
    raw_output: Vec<u8>,
    raw_error: Vec<u8>,
    errors: Option<String>,
    /// Replayed stdin, when the session records it.
    input: Option<String>,
    pub starttime: SystemTime,
    pub endtime: Option<SystemTime>,
    ended: bool,
}

impl CommandPipeline {
    /// Launch the compiled specs in order.
    ///
    /// Launch failures do not panic or abort construction cleanup: the
    /// error is reported on stderr, recorded, and the pipeline behaves as
    /// already-failed with return code 1. Stages launched before the
    /// failure lose their downstream reader and exit on broken pipes.
    pub fn new(mut specs: Vec<SubprocSpec>, ctx: &SessionContext) -> CommandPipeline {
        let captured = specs.last().map(|s| s.captured).unwrap_or_default();
        let background = specs.last().map(|s| s.background).unwrap_or(false);
        let starttime = SystemTime::now();

        let mut procs: Vec<Box<dyn ProcHandle>> = Vec::new();
        let mut launch_error = None;
        // from a non-orchestrator thread, stay in the caller's existing
        // process group instead of snatching the terminal
        let mut pipeline_group = if signals::on_main_thread() {
            None
        } else {
            Some(nix::unistd::getpgrp())
        };
        let mut term_pgid = None;

        for spec in specs.iter_mut() {
            match spec.run(ctx, pipeline_group) {
                Ok(proc) => {
                    if let Some(pid) = proc.pid() {
                        if pipeline_group.is_none()
                            && !spec.is_callable()
                            && captured != CaptureKind::Object
                        {
                            let pgid = Pid::from_raw(pid as i32);
                            pipeline_group = Some(pgid);
                            if ctx.flags.interactive
                                && !background
                                && terminal::give_terminal_to(pgid)
                            {
                                term_pgid = Some(pgid);
                            }
                        }
                    }
                    procs.push(proc);
                }
                Err(err) => {
                    eprintln!("oxsh: {err}");
                    warn!(%err, "pipeline stage failed to launch");
                    launch_error = Some(err);
                    break;
                }
            }
        }

        let (stdout_src, stderr_src) = if launch_error.is_none() {
            Self::drain_sources(&mut specs, procs.last().map(|p| &**p), ctx.flags.poll_timeout)
        } else {
            (None, None)
        };

        let mut pipeline = CommandPipeline {
            ctx: ctx.clone(),
            specs,
            procs,
            launch_error,
            captured,
            background,
            pipeline_group,
            term_pgid,
            stdout_src,
            stderr_src,
            lines: Vec::new(),
            raw_output: Vec::new(),
            raw_error: Vec::new(),
            errors: None,
            input: None,
            starttime,
            endtime: None,
            ended: false,
        };
        if pipeline.launch_error.is_some() {
            pipeline.return_terminal();
        }
        pipeline
    }

    fn drain_sources(
        specs: &mut [SubprocSpec],
        last_proc: Option<&dyn ProcHandle>,
        timeout: Duration,
    ) -> (Option<DrainSource>, Option<DrainSource>) {
        let Some(proc) = last_proc else {
            return (None, None);
        };
        if let Some((out, err)) = proc.output_buffers() {
            return (Some(DrainSource::Buf(out)), Some(DrainSource::Buf(err)));
        }
        let Some(last) = specs.last_mut() else {
            return (None, None);
        };
        let out = last
            .captured_stdout
            .take()
            .map(|src| DrainSource::Reader(QueueReader::from_fd(src.into_fd(), timeout)));
        let err = last
            .captured_stderr
            .take()
            .map(|src| DrainSource::Reader(QueueReader::from_fd(src.into_fd(), timeout)));
        (out, err)
    }

    /// Capture kind of the last stage.
    pub fn captured(&self) -> CaptureKind {
        self.captured
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn suspended(&self) -> bool {
        self.procs.last().map_or(false, |p| p.suspended())
    }

    /// One pid slot per launched stage; callables contribute `None`.
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.procs.iter().map(|p| p.pid()).collect()
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pipeline_group.map(Pid::as_raw)
    }

    /// Process group that was handed the terminal, when one was. Only this
    /// group is safe to signal as a group; the launch group may be shared
    /// with the caller.
    pub fn term_pgid(&self) -> Option<i32> {
        self.term_pgid.map(Pid::as_raw)
    }

    /// Non-blocking reap of every stage. The last stage's return code once
    /// it has ended, `None` while it runs (or sits stopped).
    pub fn poll(&mut self) -> Option<i32> {
        if self.launch_error.is_some() {
            return Some(1);
        }
        let n = self.procs.len();
        let (prevs, last) = self.procs.split_at_mut(n.saturating_sub(1));
        for proc in prevs {
            let _ = proc.poll();
        }
        last.first_mut().and_then(|p| p.poll())
    }

    /// The pipeline as one display string, without the `&` marker.
    pub fn command_text(&self) -> String {
        self.specs
            .iter()
            .map(|s| s.args.join(" "))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Cleaned output lines accumulated so far, endings kept. Non-blocking.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Decoded, cleaned output accumulated so far. Non-blocking.
    pub fn output(&self) -> String {
        self.lines.concat()
    }

    /// Cleaned stderr accumulated so far. Non-blocking.
    pub fn errors(&self) -> String {
        self.errors.clone().unwrap_or_default()
    }

    /// Replayed stdin text, when the session recorded it.
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Blocking: run to completion, then return the decoded output.
    pub fn out(&mut self) -> String {
        self.end();
        self.output()
    }

    /// Blocking: run to completion, then return the decoded stderr.
    pub fn err(&mut self) -> String {
        self.end();
        self.errors()
    }

    /// Blocking: run to completion, then return the raw output bytes.
    pub fn raw_out(&mut self) -> Vec<u8> {
        self.end();
        self.raw_output.clone()
    }

    /// Blocking: run to completion, then return the raw stderr bytes.
    pub fn raw_err(&mut self) -> Vec<u8> {
        self.end();
        self.raw_error.clone()
    }

    /// The last stage's return code without ending the pipeline.
    pub fn poll_returncode(&self) -> Option<i32> {
        if self.launch_error.is_some() {
            return Some(1);
        }
        self.procs.last().and_then(|p| p.returncode())
    }

    /// Blocking: run to completion, then return the exit code. An
    /// unfinished stage (launch failure, stop without resume) reads as 1.
    pub fn returncode(&mut self) -> i32 {
        self.end();
        self.poll_returncode().unwrap_or(1)
    }

    pub fn signal_info(&self) -> Option<SignalInfo> {
        self.procs.last().and_then(|p| p.signal_info())
    }

    pub fn launch_error(&self) -> Option<&ProcsError> {
        self.launch_error.as_ref()
    }

    /// Drain to completion and run the close sequence. Idempotent; on a
    /// job-control stop this returns with the pipeline suspended, not
    /// ended, and the terminal handed back.
    #[tracing::instrument(level = "debug", skip(self), fields(cmd = %self.command_text()))]
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.drain();
        if !self.suspended() {
            self.finalize();
        }
        self.return_terminal();
    }

    /// Continue a suspended pipeline and drain it to completion.
    pub fn resume(&mut self) {
        self.ended = false;
        if self.ctx.flags.interactive && !self.background {
            if let Some(pgid) = self.pipeline_group {
                if terminal::give_terminal_to(pgid) {
                    self.term_pgid = Some(pgid);
                }
            }
        }
        self.continue_procs();
        for proc in self.procs.iter_mut() {
            proc.clear_suspended();
        }
        self.end();
    }

    fn continue_procs(&mut self) {
        // only interactive pipelines run in their own process group
        if self.ctx.flags.interactive {
            if let Some(pgid) = self.pipeline_group {
                if nix::sys::signal::killpg(pgid, Signal::SIGCONT).is_ok() {
                    return;
                }
            }
        }
        for proc in self.procs.iter_mut() {
            let _ = proc.send_signal(Signal::SIGCONT);
        }
    }

    /// A freshly spawned child can sit stopped when it raced the terminal
    /// handoff; send it a SIGCONT so the pipeline does not hang.
    pub(crate) fn continue_last(&mut self) {
        if !signals::on_main_thread() {
            return;
        }
        if let Some(proc) = self.procs.last_mut() {
            let _ = proc.send_signal(Signal::SIGCONT);
        }
    }

    /// Hand the terminal back to the shell's process group.
    pub fn return_terminal(&mut self) {
        let shell_pgid = nix::unistd::getpgrp();
        if let Some(pgid) = self.term_pgid {
            if pgid != shell_pgid && terminal::reclaim_terminal() {
                self.term_pgid = Some(shell_pgid);
            }
        }
    }

    /// Raise the policy-gated failure for a nonzero exit code.
    pub fn raise_if_failed(&mut self) -> ProcsResult<()> {
        if !self.ctx.flags.raise_subproc_error {
            return Ok(());
        }
        self.end();
        let Some(code) = self.poll_returncode() else {
            return Ok(());
        };
        if code == 0 {
            return Ok(());
        }
        let cmd = self
            .specs
            .last()
            .map(|s| s.args.clone())
            .unwrap_or_default();
        Err(ProcsError::NonZeroExit {
            cmd,
            code,
            output: self.output(),
        })
    }

    fn drain(&mut self) {
        if self.launch_error.is_some() || self.procs.is_empty() || self.suspended() {
            return;
        }
        let threadable = self.specs.last().map_or(false, |s| s.threadable);
        if self.stdout_src.is_none() || self.captured == CaptureKind::Stdout || !threadable {
            self.drain_blocking();
        } else {
            self.drain_streaming();
        }
    }

    /// Wait for the last stage, then read everything its capture holds.
    fn drain_blocking(&mut self) {
        let stopped = match self.procs.last_mut() {
            Some(proc) => matches!(proc.wait(), Ok(WaitResult::Stopped(_))),
            None => return,
        };
        if stopped {
            return;
        }
        self.endtime.get_or_insert(SystemTime::now());

        let out_bytes = match &mut self.stdout_src {
            Some(src) => src.read_remaining(),
            None => Vec::new(),
        };
        if self.captured == CaptureKind::Stdout {
            self.raw_output.extend_from_slice(&out_bytes);
            let s = decode_uninew(self.ctx.flags.decode, &out_bytes);
            self.lines = s.split_inclusive('\n').map(str::to_string).collect();
        } else if !out_bytes.is_empty() {
            let lines = text::split_lines_keepends(&out_bytes);
            self.tee_lines(lines);
        }

        let err_bytes = match &mut self.stderr_src {
            Some(src) => src.read_remaining(),
            None => Vec::new(),
        };
        self.stream_stderr(&err_bytes);
    }

    /// Poll-and-echo loop for threaded captures.
    fn drain_streaming(&mut self) {
        let timeout = self.ctx.flags.poll_timeout;
        let mut check_prev_done = self.procs.len() == 1;
        let mut prev_end: Option<Instant> = None;
        let mut cnt: u32 = 1;
        loop {
            let finished = match self.procs.last_mut() {
                Some(proc) => proc.poll().is_some(),
                None => return,
            };
            if finished {
                break;
            }
            if self.suspended() {
                return;
            }
            if self.procs.last().map_or(false, |p| p.in_alt_mode()) {
                // a full-screen program owns the terminal; nothing to drain
                std::thread::sleep(ALT_MODE_NAP);
                continue;
            }
            if check_prev_done && self.prev_procs_done() {
                // drop upstream resources before blocking on the last stage
                self.close_prev_procs();
                break;
            }

            let out_lines = match &mut self.stdout_src {
                Some(src) => src.read_lines(),
                None => Vec::new(),
            };
            let moved_out = out_lines.len();
            self.tee_lines(out_lines);

            let err_bytes = match &mut self.stderr_src {
                Some(src) => src.read_available(),
                None => Vec::new(),
            };
            let moved_err = err_bytes.len();
            self.stream_stderr(&err_bytes);

            if !check_prev_done {
                if moved_out + moved_err > 0 {
                    // first output means upstream has fully started
                    check_prev_done = true;
                } else if prev_end.is_none() {
                    if self.prev_procs_done() {
                        prev_end = Some(Instant::now());
                    }
                } else if prev_end.map_or(false, |t| t.elapsed() >= PIPELINE_DEBOUNCE) {
                    // silent past the debounce window; stop waiting for it
                    check_prev_done = true;
                }
            }

            if moved_out + moved_err == 0 {
                cnt = (cnt + 1).min(BACKOFF_CAP);
            } else {
                cnt = 1;
            }
            std::thread::sleep(timeout * cnt);
        }

        // sweep, wait (which settles any pump thread), sweep again
        self.sweep_available();
        let stopped = match self.procs.last_mut() {
            Some(proc) => matches!(proc.wait(), Ok(WaitResult::Stopped(_))),
            None => false,
        };
        if stopped {
            return;
        }
        self.endtime.get_or_insert(SystemTime::now());
        self.sweep_remaining();
    }

    fn sweep_available(&mut self) {
        let out = match &mut self.stdout_src {
            Some(src) => src.read_available(),
            None => Vec::new(),
        };
        if !out.is_empty() {
            let lines = text::split_lines_keepends(&out);
            self.tee_lines(lines);
        }
        let err = match &mut self.stderr_src {
            Some(src) => src.read_available(),
            None => Vec::new(),
        };
        self.stream_stderr(&err);
    }

    fn sweep_remaining(&mut self) {
        let out = match &mut self.stdout_src {
            Some(src) => src.read_remaining(),
            None => Vec::new(),
        };
        if !out.is_empty() {
            let lines = text::split_lines_keepends(&out);
            self.tee_lines(lines);
        }
        let err = match &mut self.stderr_src {
            Some(src) => src.read_remaining(),
            None => Vec::new(),
        };
        self.stream_stderr(&err);
    }

    /// Record raw lines and their cleaned form, echoing live for streaming
    /// capture kinds.
    fn tee_lines(&mut self, lines: Vec<Vec<u8>>) {
        if lines.is_empty() {
            return;
        }
        let stream = self.captured.streams_stdout();
        let policy = self.ctx.flags.decode;
        let mut real = std::io::stdout();
        for line in lines {
            if stream {
                let _ = real.write_all(&line);
                let _ = real.flush();
            }
            self.raw_output.extend_from_slice(&line);
            self.lines.push(text::sanitize_line(policy, &line));
        }
    }

    /// Echo captured stderr (with the session's decoration) and fold the
    /// cleaned form into `errors`.
    fn stream_stderr(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let prefix = self.ctx.flags.stderr_prefix.as_bytes();
        let postfix = self.ctx.flags.stderr_postfix.as_bytes();
        let mut decorated = Vec::with_capacity(bytes.len() + prefix.len() + postfix.len());
        decorated.extend_from_slice(prefix);
        decorated.extend_from_slice(bytes);
        decorated.extend_from_slice(postfix);

        let mut real = std::io::stderr();
        let _ = real.write_all(&decorated);
        let _ = real.flush();

        self.raw_error.extend_from_slice(&decorated);
        let cleaned = text::sanitize_block(self.ctx.flags.decode, &decorated);
        match &mut self.errors {
            Some(errors) => errors.push_str(&cleaned),
            None => self.errors = Some(cleaned),
        }
    }

    /// Whether every upstream stage has finished. Single-stage pipelines
    /// report false so the streaming loop keeps polling until exit.
    fn prev_procs_done(&mut self) -> bool {
        let n = self.procs.len();
        if n <= 1 {
            return false;
        }
        let (prevs, _) = self.procs.split_at_mut(n - 1);
        prevs.iter_mut().all(|p| p.poll().is_some())
    }

    /// Drop every non-last stage's remaining descriptors. Idempotent.
    fn close_prev_procs(&mut self) {
        let n = self.specs.len();
        for spec in self.specs.iter_mut().take(n.saturating_sub(1)) {
            spec.close_resources();
        }
    }

    /// Drop the last stage's descriptors and drain sources. Idempotent.
    fn close_proc(&mut self) {
        if let Some(spec) = self.specs.last_mut() {
            spec.close_resources();
        }
        self.stdout_src = None;
        self.stderr_src = None;
    }

    /// The post-drain close sequence: timestamps, stdin replay capture,
    /// descriptor close (upstream strictly before last), signal diagnostic,
    /// return-code hooks.
    fn finalize(&mut self) {
        self.endtime.get_or_insert(SystemTime::now());
        self.set_input();
        self.close_prev_procs();
        self.close_proc();
        // non-blocking reap of stages the drain did not wait on
        for proc in self.procs.iter_mut() {
            let _ = proc.poll();
        }
        self.check_signal();
        if let Some(code) = self.poll_returncode() {
            self.ctx.hooks.fire_returncode(code);
        }
        self.ended = true;
        debug!(returncode = ?self.poll_returncode(), "pipeline ended");
    }

    fn set_input(&mut self) {
        let Some(bytes) = self.procs.last().and_then(|p| p.stdin_replay()) else {
            return;
        };
        if !bytes.is_empty() {
            self.input = Some(text::decode_bytes(self.ctx.flags.decode, &bytes));
        }
    }

    /// Print the human-readable diagnostic when the last stage died to a
    /// signal, mirroring it into `errors` when any stderr was captured.
    fn check_signal(&mut self) {
        let Some(info) = self.signal_info() else {
            return;
        };
        let Some(message) = proc::signal_message(info.number) else {
            return;
        };
        let mut message = message.to_string();
        if info.core_dumped {
            message.push_str(" (core dumped)");
        }
        eprintln!("{message}");
        if let Some(errors) = &mut self.errors {
            errors.push_str(&message);
            errors.push('\n');
        }
    }
}

impl std::fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("command", &self.command_text())
            .field("captured", &self.captured)
            .field("background", &self.background)
            .field("ended", &self.ended)
            .field("returncode", &self.poll_returncode())
            .finish_non_exhaustive()
    }
}

/// Decode and normalize newlines without stripping escapes; plain string
/// capture returns what the child wrote, colors included.
fn decode_uninew(policy: DecodePolicy, bytes: &[u8]) -> String {
    text::decode_bytes(policy, bytes)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}
