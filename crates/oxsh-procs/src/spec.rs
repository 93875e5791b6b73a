//! Subprocess specifications.
//!
//! A [`SubprocSpec`] captures everything about one pipeline stage before it
//! runs: tokens, stream slots, the resolved command, the capture mode and
//! the launch strategy. Building a spec performs all name resolution up
//! front, so by the time `run` is called there are no alias lookups or
//! `PATH` walks left, only resource wiring and the actual spawn.
//!
//! Build order for one stage:
//!
//! 1. leading `< file` redirects;
//! 2. trailing redirect tokens, right to left;
//! 3. alias resolution, expanding token aliases recursively (a seen-set
//!    turns expansion cycles into errors) and re-parsing redirects that an
//!    expansion introduced;
//! 4. binary location, auto-cd, and shebang splicing;
//! 5. strategy selection from threadability and the callable's declared
//!    traits.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use nix::unistd::Pid;
use tracing::debug;

use oxsh_types::CaptureKind;

use crate::error::{ProcsError, ProcsResult};
use crate::executables;
use crate::proc::ProcHandle;
use crate::proxies::{ForegroundProxy, ProxyStreams, ThreadedProxy};
use crate::pump::{self, PumpStreams, PumpedProc};
use crate::readers::SharedOutBuf;
use crate::redirect::{self, RedirectOutcome, StreamSlot};
use crate::session::{AliasKind, CallableAlias, SessionContext};

/// What the head token resolved to, fixed at build time.
#[derive(Debug, Clone)]
pub enum ResolvedCommand {
    /// A located executable.
    Binary(PathBuf),
    /// An in-process callable alias.
    Callable(CallableAlias),
}

/// How the stage will be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Plain spawned child, streams wired directly.
    Native,
    /// Spawned child behind a pump thread copying captured output.
    Pumped,
    /// Callable alias on a worker thread.
    ThreadedProxy,
    /// Callable alias on the orchestrator's thread.
    ForegroundProxy,
}

/// Parent-side read end of a capture channel.
#[derive(Debug)]
pub enum CaptureSource {
    Pipe(OwnedFd),
    PtyMaster(OwnedFd),
}

impl CaptureSource {
    pub fn into_fd(self) -> OwnedFd {
        match self {
            CaptureSource::Pipe(fd) | CaptureSource::PtyMaster(fd) => fd,
        }
    }
}

/// One fully resolved pipeline stage.
#[derive(Debug)]
pub struct SubprocSpec {
    /// Working token list; aliases and shebangs rewrite this.
    pub cmd: Vec<String>,
    /// Tokens as originally given, before any rewriting.
    pub args: Vec<String>,
    pub(crate) stdin: Option<StreamSlot>,
    pub(crate) stdout: Option<StreamSlot>,
    pub(crate) stderr: Option<StreamSlot>,
    pub captured: CaptureKind,
    pub resolved: Option<ResolvedCommand>,
    /// The alias name this stage came from, when it did.
    pub alias_name: Option<String>,
    pub strategy: LaunchStrategy,
    pub threadable: bool,
    pub background: bool,
    pub pipeline_index: usize,
    pub last_in_pipeline: bool,
    pub(crate) captured_stdout: Option<CaptureSource>,
    pub(crate) captured_stderr: Option<CaptureSource>,
    pub env_overrides: Vec<(String, String)>,
}

impl SubprocSpec {
    /// Build a spec from one stage's tokens.
    pub fn build(
        cmd: Vec<String>,
        captured: CaptureKind,
        ctx: &SessionContext,
    ) -> ProcsResult<SubprocSpec> {
        if cmd.is_empty() {
            return Err(ProcsError::EmptyCommand);
        }
        let mut spec = SubprocSpec {
            args: cmd.clone(),
            cmd,
            stdin: None,
            stdout: None,
            stderr: None,
            captured,
            resolved: None,
            alias_name: None,
            strategy: LaunchStrategy::Native,
            threadable: true,
            background: false,
            pipeline_index: 0,
            last_in_pipeline: false,
            captured_stdout: None,
            captured_stderr: None,
            env_overrides: Vec::new(),
        };
        spec.parse_leading_redirects()?;
        spec.parse_trailing_redirects()?;
        spec.resolve_alias(ctx)?;
        spec.resolve_binary(ctx)?;
        spec.resolve_strategy(ctx);
        Ok(spec)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.resolved, Some(ResolvedCommand::Callable(_)))
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn has_stdout(&self) -> bool {
        self.stdout.is_some()
    }

    pub fn has_stderr(&self) -> bool {
        self.stderr.is_some()
    }

    /// Drop every descriptor this spec still holds. Idempotent; slots
    /// already moved into a launched child are unaffected.
    pub(crate) fn close_resources(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.captured_stdout = None;
        self.captured_stderr = None;
    }

    /// Assign a stream slot, rejecting double assignment. The incoming
    /// slot is dropped (closing its resource) when the stream is taken.
    pub fn set_stdin(&mut self, slot: StreamSlot) -> ProcsResult<()> {
        Self::assign("stdin", &self.args, &mut self.stdin, slot)
    }

    pub fn set_stdout(&mut self, slot: StreamSlot) -> ProcsResult<()> {
        Self::assign("stdout", &self.args, &mut self.stdout, slot)
    }

    pub fn set_stderr(&mut self, slot: StreamSlot) -> ProcsResult<()> {
        Self::assign("stderr", &self.args, &mut self.stderr, slot)
    }

    fn assign(
        stream: &str,
        args: &[String],
        field: &mut Option<StreamSlot>,
        slot: StreamSlot,
    ) -> ProcsResult<()> {
        if field.is_some() {
            return Err(ProcsError::MultipleRedirect {
                stream: stream.to_string(),
                cmd: args.to_vec(),
            });
        }
        *field = Some(slot);
        Ok(())
    }

    fn apply_outcome(&mut self, outcome: RedirectOutcome) -> ProcsResult<()> {
        if let Some(slot) = outcome.stdin {
            self.set_stdin(slot)?;
        }
        if let Some(slot) = outcome.stdout {
            self.set_stdout(slot)?;
        }
        if let Some(slot) = outcome.stderr {
            self.set_stderr(slot)?;
        }
        Ok(())
    }

    fn parse_leading_redirects(&mut self) -> ProcsResult<()> {
        while self.cmd.len() >= 3 && self.cmd[0] == "<" {
            let outcome = redirect::redirect_streams("<", Some(&self.cmd[1]))?;
            self.apply_outcome(outcome)?;
            self.cmd.drain(..2);
        }
        Ok(())
    }

    fn parse_trailing_redirects(&mut self) -> ProcsResult<()> {
        loop {
            let n = self.cmd.len();
            if n >= 3
                && redirect::is_redirect_token(&self.cmd[n - 2])
                && !redirect::is_redirect_token(&self.cmd[n - 1])
            {
                let outcome =
                    redirect::redirect_streams(&self.cmd[n - 2], Some(&self.cmd[n - 1]))?;
                self.apply_outcome(outcome)?;
                self.cmd.truncate(n - 2);
            } else if n >= 2 && redirect::is_redirect_token(&self.cmd[n - 1]) {
                let outcome = redirect::redirect_streams(&self.cmd[n - 1], None)?;
                self.apply_outcome(outcome)?;
                self.cmd.truncate(n - 1);
            } else {
                return Ok(());
            }
        }
    }

    /// Expand token aliases until the head is a callable, a binary name, or
    /// a repeat (which is an expansion cycle).
    fn resolve_alias(&mut self, ctx: &SessionContext) -> ProcsResult<()> {
        let mut seen: Vec<String> = Vec::new();
        loop {
            let Some(head) = self.cmd.first().cloned() else {
                return Err(ProcsError::EmptyCommand);
            };
            if seen.contains(&head) {
                return Err(ProcsError::AliasCycle(head));
            }
            match ctx.aliases.resolve(&head) {
                None => return Ok(()),
                Some(AliasKind::Callable(callable)) => {
                    self.alias_name.get_or_insert(head);
                    self.resolved = Some(ResolvedCommand::Callable(callable));
                    return Ok(());
                }
                Some(AliasKind::Tokens(tokens)) => {
                    debug!(alias = %head, "expanding token alias");
                    self.alias_name.get_or_insert_with(|| head.clone());
                    seen.push(head);
                    self.cmd.splice(..1, tokens);
                    if self.cmd.is_empty() {
                        return Err(ProcsError::EmptyCommand);
                    }
                    // the expansion may have introduced redirects of its own
                    self.parse_trailing_redirects()?;
                    self.parse_leading_redirects()?;
                }
            }
        }
    }

    fn resolve_binary(&mut self, ctx: &SessionContext) -> ProcsResult<()> {
        if self.is_callable() {
            return Ok(());
        }
        let Some(head) = self.cmd.first().cloned() else {
            return Err(ProcsError::EmptyCommand);
        };
        if let Some(path) = ctx.locator.locate(&head) {
            return self.finish_binary(path, ctx);
        }
        if ctx.flags.auto_cd && self.cmd.len() == 1 && Path::new(&head).is_dir() {
            if let Some(AliasKind::Callable(callable)) = ctx.aliases.resolve("cd") {
                debug!(dir = %head, "auto-cd");
                self.cmd.insert(0, "cd".to_string());
                self.alias_name = Some("cd".to_string());
                self.resolved = Some(ResolvedCommand::Callable(callable));
                return Ok(());
            }
        }
        if head.contains('/') && Path::new(&head).is_file() {
            return Err(ProcsError::PermissionDenied(head));
        }
        if ctx.flags.interactive {
            ctx.hooks.fire_command_not_found(&self.cmd);
        }
        Err(ProcsError::CommandNotFound(head))
    }

    /// Record the located binary, splicing in a script's interpreter first
    /// when the file turns out to be a readable text script.
    fn finish_binary(&mut self, path: PathBuf, ctx: &SessionContext) -> ProcsResult<()> {
        if let Some(script_cmd) = executables::script_command(&path, &self.cmd[1..])? {
            let interp = script_cmd[0].clone();
            let Some(interp_path) = ctx.locator.locate(&interp) else {
                if ctx.flags.interactive {
                    ctx.hooks.fire_command_not_found(&script_cmd);
                }
                return Err(ProcsError::CommandNotFound(interp));
            };
            self.cmd = script_cmd;
            self.resolved = Some(ResolvedCommand::Binary(interp_path));
        } else {
            self.resolved = Some(ResolvedCommand::Binary(path));
        }
        Ok(())
    }

    fn resolve_strategy(&mut self, ctx: &SessionContext) {
        match &self.resolved {
            Some(ResolvedCommand::Callable(callable)) => {
                self.threadable = ctx.flags.thread_subprocs && callable.threadable;
                self.strategy = if self.threadable {
                    LaunchStrategy::ThreadedProxy
                } else {
                    LaunchStrategy::ForegroundProxy
                };
                if callable.capturable == Some(false) {
                    self.captured = CaptureKind::None;
                }
            }
            _ => {
                self.threadable = ctx.flags.thread_subprocs && ctx.predictor.threadable(&self.cmd);
                self.strategy = LaunchStrategy::Native;
            }
        }
    }

    /// Launch this stage, consuming its stream resources.
    pub fn run(
        &mut self,
        ctx: &SessionContext,
        pipeline_group: Option<Pid>,
    ) -> ProcsResult<Box<dyn ProcHandle>> {
        match self.resolved.clone() {
            Some(ResolvedCommand::Callable(callable)) => self.run_callable(callable),
            Some(ResolvedCommand::Binary(path)) => self.run_binary(ctx, &path, pipeline_group),
            None => Err(ProcsError::LaunchFailure {
                cmd: self.cmd.clone(),
                message: "command was never resolved".to_string(),
            }),
        }
    }

    fn run_callable(&mut self, callable: CallableAlias) -> ProcsResult<Box<dyn ProcHandle>> {
        // a callable's argv excludes its own name
        let args: Vec<String> = self.cmd[1..].to_vec();
        let name = self
            .alias_name
            .clone()
            .or_else(|| self.cmd.first().cloned())
            .unwrap_or_default();
        let streams = ProxyStreams {
            stdin: self.stdin.take(),
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
        };
        debug!(alias = %name, strategy = ?self.strategy, "starting callable stage");
        Ok(match self.strategy {
            LaunchStrategy::ForegroundProxy => {
                Box::new(ForegroundProxy::new(&name, callable, args, streams))
            }
            _ => Box::new(ThreadedProxy::spawn(&name, callable, args, streams)),
        })
    }

    fn run_binary(
        &mut self,
        ctx: &SessionContext,
        path: &Path,
        pipeline_group: Option<Pid>,
    ) -> ProcsResult<Box<dyn ProcHandle>> {
        use std::os::unix::process::CommandExt;

        // a NUL would silently truncate the argument at the exec boundary
        for arg in &mut self.cmd {
            if arg.contains('\0') {
                *arg = arg.replace('\0', "\\0");
            }
        }

        let mut command = Command::new(path);
        command.arg0(&self.cmd[0]);
        command.args(&self.cmd[1..]);
        for (key, value) in &self.env_overrides {
            command.env(key, value);
        }
        if ctx.flags.interactive {
            command.process_group(pipeline_group.map_or(0, Pid::as_raw));
            unsafe {
                command.pre_exec(|| {
                    // undo any job-control ignores the session carries
                    libc::signal(libc::SIGTSTP, libc::SIG_DFL);
                    libc::signal(libc::SIGTTOU, libc::SIG_DFL);
                    libc::signal(libc::SIGTTIN, libc::SIG_DFL);
                    Ok(())
                });
            }
        }

        let (stdin_io, stdout_io, stderr_io, replay) = self.build_stdio(ctx)?;
        command.stdin(stdin_io).stdout(stdout_io).stderr(stderr_io);

        debug!(cmd = ?self.cmd, strategy = ?self.strategy, "spawning");
        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return Err(self.spawn_error(err)),
        };
        // dropping the Command closes the parent copies of the child-side
        // descriptors; downstream EOF depends on this
        drop(command);

        if self.strategy == LaunchStrategy::Pumped {
            let (stdout_src, pty_winsize) = match self.captured_stdout.take() {
                Some(CaptureSource::PtyMaster(fd)) => {
                    let dup = fd.try_clone().ok();
                    (Some(fd), dup)
                }
                Some(CaptureSource::Pipe(fd)) => (Some(fd), None),
                None => (None, None),
            };
            let stderr_src = self.captured_stderr.take().map(CaptureSource::into_fd);
            let streams = PumpStreams {
                stdout: stdout_src,
                stderr: stderr_src,
                pty_winsize,
            };
            Ok(Box::new(PumpedProc::new(
                child,
                streams,
                pipeline_group,
                ctx.flags.interactive,
                ctx.flags.poll_timeout,
                replay,
            )))
        } else {
            Ok(Box::new(crate::proc::NativeProc::new(child)))
        }
    }

    /// Convert slots to child stdio, resolving merge markers into duplicate
    /// descriptors and teeing stdin when the session records it.
    fn build_stdio(
        &mut self,
        ctx: &SessionContext,
    ) -> ProcsResult<(Stdio, Stdio, Stdio, Option<Arc<SharedOutBuf>>)> {
        let stdin_slot = self.stdin.take();
        let stdout_slot = self.stdout.take();
        let stderr_slot = self.stderr.take();

        let mut replay = None;
        let stdin_io = match stdin_slot {
            None | Some(StreamSlot::Inherit) => Stdio::inherit(),
            Some(StreamSlot::Pipe(fd)) => self.tee_stdin(ctx, fd, &mut replay)?,
            Some(StreamSlot::File(file)) => {
                self.tee_stdin(ctx, OwnedFd::from(file), &mut replay)?
            }
            Some(StreamSlot::MergeWithOut) | Some(StreamSlot::MergeWithErr) => Stdio::inherit(),
        };

        let stdout_merges = matches!(stdout_slot, Some(StreamSlot::MergeWithErr));
        let stderr_merges = matches!(stderr_slot, Some(StreamSlot::MergeWithOut));
        let (out_target, err_target) = if stdout_merges {
            let err = IoTarget::from_slot(stderr_slot);
            let out = err.duplicate(2)?;
            (out, err)
        } else if stderr_merges {
            let out = IoTarget::from_slot(stdout_slot);
            let err = out.duplicate(1)?;
            (out, err)
        } else {
            (
                IoTarget::from_slot(stdout_slot),
                IoTarget::from_slot(stderr_slot),
            )
        };

        Ok((stdin_io, out_target.into_stdio(), err_target.into_stdio(), replay))
    }

    fn tee_stdin(
        &self,
        ctx: &SessionContext,
        fd: OwnedFd,
        replay: &mut Option<Arc<SharedOutBuf>>,
    ) -> ProcsResult<Stdio> {
        if ctx.flags.store_stdin && self.strategy == LaunchStrategy::Pumped {
            let (read_end, buf) = pump::stdin_tee(fd)?;
            *replay = Some(buf);
            Ok(Stdio::from(read_end))
        } else {
            Ok(Stdio::from(fd))
        }
    }

    fn spawn_error(&self, err: std::io::Error) -> ProcsError {
        let head = self.cmd.first().cloned().unwrap_or_default();
        match err.kind() {
            std::io::ErrorKind::NotFound => ProcsError::CommandNotFound(head),
            std::io::ErrorKind::PermissionDenied => ProcsError::PermissionDenied(head),
            _ => ProcsError::LaunchFailure {
                cmd: self.cmd.clone(),
                message: err.to_string(),
            },
        }
    }
}

/// Resolved destination of one output stream at spawn time.
enum IoTarget {
    Inherit,
    Fd(OwnedFd),
}

impl IoTarget {
    fn from_slot(slot: Option<StreamSlot>) -> IoTarget {
        match slot {
            None | Some(StreamSlot::Inherit) => IoTarget::Inherit,
            Some(StreamSlot::Pipe(fd)) => IoTarget::Fd(fd),
            Some(StreamSlot::File(file)) => IoTarget::Fd(OwnedFd::from(file)),
            // a lone merge marker resolves elsewhere; inherit as a fallback
            Some(StreamSlot::MergeWithOut) | Some(StreamSlot::MergeWithErr) => IoTarget::Inherit,
        }
    }

    /// A second descriptor pointing at the same destination. Merging into
    /// an inherited stream duplicates the parent's own descriptor.
    fn duplicate(&self, parent_fd: i32) -> ProcsResult<IoTarget> {
        match self {
            IoTarget::Inherit => {
                let borrowed = unsafe { BorrowedFd::borrow_raw(parent_fd) };
                Ok(IoTarget::Fd(borrowed.try_clone_to_owned()?))
            }
            IoTarget::Fd(fd) => Ok(IoTarget::Fd(fd.try_clone()?)),
        }
    }

    fn into_stdio(self) -> Stdio {
        match self {
            IoTarget::Inherit => Stdio::inherit(),
            IoTarget::Fd(fd) => Stdio::from(fd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AliasFn, MapAliases};
    use oxsh_types::AliasReturn;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ctx() -> SessionContext {
        SessionContext::new()
    }

    fn ctx_with(aliases: MapAliases) -> SessionContext {
        SessionContext::new().with_aliases(aliases)
    }

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn noop_callable() -> AliasFn {
        Arc::new(|_call| Ok(AliasReturn::Done))
    }

    #[test]
    fn builds_a_plain_binary_spec() {
        let spec = SubprocSpec::build(tokens(&["echo", "hi"]), CaptureKind::None, &ctx()).unwrap();
        assert!(matches!(spec.resolved, Some(ResolvedCommand::Binary(_))));
        assert_eq!(spec.strategy, LaunchStrategy::Native);
        assert!(spec.threadable);
        assert_eq!(spec.cmd, vec!["echo", "hi"]);
        assert_eq!(spec.args, vec!["echo", "hi"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = SubprocSpec::build(vec![], CaptureKind::None, &ctx()).unwrap_err();
        assert!(matches!(err, ProcsError::EmptyCommand));
    }

    #[test]
    fn missing_command_fires_hook_when_interactive() {
        let fired = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&fired);
        let mut ctx = ctx();
        ctx.flags.interactive = true;
        ctx.hooks
            .on_command_not_found
            .push(Arc::new(move |_cmd| observer.store(true, Ordering::SeqCst)));
        let err =
            SubprocSpec::build(tokens(&["no-such-cmd-xyz"]), CaptureKind::None, &ctx).unwrap_err();
        assert!(matches!(err, ProcsError::CommandNotFound(_)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_command_hook_stays_quiet_in_scripts() {
        let fired = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&fired);
        let mut ctx = ctx();
        ctx.hooks
            .on_command_not_found
            .push(Arc::new(move |_cmd| observer.store(true, Ordering::SeqCst)));
        let err =
            SubprocSpec::build(tokens(&["no-such-cmd-xyz"]), CaptureKind::None, &ctx).unwrap_err();
        assert!(matches!(err, ProcsError::CommandNotFound(_)));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn trailing_redirects_are_consumed_right_to_left() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        let spec = SubprocSpec::build(
            tokens(&["echo", "hi", ">", out.to_str().unwrap()]),
            CaptureKind::None,
            &ctx(),
        )
        .unwrap();
        assert_eq!(spec.cmd, vec!["echo", "hi"]);
        assert!(spec.has_stdout());
        assert!(!spec.has_stderr());
    }

    #[test]
    fn double_stdout_redirect_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let err = SubprocSpec::build(
            tokens(&[
                "echo",
                "hi",
                ">",
                a.to_str().unwrap(),
                ">",
                b.to_str().unwrap(),
            ]),
            CaptureKind::None,
            &ctx(),
        )
        .unwrap_err();
        match err {
            ProcsError::MultipleRedirect { stream, .. } => assert_eq!(stream, "stdout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn merge_redirect_equivalence() {
        let spec_long = SubprocSpec::build(
            tokens(&["sh", "-c", "x", "2>&1"]),
            CaptureKind::Stdout,
            &ctx(),
        )
        .unwrap();
        let spec_short =
            SubprocSpec::build(tokens(&["sh", "-c", "x", "e>o"]), CaptureKind::Stdout, &ctx())
                .unwrap();
        assert!(matches!(
            spec_long.stderr,
            Some(StreamSlot::MergeWithOut)
        ));
        assert!(matches!(
            spec_short.stderr,
            Some(StreamSlot::MergeWithOut)
        ));
        assert_eq!(spec_long.cmd, spec_short.cmd);
    }

    #[test]
    fn leading_input_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "x").unwrap();
        let spec = SubprocSpec::build(
            tokens(&["<", input.to_str().unwrap(), "cat"]),
            CaptureKind::Stdout,
            &ctx(),
        )
        .unwrap();
        assert_eq!(spec.cmd, vec!["cat"]);
        assert!(spec.has_stdin());
    }

    #[test]
    fn token_aliases_expand_recursively() {
        let mut aliases = MapAliases::new();
        aliases.insert_tokens("ll", vec!["l".into(), "-l".into()]);
        aliases.insert_tokens("l", vec!["echo".into(), "ls".into()]);
        let spec = SubprocSpec::build(
            tokens(&["ll", "dir"]),
            CaptureKind::None,
            &ctx_with(aliases),
        )
        .unwrap();
        assert_eq!(spec.cmd, vec!["echo", "ls", "-l", "dir"]);
        assert_eq!(spec.alias_name.as_deref(), Some("ll"));
        assert!(matches!(spec.resolved, Some(ResolvedCommand::Binary(_))));
    }

    #[test]
    fn alias_cycles_are_detected() {
        let mut aliases = MapAliases::new();
        aliases.insert_tokens("a", vec!["b".into()]);
        aliases.insert_tokens("b", vec!["a".into()]);
        let err = SubprocSpec::build(tokens(&["a"]), CaptureKind::None, &ctx_with(aliases))
            .unwrap_err();
        assert!(matches!(err, ProcsError::AliasCycle(_)));
    }

    #[test]
    fn callable_alias_selects_proxy_strategy() {
        let mut aliases = MapAliases::new();
        aliases.insert_callable("greet", noop_callable());
        let spec = SubprocSpec::build(
            tokens(&["greet", "world"]),
            CaptureKind::Object,
            &ctx_with(aliases),
        )
        .unwrap();
        assert!(spec.is_callable());
        assert_eq!(spec.strategy, LaunchStrategy::ThreadedProxy);
        assert_eq!(spec.alias_name.as_deref(), Some("greet"));
    }

    #[test]
    fn unthreadable_callable_runs_in_foreground() {
        let mut aliases = MapAliases::new();
        aliases.insert(
            "editor",
            AliasKind::Callable(CallableAlias {
                func: noop_callable(),
                threadable: false,
                capturable: None,
            }),
        );
        let spec = SubprocSpec::build(
            tokens(&["editor"]),
            CaptureKind::HiddenObject,
            &ctx_with(aliases),
        )
        .unwrap();
        assert_eq!(spec.strategy, LaunchStrategy::ForegroundProxy);
        assert!(!spec.threadable);
    }

    #[test]
    fn uncapturable_callable_clears_capture() {
        let mut aliases = MapAliases::new();
        aliases.insert(
            "raw",
            AliasKind::Callable(CallableAlias {
                func: noop_callable(),
                threadable: true,
                capturable: Some(false),
            }),
        );
        let spec = SubprocSpec::build(
            tokens(&["raw"]),
            CaptureKind::Object,
            &ctx_with(aliases),
        )
        .unwrap();
        assert_eq!(spec.captured, CaptureKind::None);
    }

    #[test]
    fn unexecutable_path_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("x.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let err = SubprocSpec::build(
            tokens(&[script.to_str().unwrap()]),
            CaptureKind::None,
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, ProcsError::PermissionDenied(_)));
    }

    #[test]
    fn run_wires_pipe_slots() {
        let mut spec =
            SubprocSpec::build(tokens(&["echo", "hi"]), CaptureKind::None, &ctx()).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        spec.set_stdout(StreamSlot::Pipe(w)).unwrap();
        let mut handle = spec.run(&ctx(), None).unwrap();
        assert!(matches!(
            handle.wait().unwrap(),
            crate::proc::WaitResult::Exited(0)
        ));
        let mut out = String::new();
        std::fs::File::from(r).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn run_resolves_merge_into_pipe() {
        let mut spec = SubprocSpec::build(
            tokens(&["sh", "-c", "echo fail >&2", "2>&1"]),
            CaptureKind::None,
            &ctx(),
        )
        .unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        // the merge marker sits in stderr; stdout carries the pipe
        spec.set_stdout(StreamSlot::Pipe(w)).unwrap();
        let mut handle = spec.run(&ctx(), None).unwrap();
        handle.wait().unwrap();
        let mut out = String::new();
        std::fs::File::from(r).read_to_string(&mut out).unwrap();
        assert_eq!(out, "fail\n");
    }
}
