//! Compiling a token pipeline into launchable specs.
//!
//! The input is a flat list of stages and sentinels, e.g.
//! `[["echo","hi"], "|", ["grep","h"], "&"]`. Compilation builds one
//! [`SubprocSpec`] per stage, threads one OS pipe per `|` (raw descriptors,
//! so no userspace buffering sits between processes), applies the capture
//! floor to interior stages, and finalizes the last spec with the concrete
//! capture plumbing its `captured` kind calls for.

use nix::pty::openpty;
use tracing::debug;

use oxsh_types::CaptureKind;

use crate::error::{ProcsError, ProcsResult};
use crate::redirect::StreamSlot;
use crate::session::{SessionContext, CAPTURE_ALWAYS_ENV};
use crate::spec::{CaptureSource, LaunchStrategy, SubprocSpec};
use crate::terminal;

/// One element of a pipeline: a command's tokens or a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineItem {
    Command(Vec<String>),
    /// `|`: connect the previous stage's stdout to the next stage's stdin.
    Pipe,
    /// `&`: run the whole pipeline in the background. Final position only.
    Background,
}

impl From<Vec<String>> for PipelineItem {
    fn from(tokens: Vec<String>) -> Self {
        PipelineItem::Command(tokens)
    }
}

impl PipelineItem {
    /// Convenience constructor for literal token lists.
    pub fn command<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PipelineItem::Command(words.into_iter().map(Into::into).collect())
    }
}

enum Sentinel {
    Pipe,
    Background,
}

/// Compile pipeline items into specs, wired and finalized in order.
pub fn cmds_to_specs(
    items: Vec<PipelineItem>,
    captured: CaptureKind,
    ctx: &SessionContext,
) -> ProcsResult<Vec<SubprocSpec>> {
    // build the stages first, keeping the sentinels aside; sentinel i sits
    // between stage i and stage i+1 in well-formed input
    let mut specs: Vec<SubprocSpec> = Vec::new();
    let mut sentinels: Vec<Sentinel> = Vec::new();
    for item in items {
        match item {
            PipelineItem::Command(cmd) => {
                let mut spec = SubprocSpec::build(cmd, captured, ctx)?;
                spec.pipeline_index = specs.len();
                specs.push(spec);
            }
            PipelineItem::Pipe => sentinels.push(Sentinel::Pipe),
            PipelineItem::Background => sentinels.push(Sentinel::Background),
        }
    }
    if specs.is_empty() {
        return Err(ProcsError::EmptyCommand);
    }

    let sentinel_count = sentinels.len();
    for (i, sentinel) in sentinels.into_iter().enumerate() {
        match sentinel {
            Sentinel::Pipe => {
                if i + 1 >= specs.len() {
                    return Err(ProcsError::InvalidPipeline(
                        "pipe with no downstream command".to_string(),
                    ));
                }
                let (r, w) = nix::unistd::pipe()?;
                specs[i].set_stdout(StreamSlot::Pipe(w))?;
                specs[i + 1].set_stdin(StreamSlot::Pipe(r))?;
            }
            Sentinel::Background => {
                if i != sentinel_count - 1 {
                    return Err(ProcsError::InvalidPipeline(
                        "'&' is only legal at the end of a pipeline".to_string(),
                    ));
                }
                if let Some(last) = specs.last_mut() {
                    last.background = true;
                }
            }
        }
    }

    // capture floor: interior stages tell any nested shell they spawn to
    // capture rather than write through to the terminal; when the whole
    // pipeline's stdout is being captured the last stage gets it too
    if !ctx.flags.capture_always {
        let floor = if matches!(captured, CaptureKind::Stdout | CaptureKind::Object) {
            specs.len()
        } else {
            specs.len() - 1
        };
        for spec in &mut specs[..floor] {
            if !spec.env_overrides.iter().any(|(k, _)| k == CAPTURE_ALWAYS_ENV) {
                spec.env_overrides
                    .push((CAPTURE_ALWAYS_ENV.to_string(), "1".to_string()));
            }
        }
    }

    if let Some(last) = specs.last_mut() {
        update_last_spec(last, ctx)?;
    }
    Ok(specs)
}

/// Give the last spec the concrete plumbing its capture kind calls for.
///
/// | captured     | stdout                    | stderr                |
/// |--------------|---------------------------|-----------------------|
/// | none         | inherited                 | inherited             |
/// | stdout       | piped, buffered           | inherited             |
/// | object       | piped and streamed        | piped and streamed    |
/// | hiddenobject | piped and streamed        | piped and streamed    |
///
/// Already-redirected streams keep their redirection and simply go
/// uncaptured. Non-threadable handle-mode commands (pagers and friends)
/// skip capture entirely and keep the terminal.
fn update_last_spec(last: &mut SubprocSpec, ctx: &SessionContext) -> ProcsResult<()> {
    last.last_in_pipeline = true;
    if last.captured == CaptureKind::None {
        return Ok(());
    }
    let callable = last.is_callable();
    if !callable {
        let thable = ctx.flags.thread_subprocs
            && ctx.predictor.threadable(&last.args)
            && ctx.predictor.threadable(&last.cmd);
        if thable {
            last.threadable = true;
            last.strategy = LaunchStrategy::Pumped;
        } else {
            last.threadable = false;
            last.strategy = LaunchStrategy::Native;
            if last.captured.returns_handle() {
                debug!(cmd = ?last.cmd, "not threadable, keeping the terminal");
                return Ok(());
            }
        }
    }
    // ptys preserve the child's line discipline for interactive handle
    // captures; they misbehave under in-process callables, which keep pipes
    let use_pty = !callable
        && ctx.flags.interactive
        && last.captured == CaptureKind::HiddenObject
        && last.strategy == LaunchStrategy::Pumped;

    if !last.has_stdout() {
        let (slot, source) = capture_channel(use_pty)?;
        last.set_stdout(slot)?;
        last.captured_stdout = Some(source);
    }
    if !last.has_stderr() && last.captured.captures_stderr() {
        let (slot, source) = capture_channel(use_pty)?;
        last.set_stderr(slot)?;
        last.captured_stderr = Some(source);
    }
    Ok(())
}

/// One capture channel: the child-side slot and the parent-side source.
fn capture_channel(use_pty: bool) -> ProcsResult<(StreamSlot, CaptureSource)> {
    if use_pty {
        let pty = openpty(None, None)?;
        terminal::prepare_pty_slave(&pty.slave);
        Ok((
            StreamSlot::Pipe(pty.slave),
            CaptureSource::PtyMaster(pty.master),
        ))
    } else {
        let (r, w) = nix::unistd::pipe()?;
        Ok((StreamSlot::Pipe(w), CaptureSource::Pipe(r)))
    }
}
