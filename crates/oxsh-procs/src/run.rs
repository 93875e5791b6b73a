//! The subprocess entry point: compile, launch, register, shape the result.
//!
//! [`run_subproc`] is what an embedding shell calls once its parser has
//! reduced a command line to pipeline items. What comes back depends on the
//! capture kind requested for the last stage:
//!
//! - `Object` and `HiddenObject` return the live [`CommandPipeline`] handle
//!   (for `HiddenObject` foreground runs, already ended);
//! - `Stdout` runs to completion and returns the decoded output string;
//! - everything else is `Detached`: background jobs keep their handle
//!   parked in the session's job table, foreground uncaptured runs are
//!   simply over.

use tracing::debug;

use oxsh_types::CaptureKind;

use crate::compile::{cmds_to_specs, PipelineItem};
use crate::error::ProcsResult;
use crate::pipeline::CommandPipeline;
use crate::session::SessionContext;

/// What a finished call to [`run_subproc`] hands back.
#[derive(Debug)]
pub enum RunOutcome {
    /// A live (or already ended) pipeline handle.
    Handle(CommandPipeline),
    /// Decoded stdout of the last stage.
    Output(String),
    /// Nothing to return; any background handle is parked in the job table.
    Detached,
}

/// Compile `items`, launch the pipeline, and drive it as far as `captured`
/// demands.
///
/// The capture kind only constrains the last stage, and the builder may
/// still downgrade it (an uncapturable callable runs uncaptured), so the
/// shaping below trusts the compiled spec over the argument.
#[tracing::instrument(level = "debug", skip(ctx, items), fields(captured = %captured))]
pub fn run_subproc(
    ctx: &SessionContext,
    items: Vec<PipelineItem>,
    captured: CaptureKind,
) -> ProcsResult<RunOutcome> {
    let specs = cmds_to_specs(items, captured, ctx)?;
    let captured = specs.last().map(|s| s.captured).unwrap_or(captured);
    let background = specs.last().map_or(false, |s| s.background);
    let all_proxies = specs.iter().all(|s| s.is_callable());

    let mut pipeline = CommandPipeline::new(specs, ctx);

    let job = if all_proxies {
        None
    } else {
        let id = ctx.jobs.add_job(
            pipeline.command_text(),
            pipeline.pids(),
            pipeline.term_pgid(),
            background,
            None,
        );
        if background && ctx.flags.interactive && captured != CaptureKind::Object {
            ctx.jobs.announce_job(id);
        }
        Some(id)
    };
    pipeline.continue_last();
    debug!(?job, background, "pipeline launched");

    match captured {
        CaptureKind::Object => Ok(RunOutcome::Handle(pipeline)),
        CaptureKind::HiddenObject => {
            if !background {
                pipeline.end();
                pipeline.raise_if_failed()?;
            }
            Ok(RunOutcome::Handle(pipeline))
        }
        _ if background => {
            if let Some(id) = job {
                ctx.jobs.park_pipeline(id, pipeline);
            }
            Ok(RunOutcome::Detached)
        }
        CaptureKind::Stdout => {
            pipeline.end();
            pipeline.raise_if_failed()?;
            Ok(RunOutcome::Output(pipeline.output()))
        }
        CaptureKind::None => {
            pipeline.end();
            pipeline.raise_if_failed()?;
            Ok(RunOutcome::Detached)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcsError;

    fn ctx() -> SessionContext {
        SessionContext::new()
    }

    fn items(stages: &[&[&str]]) -> Vec<PipelineItem> {
        let mut items = Vec::new();
        for (i, stage) in stages.iter().enumerate() {
            if i > 0 {
                items.push(PipelineItem::Pipe);
            }
            items.push(PipelineItem::command(stage.iter().copied()));
        }
        items
    }

    #[test]
    fn stdout_capture_returns_the_text() {
        let ctx = ctx();
        let out = run_subproc(&ctx, items(&[&["echo", "hi"]]), CaptureKind::Stdout).unwrap();
        match out {
            RunOutcome::Output(s) => assert_eq!(s, "hi\n"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn object_capture_returns_a_live_handle() {
        let ctx = ctx();
        let out = run_subproc(
            &ctx,
            items(&[&["sh", "-c", "echo o; echo e >&2"]]),
            CaptureKind::Object,
        )
        .unwrap();
        let RunOutcome::Handle(mut handle) = out else {
            panic!("expected a handle");
        };
        assert_eq!(handle.out(), "o\n");
        assert_eq!(handle.err(), "e\n");
        assert_eq!(handle.returncode(), 0);
    }

    #[test]
    fn hidden_object_foreground_comes_back_ended() {
        let ctx = ctx();
        let out = run_subproc(&ctx, items(&[&["true"]]), CaptureKind::HiddenObject).unwrap();
        let RunOutcome::Handle(handle) = out else {
            panic!("expected a handle");
        };
        assert!(handle.ended());
        assert_eq!(handle.poll_returncode(), Some(0));
    }

    #[test]
    fn uncaptured_foreground_is_detached() {
        let ctx = ctx();
        let out = run_subproc(&ctx, items(&[&["true"]]), CaptureKind::None).unwrap();
        assert!(matches!(out, RunOutcome::Detached));
    }

    #[test]
    fn background_jobs_are_parked_in_the_table() {
        let ctx = ctx();
        let mut cmd = items(&[&["sleep", "0.3"]]);
        cmd.push(PipelineItem::Background);
        let out = run_subproc(&ctx, cmd, CaptureKind::Stdout).unwrap();
        assert!(matches!(out, RunOutcome::Detached));

        let jobs = ctx.jobs.list();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].background);
        let mut parked = ctx.jobs.take_pipeline(jobs[0].id).unwrap();
        assert_eq!(parked.returncode(), 0);
    }

    #[test]
    fn failures_raise_when_the_session_asks() {
        let mut ctx = ctx();
        ctx.flags.raise_subproc_error = true;
        let err = run_subproc(&ctx, items(&[&["false"]]), CaptureKind::Stdout).unwrap_err();
        match err {
            ProcsError::NonZeroExit { code, .. } => assert_eq!(code, 1),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn pipelines_of_callables_skip_the_job_table() {
        use std::io::Write;

        let mut aliases = crate::session::MapAliases::new();
        aliases.insert_callable(
            "greet",
            std::sync::Arc::new(|call| {
                writeln!(call.stdout, "hello").ok();
                Ok(oxsh_types::AliasReturn::Done)
            }),
        );
        let ctx = SessionContext::new().with_aliases(aliases);
        let out = run_subproc(&ctx, items(&[&["greet"]]), CaptureKind::Stdout).unwrap();
        match out {
            RunOutcome::Output(s) => assert_eq!(s, "hello\n"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(ctx.jobs.list().is_empty());
    }
}
