//! End-to-end pipeline scenarios driven through the public API.
//!
//! These tests exercise the whole path an embedding shell takes: pipeline
//! items in, compiled specs, launched processes, and the shaped outcome
//! back out.

use std::io::Write;
use std::sync::Arc;

use oxsh_procs::{
    run_subproc, CommandPipeline, MapAliases, PipelineItem, ProcsError, RunOutcome,
    SessionContext,
};
use oxsh_types::{AliasReturn, CaptureKind};

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

fn output_of(ctx: &SessionContext, stages: &[&[&str]]) -> String {
    match run_subproc(ctx, items(stages), CaptureKind::Stdout).unwrap() {
        RunOutcome::Output(s) => s,
        other => panic!("expected captured output, got {other:?}"),
    }
}

// ============================================================================
// String capture
// ============================================================================

#[test]
fn single_stage_capture_is_exact() {
    let ctx = SessionContext::new();
    assert_eq!(output_of(&ctx, &[&["echo", "hi"]]), "hi\n");
}

#[test]
fn capture_survives_many_underlying_reads() {
    // well past one reader chunk, so the capture spans several reads
    let ctx = SessionContext::new();
    let out = output_of(&ctx, &[&["seq", "1", "2000"]]);
    let expected: String = (1..=2000).map(|n| format!("{n}\n")).collect();
    assert_eq!(out, expected);
}

#[test]
fn capture_keeps_escape_sequences() {
    let ctx = SessionContext::new();
    let out = output_of(&ctx, &[&["printf", "\u{1b}[31mred\u{1b}[0m\\n"]]);
    assert_eq!(out, "\u{1b}[31mred\u{1b}[0m\n");
}

// ============================================================================
// Pipes
// ============================================================================

#[test]
fn two_stage_pipeline_filters() {
    let ctx = SessionContext::new();
    assert_eq!(output_of(&ctx, &[&["echo", "hi"], &["grep", "h"]]), "hi\n");
    assert_eq!(output_of(&ctx, &[&["echo", "hi"], &["grep", "x"]]), "");
}

#[test]
fn three_stage_pipeline_composes() {
    let ctx = SessionContext::new();
    let out = output_of(
        &ctx,
        &[&["seq", "1", "10"], &["grep", "1"], &["sort", "-r"]],
    );
    assert_eq!(out, "10\n1\n");
}

#[test]
fn slow_upstream_is_not_cut_off() {
    let ctx = SessionContext::new();
    let out = output_of(
        &ctx,
        &[&["sh", "-c", "sleep 0.3; printf 'late\\n'"], &["cat"]],
    );
    assert_eq!(out, "late\n");
}

// ============================================================================
// Redirects
// ============================================================================

#[test]
fn file_redirects_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let path = path.to_str().unwrap();

    let ctx = SessionContext::new();
    let out = run_subproc(
        &ctx,
        items(&[&["echo", "stored", ">", path]]),
        CaptureKind::None,
    )
    .unwrap();
    assert!(matches!(out, RunOutcome::Detached));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "stored\n");

    assert_eq!(output_of(&ctx, &[&["cat", "<", path]]), "stored\n");
}

#[test]
fn merge_redirect_folds_stderr_into_the_capture() {
    let ctx = SessionContext::new();
    let out = run_subproc(
        &ctx,
        items(&[&["sh", "-c", "echo out; echo err >&2", "2>&1"]]),
        CaptureKind::Object,
    )
    .unwrap();
    let RunOutcome::Handle(mut handle) = out else {
        panic!("expected a handle");
    };
    assert_eq!(handle.out(), "out\nerr\n");
    assert_eq!(handle.err(), "");
}

#[test]
fn conflicting_redirects_fail_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let err = run_subproc(
        &SessionContext::new(),
        items(&[&["echo", "x", ">", a.to_str().unwrap(), ">", b.to_str().unwrap()]]),
        CaptureKind::None,
    )
    .unwrap_err();
    match err {
        ProcsError::MultipleRedirect { stream, .. } => assert_eq!(stream, "stdout"),
        other => panic!("unexpected error {other}"),
    }
}

// ============================================================================
// Aliases and callables
// ============================================================================

#[test]
fn token_aliases_expand_before_launch() {
    let mut aliases = MapAliases::new();
    aliases.insert_tokens("say", vec!["echo".into(), "prefix".into()]);
    let ctx = SessionContext::new().with_aliases(aliases);
    assert_eq!(output_of(&ctx, &[&["say", "word"]]), "prefix word\n");
}

#[test]
fn callable_streams_map_to_handle_fields() {
    let mut aliases = MapAliases::new();
    aliases.insert_callable(
        "report",
        Arc::new(|_call| {
            Ok(AliasReturn::Streams {
                out: Some("out".into()),
                err: Some("err".into()),
                code: Some(1),
            })
        }),
    );
    let ctx = SessionContext::new().with_aliases(aliases);
    let outcome = run_subproc(&ctx, items(&[&["report"]]), CaptureKind::Object).unwrap();
    let RunOutcome::Handle(mut handle) = outcome else {
        panic!("expected a handle");
    };
    assert_eq!(handle.out(), "out");
    assert_eq!(handle.err(), "err");
    assert_eq!(handle.returncode(), 1);
}

#[test]
fn callables_pipe_into_native_stages() {
    let mut aliases = MapAliases::new();
    aliases.insert_callable(
        "emit",
        Arc::new(|call| {
            writeln!(call.stdout, "beta").ok();
            writeln!(call.stdout, "alpha").ok();
            Ok(AliasReturn::Done)
        }),
    );
    let ctx = SessionContext::new().with_aliases(aliases);
    assert_eq!(
        output_of(&ctx, &[&["emit"], &["sort"]]),
        "alpha\nbeta\n"
    );
}

// ============================================================================
// Outcomes and the job table
// ============================================================================

#[test]
fn background_run_returns_none_and_registers_a_job() {
    let ctx = SessionContext::new();
    let mut cmd = items(&[&["sh", "-c", "sleep 0.4; exit 7"]]);
    cmd.push(PipelineItem::Background);
    let out = run_subproc(&ctx, cmd, CaptureKind::None).unwrap();
    assert!(matches!(out, RunOutcome::Detached));

    let jobs = ctx.jobs.list();
    assert_eq!(jobs.len(), 1, "expected one registered job: {jobs:?}");
    assert!(jobs[0].background);

    let mut parked: CommandPipeline = ctx.jobs.take_pipeline(jobs[0].id).unwrap();
    assert_eq!(parked.returncode(), 7);
}

#[test]
fn object_capture_reports_the_exit_code() {
    let ctx = SessionContext::new();
    let outcome = run_subproc(
        &ctx,
        items(&[&["sh", "-c", "exit 4"]]),
        CaptureKind::Object,
    )
    .unwrap();
    let RunOutcome::Handle(mut handle) = outcome else {
        panic!("expected a handle");
    };
    assert_eq!(handle.returncode(), 4);
}

#[test]
fn handle_capture_splits_lines_with_endings_kept() {
    let ctx = SessionContext::new();
    let outcome = run_subproc(
        &ctx,
        items(&[&["printf", "one\\ntwo\\nthree\\n"]]),
        CaptureKind::Object,
    )
    .unwrap();
    let RunOutcome::Handle(mut handle) = outcome else {
        panic!("expected a handle");
    };
    assert_eq!(handle.out(), "one\ntwo\nthree\n");
    assert_eq!(handle.lines(), ["one\n", "two\n", "three\n"]);
}

#[test]
fn unknown_commands_error_before_any_spawn() {
    let err = run_subproc(
        &SessionContext::new(),
        items(&[&["no-such-binary-abcdef"]]),
        CaptureKind::Stdout,
    )
    .unwrap_err();
    match err {
        ProcsError::CommandNotFound(cmd) => assert_eq!(cmd, "no-such-binary-abcdef"),
        other => panic!("unexpected error {other}"),
    }
}
