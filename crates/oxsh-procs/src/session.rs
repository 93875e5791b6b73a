//! Session context threaded through spec building and pipeline execution.
//!
//! Everything the engine needs from its host shell arrives through an
//! explicit [`SessionContext`] value: alias lookup, binary location, the
//! threadability predictor, the job table, feature flags, and hooks. There
//! is no ambient global; embedders construct one context and pass clones
//! around (the collaborators are shared behind `Arc`).

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use oxsh_types::{AliasReturn, DecodePolicy};

use crate::executables;
use crate::jobs::JobTable;

/// Environment variable that forces interior pipeline stages to capture,
/// so nested shells do not write through to the terminal out of order.
pub const CAPTURE_ALWAYS_ENV: &str = "OXSH_CAPTURE_ALWAYS";

/// Streams handed to a callable alias for one invocation.
pub struct AliasCall<'a> {
    pub args: &'a [String],
    pub stdin: Option<&'a mut dyn Read>,
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

/// A callable alias body. `Err` carries a diagnostic that lands on the
/// alias's stderr with exit code 1.
pub type AliasFn = Arc<dyn Fn(AliasCall<'_>) -> Result<AliasReturn, String> + Send + Sync>;

/// A callable alias plus the execution traits it declares.
#[derive(Clone)]
pub struct CallableAlias {
    pub func: AliasFn,
    /// May this run on a worker thread, or must it own the calling thread?
    pub threadable: bool,
    /// `Some(false)` opts out of output capture entirely.
    pub capturable: Option<bool>,
}

impl std::fmt::Debug for CallableAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableAlias")
            .field("threadable", &self.threadable)
            .field("capturable", &self.capturable)
            .finish_non_exhaustive()
    }
}

/// What an alias name resolves to.
#[derive(Debug, Clone)]
pub enum AliasKind {
    /// Replacement head tokens, spliced in front of the remaining words.
    Tokens(Vec<String>),
    /// An in-process callable.
    Callable(CallableAlias),
}

pub trait AliasResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<AliasKind>;
}

pub trait BinaryLocator: Send + Sync {
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

pub trait ThreadPredictor: Send + Sync {
    /// Whether the command can be driven from a background drain thread.
    fn threadable(&self, argv: &[String]) -> bool;
}

/// Alias table backed by a plain map. Embedders with richer semantics
/// implement [`AliasResolver`] themselves.
#[derive(Default)]
pub struct MapAliases {
    map: HashMap<String, AliasKind>,
}

impl MapAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tokens(&mut self, name: &str, tokens: Vec<String>) {
        self.map.insert(name.to_string(), AliasKind::Tokens(tokens));
    }

    pub fn insert_callable(&mut self, name: &str, func: AliasFn) {
        self.map.insert(
            name.to_string(),
            AliasKind::Callable(CallableAlias {
                func,
                threadable: true,
                capturable: None,
            }),
        );
    }

    pub fn insert(&mut self, name: &str, kind: AliasKind) {
        self.map.insert(name.to_string(), kind);
    }
}

impl AliasResolver for MapAliases {
    fn resolve(&self, name: &str) -> Option<AliasKind> {
        self.map.get(name).cloned()
    }
}

/// `PATH`-walking locator.
#[derive(Debug, Default)]
pub struct PathLocator {
    /// Overrides the `PATH` environment variable when set.
    pub search_path: Option<String>,
}

impl BinaryLocator for PathLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let path = match &self.search_path {
            Some(p) => p.clone(),
            None => std::env::var("PATH").unwrap_or_default(),
        };
        executables::locate_binary(name, &path)
    }
}

/// Predictor that marks known screen-oriented commands unthreadable and
/// assumes everything else tolerates a background drain.
#[derive(Debug)]
pub struct CommandsPredictor {
    unthreadable: HashSet<String>,
}

impl Default for CommandsPredictor {
    fn default() -> Self {
        let unthreadable = [
            "less", "more", "vi", "vim", "nvim", "nano", "emacs", "man", "top", "htop", "watch",
            "ssh", "tmux", "screen",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        CommandsPredictor { unthreadable }
    }
}

impl ThreadPredictor for CommandsPredictor {
    fn threadable(&self, argv: &[String]) -> bool {
        let Some(head) = argv.first() else {
            return true;
        };
        let base = head.rsplit('/').next().unwrap_or(head);
        !self.unthreadable.contains(base)
    }
}

/// Feature flags and tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionFlags {
    /// Interactive sessions take the terminal for foreground pipelines and
    /// announce background jobs.
    pub interactive: bool,
    /// Allow native commands to run under a threaded handle at all.
    pub thread_subprocs: bool,
    /// Force interior stages to capture even for uncaptured pipelines.
    pub capture_always: bool,
    /// Treat a lone directory name as `cd <dir>`.
    pub auto_cd: bool,
    /// Raise a failure for nonzero exit codes when the result is observed.
    pub raise_subproc_error: bool,
    /// Record the bytes fed to a redirected stdin.
    pub store_stdin: bool,
    pub decode: DecodePolicy,
    /// Baseline for the geometric drain backoff.
    pub poll_timeout: Duration,
    pub stderr_prefix: String,
    pub stderr_postfix: String,
}

impl Default for SessionFlags {
    fn default() -> Self {
        let capture_always = std::env::var(CAPTURE_ALWAYS_ENV)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        SessionFlags {
            interactive: false,
            thread_subprocs: true,
            capture_always,
            auto_cd: false,
            raise_subproc_error: false,
            store_stdin: false,
            decode: DecodePolicy::default(),
            poll_timeout: Duration::from_micros(100),
            stderr_prefix: String::new(),
            stderr_postfix: String::new(),
        }
    }
}

/// Host callbacks fired at well-defined points.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Fired when command resolution fails in an interactive session,
    /// before the error is returned.
    pub on_command_not_found: Vec<Arc<dyn Fn(&[String]) + Send + Sync>>,
    /// Fired with the pipeline's exit code as it reaches Ended.
    pub on_returncode: Vec<Arc<dyn Fn(i32) + Send + Sync>>,
}

impl Hooks {
    pub fn fire_command_not_found(&self, cmd: &[String]) {
        for hook in &self.on_command_not_found {
            hook(cmd);
        }
    }

    pub fn fire_returncode(&self, code: i32) {
        for hook in &self.on_returncode {
            hook(code);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_command_not_found", &self.on_command_not_found.len())
            .field("on_returncode", &self.on_returncode.len())
            .finish()
    }
}

/// Shared state for one shell session.
#[derive(Clone)]
pub struct SessionContext {
    pub flags: SessionFlags,
    pub aliases: Arc<dyn AliasResolver>,
    pub locator: Arc<dyn BinaryLocator>,
    pub predictor: Arc<dyn ThreadPredictor>,
    pub jobs: Arc<JobTable>,
    pub hooks: Hooks,
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext {
            flags: SessionFlags::default(),
            aliases: Arc::new(MapAliases::new()),
            locator: Arc::new(PathLocator::default()),
            predictor: Arc::new(CommandsPredictor::default()),
            jobs: Arc::new(JobTable::new()),
            hooks: Hooks::default(),
        }
    }

    pub fn with_aliases(mut self, aliases: MapAliases) -> Self {
        self.aliases = Arc::new(aliases);
        self
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("flags", &self.flags)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_aliases_resolve() {
        let mut aliases = MapAliases::new();
        aliases.insert_tokens("ll", vec!["ls".into(), "-l".into()]);
        match aliases.resolve("ll") {
            Some(AliasKind::Tokens(toks)) => assert_eq!(toks, vec!["ls", "-l"]),
            other => panic!("unexpected resolution {other:?}"),
        }
        assert!(aliases.resolve("missing").is_none());
    }

    #[test]
    fn predictor_flags_pagers() {
        let predictor = CommandsPredictor::default();
        assert!(!predictor.threadable(&["less".into(), "file".into()]));
        assert!(!predictor.threadable(&["/usr/bin/vim".into()]));
        assert!(predictor.threadable(&["echo".into(), "hi".into()]));
        assert!(predictor.threadable(&[]));
    }

    #[test]
    fn locator_finds_sh() {
        let locator = PathLocator {
            search_path: Some("/usr/bin:/bin".to_string()),
        };
        assert!(locator.locate("sh").is_some());
        assert!(locator.locate("no-such-binary-here").is_none());
    }

    #[test]
    fn default_flags() {
        let flags = SessionFlags::default();
        assert!(!flags.interactive);
        assert!(flags.thread_subprocs);
        assert!(!flags.raise_subproc_error);
        assert_eq!(flags.poll_timeout, Duration::from_micros(100));
    }
}
