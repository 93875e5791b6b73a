//! oxsh-procs: the subprocess pipeline engine of oxsh.
//!
//! This crate provides:
//!
//! - **Spec building**: argument tokens plus redirects resolved into a
//!   launchable [`SubprocSpec`] (aliases expanded, binaries located, launch
//!   strategy chosen)
//! - **Pipeline compilation**: command/`|`/`&` items wired into connected
//!   specs with the capture policy applied to the last stage
//! - **Process handles**: native children, threaded and foreground callable
//!   proxies, and the pumped wrapper with pty and alternate-screen support,
//!   all behind [`ProcHandle`]
//! - **Orchestration**: [`CommandPipeline`] launches the stages, drains and
//!   tees captured output, handles suspend/resume, and settles return codes
//! - **Jobs**: a POSIX-numbered [`JobTable`] for background and stopped
//!   pipelines
//! - **Entry point**: [`run_subproc`] for embedding shells
//!
//! Everything runs on plain OS threads; there is no async runtime here.

pub mod compile;
pub mod error;
pub mod executables;
pub mod jobs;
pub mod pipeline;
pub mod proc;
pub mod proxies;
pub mod pump;
pub mod readers;
pub mod redirect;
pub mod run;
pub mod session;
pub mod signals;
pub mod spec;
pub mod terminal;
pub mod text;

pub use compile::{cmds_to_specs, PipelineItem};
pub use error::{ProcsError, ProcsResult};
pub use jobs::JobTable;
pub use pipeline::CommandPipeline;
pub use proc::{signal_message, NativeProc, ProcHandle, WaitResult};
pub use run::{run_subproc, RunOutcome};
pub use spec::{LaunchStrategy, ResolvedCommand, SubprocSpec};

// Session wiring (embedders construct one context and pass it around)
pub use session::{
    AliasCall, AliasFn, AliasKind, AliasResolver, BinaryLocator, CallableAlias,
    CommandsPredictor, Hooks, MapAliases, PathLocator, SessionContext, SessionFlags,
    ThreadPredictor, CAPTURE_ALWAYS_ENV,
};

// Output plumbing (for embedders that drive handles directly)
pub use readers::{QueueReader, SharedOutBuf};
