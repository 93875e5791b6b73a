//! Capture policy for a pipeline's final stage.

use serde::{Deserialize, Serialize};

/// How the caller wants a pipeline's output delivered.
///
/// Only the last stage of a pipeline honors this; interior stages are forced
/// into an internal capture so their output stays inspectable without being
/// streamed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Stream everything live to the terminal; the caller gets nothing back.
    #[default]
    None,
    /// Buffer stdout (not streamed); stderr stays live. Caller gets a string.
    Stdout,
    /// Buffer and stream both streams. Caller gets a pipeline handle.
    Object,
    /// Same as `Object`, but the result is not echoed interactively.
    HiddenObject,
}

impl CaptureKind {
    /// True when the caller receives a pipeline handle rather than text.
    pub fn returns_handle(&self) -> bool {
        matches!(self, CaptureKind::Object | CaptureKind::HiddenObject)
    }

    /// True when the last stage's stdout is redirected into a capture buffer.
    pub fn captures_stdout(&self) -> bool {
        !matches!(self, CaptureKind::None)
    }

    /// True when the last stage's stderr is redirected into a capture buffer.
    pub fn captures_stderr(&self) -> bool {
        self.returns_handle()
    }

    /// True when captured stdout should also be echoed live as it arrives.
    pub fn streams_stdout(&self) -> bool {
        self.returns_handle()
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureKind::None => write!(f, "none"),
            CaptureKind::Stdout => write!(f, "stdout"),
            CaptureKind::Object => write!(f, "object"),
            CaptureKind::HiddenObject => write!(f, "hiddenobject"),
        }
    }
}

/// Policy for turning captured bytes into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Invalid UTF-8 becomes U+FFFD replacement characters.
    #[default]
    Replace,
    /// Invalid UTF-8 is dropped from the decoded text.
    Ignore,
}
