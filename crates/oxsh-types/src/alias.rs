//! Return-value protocol for callable aliases.

/// What a callable alias hands back when it finishes.
///
/// The proxy that ran the callable translates this into stream writes and an
/// exit code:
///
/// - `Done`: success, exit 0.
/// - `Code(n)`: exit `n`, nothing written.
/// - `Text(s)`: `s` written to stdout, exit 0.
/// - `Streams { .. }`: each present string written to its stream, exit
///   `code` (0 when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasReturn {
    Done,
    Code(i32),
    Text(String),
    Streams {
        out: Option<String>,
        err: Option<String>,
        code: Option<i32>,
    },
}

impl AliasReturn {
    /// The exit code this return value implies.
    pub fn exit_code(&self) -> i32 {
        match self {
            AliasReturn::Done | AliasReturn::Text(_) => 0,
            AliasReturn::Code(code) => *code,
            AliasReturn::Streams { code, .. } => code.unwrap_or(0),
        }
    }
}

impl From<i32> for AliasReturn {
    fn from(code: i32) -> Self {
        AliasReturn::Code(code)
    }
}

impl From<String> for AliasReturn {
    fn from(text: String) -> Self {
        AliasReturn::Text(text)
    }
}

impl From<&str> for AliasReturn {
    fn from(text: &str) -> Self {
        AliasReturn::Text(text.to_string())
    }
}

impl From<()> for AliasReturn {
    fn from(_: ()) -> Self {
        AliasReturn::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(AliasReturn::Done.exit_code(), 0);
        assert_eq!(AliasReturn::Code(2).exit_code(), 2);
        assert_eq!(AliasReturn::Text("x".into()).exit_code(), 0);
        let streams = AliasReturn::Streams {
            out: Some("o".into()),
            err: Some("e".into()),
            code: Some(1),
        };
        assert_eq!(streams.exit_code(), 1);
        let streams = AliasReturn::Streams {
            out: None,
            err: None,
            code: None,
        };
        assert_eq!(streams.exit_code(), 0);
    }

    #[test]
    fn conversions() {
        assert_eq!(AliasReturn::from(7), AliasReturn::Code(7));
        assert_eq!(AliasReturn::from("hi"), AliasReturn::Text("hi".into()));
        assert_eq!(AliasReturn::from(()), AliasReturn::Done);
    }
}
