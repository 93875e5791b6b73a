//! Stream slots and redirect token parsing.
//!
//! A [`StreamSlot`] is the build-time assignment of one standard stream.
//! Slots own their OS resources (`OwnedFd` pipe ends, opened `File`s), so
//! dropping an unused slot is the one place its descriptor closes.
//!
//! Redirect tokens follow the usual shell grammar with spelled-out stream
//! names allowed on either side of the operator: `>`, `>>`, `<`, `2>`,
//! `e>f`, `all>f`, `&>f`, `2>&1`, `o>e` and friends.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ProcsError, ProcsResult};

static REDIR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(o(?:ut)?|e(?:rr)?|a(?:ll)?|&?\d?)(>?>|<)(o(?:ut)?|e(?:rr)?|a(?:ll)?|&?\d?)$")
        .expect("fixed pattern compiles")
});

static E2O_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(2|e|err)>(1|o|out)$").expect("fixed pattern compiles"));

static O2E_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(1|o|out)>(2|e|err)$").expect("fixed pattern compiles"));

/// Where one standard stream of a subprocess points.
#[derive(Debug)]
pub enum StreamSlot {
    /// Explicitly wired to the parent's stream (`>&1` on stdout, `2>&2`).
    Inherit,
    /// One end of an anonymous pipe, owned until launch.
    Pipe(OwnedFd),
    /// An opened redirect target.
    File(File),
    /// Duplicate whatever stdout resolves to (stderr side of `2>&1`).
    MergeWithOut,
    /// Duplicate whatever stderr resolves to (stdout side of `o>e`).
    MergeWithErr,
}

/// Parsed slots produced by one redirect token.
#[derive(Debug, Default)]
pub struct RedirectOutcome {
    pub stdin: Option<StreamSlot>,
    pub stdout: Option<StreamSlot>,
    pub stderr: Option<StreamSlot>,
}

/// True when `token` has the shape of a redirect operator.
pub fn is_redirect_token(token: &str) -> bool {
    REDIR_REGEX.is_match(token)
}

fn is_out_name(name: &str) -> bool {
    matches!(name, "" | "1" | "o" | "out")
}

fn is_err_name(name: &str) -> bool {
    matches!(name, "2" | "e" | "err")
}

fn is_all_name(name: &str) -> bool {
    matches!(name, "&" | "a" | "all")
}

fn open_read(loc: &str) -> ProcsResult<File> {
    File::open(loc).map_err(|err| open_error(loc, &err))
}

fn open_write(loc: &str, append: bool) -> ProcsResult<File> {
    File::options()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(loc)
        .map_err(|err| open_error(loc, &err))
}

fn open_error(loc: &str, err: &std::io::Error) -> ProcsError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ProcsError::PermissionDenied(loc.to_string()),
        std::io::ErrorKind::NotFound => {
            ProcsError::Io(format!("{loc}: no such file or directory"))
        }
        _ => ProcsError::Io(format!("{loc}: unable to open file")),
    }
}

/// Turn a redirect token (and its optional target word) into stream slots.
///
/// Merges like `2>&1` and `o>e` produce marker slots resolved against the
/// other stream's destination at launch time.
pub fn redirect_streams(token: &str, target: Option<&str>) -> ProcsResult<RedirectOutcome> {
    let mut outcome = RedirectOutcome::default();

    let no_amp = token.replace('&', "");
    if E2O_REGEX.is_match(&no_amp) {
        if target.is_some() {
            return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
        }
        outcome.stderr = Some(StreamSlot::MergeWithOut);
        return Ok(outcome);
    }
    if O2E_REGEX.is_match(&no_amp) {
        if target.is_some() {
            return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
        }
        outcome.stdout = Some(StreamSlot::MergeWithErr);
        return Ok(outcome);
    }

    let caps = REDIR_REGEX
        .captures(token)
        .ok_or_else(|| ProcsError::UnrecognizedRedirect(token.to_string()))?;
    let orig = caps.get(1).map_or("", |m| m.as_str());
    let mode = caps.get(2).map_or("", |m| m.as_str());
    let dest = caps.get(3).map_or("", |m| m.as_str());

    if let Some(fd_name) = dest.strip_prefix('&') {
        // `>&N` duplicates a parent descriptor; a filename makes no sense
        if target.is_some() || mode == "<" {
            return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
        }
        match (fd_name, orig) {
            ("1", o) if is_out_name(o) => outcome.stdout = Some(StreamSlot::Inherit),
            ("2", o) if is_out_name(o) => outcome.stdout = Some(StreamSlot::MergeWithErr),
            ("1", e) if is_err_name(e) => outcome.stderr = Some(StreamSlot::MergeWithOut),
            ("2", e) if is_err_name(e) => outcome.stderr = Some(StreamSlot::Inherit),
            _ => return Err(ProcsError::UnrecognizedRedirect(token.to_string())),
        }
        return Ok(outcome);
    }

    match mode {
        "<" => {
            if !orig.is_empty() || !dest.is_empty() {
                return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
            }
            let loc =
                target.ok_or_else(|| ProcsError::UnrecognizedRedirect(token.to_string()))?;
            outcome.stdin = Some(StreamSlot::File(open_read(loc)?));
        }
        ">" | ">>" => {
            if !dest.is_empty() {
                return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
            }
            let loc =
                target.ok_or_else(|| ProcsError::UnrecognizedRedirect(token.to_string()))?;
            let append = mode == ">>";
            if is_all_name(orig) {
                // one open file, both streams share the offset
                let file = open_write(loc, append)?;
                let clone = file.try_clone().map_err(ProcsError::from)?;
                outcome.stdout = Some(StreamSlot::File(file));
                outcome.stderr = Some(StreamSlot::File(clone));
            } else if is_out_name(orig) {
                outcome.stdout = Some(StreamSlot::File(open_write(loc, append)?));
            } else if is_err_name(orig) {
                outcome.stderr = Some(StreamSlot::File(open_write(loc, append)?));
            } else {
                return Err(ProcsError::UnrecognizedRedirect(token.to_string()));
            }
        }
        _ => return Err(ProcsError::UnrecognizedRedirect(token.to_string())),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn recognizes_redirect_tokens() {
        for token in [">", ">>", "<", "2>", "e>", "err>", "o>e", "2>&1", "&>", "a>>", "all>"] {
            assert!(is_redirect_token(token), "{token} should parse");
        }
        for token in ["echo", ">>>", "12>", "ee>", ""] {
            assert!(!is_redirect_token(token), "{token} should not parse");
        }
    }

    #[test]
    fn merge_tokens_yield_markers() {
        let out = redirect_streams("2>&1", None).unwrap();
        assert!(matches!(out.stderr, Some(StreamSlot::MergeWithOut)));
        assert!(out.stdout.is_none());

        let out = redirect_streams("o>e", None).unwrap();
        assert!(matches!(out.stdout, Some(StreamSlot::MergeWithErr)));

        let out = redirect_streams("err>out", None).unwrap();
        assert!(matches!(out.stderr, Some(StreamSlot::MergeWithOut)));
    }

    #[test]
    fn dup_tokens_resolve_inherit_and_swap() {
        let out = redirect_streams(">&2", None).unwrap();
        assert!(matches!(out.stdout, Some(StreamSlot::MergeWithErr)));
        let out = redirect_streams(">&1", None).unwrap();
        assert!(matches!(out.stdout, Some(StreamSlot::Inherit)));
        let out = redirect_streams("2>&2", None).unwrap();
        assert!(matches!(out.stderr, Some(StreamSlot::Inherit)));
    }

    #[test]
    fn write_and_append_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "x").unwrap();

        let out = redirect_streams(">>", Some(path.to_str().unwrap())).unwrap();
        match out.stdout {
            Some(StreamSlot::File(mut f)) => f.write_all(b"y").unwrap(),
            other => panic!("expected file slot, got {other:?}"),
        }
        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "xy");

        let out = redirect_streams(">", Some(path.to_str().unwrap())).unwrap();
        assert!(matches!(out.stdout, Some(StreamSlot::File(_))));
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 0, "plain > truncates");
    }

    #[test]
    fn all_redirect_opens_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both.txt");
        let out = redirect_streams("&>", Some(path.to_str().unwrap())).unwrap();
        assert!(matches!(out.stdout, Some(StreamSlot::File(_))));
        assert!(matches!(out.stderr, Some(StreamSlot::File(_))));
    }

    #[test]
    fn read_redirect_requires_plain_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "data").unwrap();
        let out = redirect_streams("<", Some(path.to_str().unwrap())).unwrap();
        assert!(matches!(out.stdin, Some(StreamSlot::File(_))));

        let err = redirect_streams("<", None).unwrap_err();
        assert!(matches!(err, ProcsError::UnrecognizedRedirect(_)));
    }

    #[test]
    fn missing_input_file_reports_location() {
        let err = redirect_streams("<", Some("/definitely/not/here")).unwrap_err();
        match err {
            ProcsError::Io(msg) => assert!(msg.contains("no such file or directory")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_fd_numbers_are_rejected() {
        assert!(redirect_streams("3>", Some("/tmp/x")).is_err());
        assert!(redirect_streams(">&3", None).is_err());
        assert!(redirect_streams("2>&1", Some("somewhere")).is_err());
    }
}
