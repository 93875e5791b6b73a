//! Locating executables and preparing script commands.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{ProcsError, ProcsResult};

/// True when `path` is a regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

fn is_readable(path: &Path) -> bool {
    File::open(path).is_ok()
}

/// Walk a `PATH`-style string and return the first executable match.
///
/// Names containing a path separator are resolved directly and never
/// searched for.
pub fn locate_binary(name: &str, search_path: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Some(path);
        }
        return None;
    }
    for dir in search_path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Heuristic binary detection: a NUL byte in the first 80 bytes before any
/// newline marks the file as binary.
pub fn is_binary_file(path: &Path) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 80];
    let n = match file.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    for &byte in &buf[..n] {
        if byte == b'\n' {
            return false;
        }
        if byte == 0 {
            return true;
        }
    }
    false
}

/// Strip wrappers a shebang line does not need: `/usr/bin/env` disappears
/// entirely, and interpreters living in the usual system bins reduce to
/// their base name so `PATH` decides.
fn un_shebang(token: &str) -> Vec<String> {
    if token == "/usr/bin/env" {
        return Vec::new();
    }
    for prefix in ["/usr/bin/", "/usr/local/bin/", "/bin/"] {
        if let Some(base) = token.strip_prefix(prefix) {
            return vec![base.to_string()];
        }
    }
    vec![token.to_string()]
}

/// Read a script's shebang and rewrite `cmd` to invoke the interpreter
/// explicitly.
///
/// Returns `Ok(None)` when the file should be handed to the OS as-is: it
/// looks binary, or it cannot be read (setuid scripts land here). A file
/// with no execute bit at all is a hard error.
pub fn script_command(path: &Path, args: &[String]) -> ProcsResult<Option<Vec<String>>> {
    if !is_executable(path) {
        return Err(ProcsError::PermissionDenied(path.display().to_string()));
    }
    if !is_readable(path) {
        // executable but unreadable, let the kernel run it directly
        return Ok(None);
    }
    if is_binary_file(path) {
        return Ok(None);
    }

    let first_line = {
        let mut file = File::open(path).map_err(ProcsError::from)?;
        let mut buf = [0u8; 256];
        let n = file.read(&mut buf).map_err(ProcsError::from)?;
        String::from_utf8_lossy(&buf[..n])
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    };

    let mut command = Vec::new();
    if let Some(rest) = first_line.strip_prefix("#!") {
        for token in rest.split_whitespace() {
            command.extend(un_shebang(token));
        }
    }
    if command.is_empty() {
        // no usable shebang, fall back to the system shell
        command.push("sh".to_string());
    }
    command.push(path.display().to_string());
    command.extend(args.iter().cloned());
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    fn write_script(dir: &Path, name: &str, contents: &[u8], mode: u32) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&path)
            .unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn locates_common_binaries() {
        let found = locate_binary("sh", "/usr/bin:/bin");
        assert!(found.is_some(), "sh should exist on any unix");
    }

    #[test]
    fn path_separator_bypasses_search() {
        assert_eq!(locate_binary("definitely/not-here", ""), None);
        let sh = locate_binary("sh", "/usr/bin:/bin").unwrap();
        let direct = locate_binary(sh.to_str().unwrap(), "");
        assert_eq!(direct, Some(sh));
    }

    #[test]
    fn shebang_is_spliced() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "hello.sh", b"#!/bin/sh\necho hi\n", 0o755);
        let cmd = script_command(&script, &["arg".to_string()]).unwrap().unwrap();
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], script.display().to_string());
        assert_eq!(cmd[2], "arg");
    }

    #[test]
    fn env_wrapper_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "hello", b"#!/usr/bin/env sh\necho hi\n", 0o755);
        let cmd = script_command(&script, &[]).unwrap().unwrap();
        assert_eq!(cmd[0], "sh");
    }

    #[test]
    fn binary_files_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let blob = write_script(dir.path(), "blob", b"\x7fELF\x00\x01\x02", 0o755);
        assert!(is_binary_file(&blob));
        assert_eq!(script_command(&blob, &[]).unwrap(), None);
    }

    #[test]
    fn unexecutable_script_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "noexec.sh", b"#!/bin/sh\n", 0o644);
        let err = script_command(&script, &[]).unwrap_err();
        assert!(matches!(err, ProcsError::PermissionDenied(_)));
    }

    #[test]
    fn missing_shebang_uses_shell() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "plain.sh", b"echo hi\n", 0o755);
        let cmd = script_command(&script, &[]).unwrap().unwrap();
        assert_eq!(cmd[0], "sh");
    }
}
