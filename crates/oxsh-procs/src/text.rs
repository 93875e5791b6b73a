//! Byte-to-text munging shared by readers, proxies, and the pipeline.
//!
//! Captured output keeps two forms: the raw bytes exactly as the child wrote
//! them, and a cleaned decoded form with universal newlines and terminal
//! escape sequences stripped. The cleaning rules here apply only to the
//! decoded form; raw buffers are never touched.

use std::sync::LazyLock;

use regex::bytes::Regex;

use oxsh_types::DecodePolicy;

/// Invisible prompt-marker bytes (SOH..STX) and VT100 control sequences.
static RE_HIDE_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)(\x01.*?\x02|(\x9B|\x1B\[)[0-?]*[ -/]*[@-~])")
        .expect("fixed pattern compiles")
});

/// Decode bytes according to the session's policy.
pub fn decode_bytes(policy: DecodePolicy, bytes: &[u8]) -> String {
    match policy {
        DecodePolicy::Replace => String::from_utf8_lossy(bytes).into_owned(),
        DecodePolicy::Ignore => {
            let mut out = String::with_capacity(bytes.len());
            let mut rest = bytes;
            loop {
                match std::str::from_utf8(rest) {
                    Ok(s) => {
                        out.push_str(s);
                        break;
                    }
                    Err(e) => {
                        let (valid, after) = rest.split_at(e.valid_up_to());
                        // valid_up_to guarantees this slice is UTF-8
                        out.push_str(std::str::from_utf8(valid).unwrap_or(""));
                        match e.error_len() {
                            Some(len) => rest = &after[len..],
                            None => break,
                        }
                    }
                }
            }
            out
        }
    }
}

/// Split a chunk into lines, keeping the line endings.
///
/// Splits after `\n`, and after a `\r` that is not part of `\r\n`. A chunk
/// that ends mid-line yields its tail as a final element, so concatenating
/// the pieces always reproduces the input exactly.
pub fn split_lines_keepends(chunk: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chunk.len() {
        match chunk[i] {
            b'\n' => {
                lines.push(chunk[start..=i].to_vec());
                start = i + 1;
            }
            b'\r' => {
                if chunk.get(i + 1) != Some(&b'\n') {
                    lines.push(chunk[start..=i].to_vec());
                    start = i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if start < chunk.len() {
        lines.push(chunk[start..].to_vec());
    }
    lines
}

/// Clean one captured line: normalize the ending, strip escapes, decode.
pub fn sanitize_line(policy: DecodePolicy, line: &[u8]) -> String {
    let mut line = line.to_vec();
    if line.ends_with(b"\r\n") {
        line.truncate(line.len() - 2);
        line.push(b'\n');
    } else if line.ends_with(b"\r") {
        line.truncate(line.len() - 1);
        line.push(b'\n');
    }
    let stripped = RE_HIDE_ESCAPE.replace_all(&line, &b""[..]);
    decode_bytes(policy, &stripped)
}

/// Clean a whole captured block: universal newlines, strip escapes, decode.
pub fn sanitize_block(policy: DecodePolicy, block: &[u8]) -> String {
    let mut out = Vec::with_capacity(block.len());
    let mut i = 0;
    while i < block.len() {
        match block[i] {
            b'\r' => {
                out.push(b'\n');
                if block.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    let stripped = RE_HIDE_ESCAPE.replace_all(&out, &b""[..]);
    decode_bytes(policy, &stripped)
}
