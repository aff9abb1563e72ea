//! Logging utilities for rendering raw frame bytes and controller strings so
//! diagnostic logs stay single-line and bounded.

use std::fmt::Write;

/// Render up to `max` bytes of a frame as lowercase hex for debug logs.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 2 + 1);
    for b in &data[..shown] {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > shown {
        out.push('…');
    }
    out
}

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
