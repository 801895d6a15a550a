//! Hex dump helpers for frame logging.

use std::fmt::Write;

/// Uppercase hex, 16 bytes per line.
pub fn pretty(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + data.len() / 16 + 1);
    for line in data.chunks(16) {
        for b in line {
            let _ = write!(out, "{b:02X}");
        }
        out.push('\n');
    }
    out
}

/// Uppercase hex of at most `limit` leading bytes, for one-line log fields.
pub fn head(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    let mut out: String = shown.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02X} ");
        s
    });
    out.pop();
    if data.len() > limit {
        out.push_str(" ..");
    }
    out
}
