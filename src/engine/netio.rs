//! Parsing/formatting for the human-oriented network-I/O string
//! (`"1.2kB / 3.4kB"`) some engine stats surfaces report instead of raw
//! integral byte counts.

use super::NetIo;

/// Parse a `"<rx> / <tx>"` string where each side is a number followed by an
/// optional `{k,m,g}b` (or `{k,m,g}B`) suffix, powers of 1024.
///
/// Returns `(0, 0)` on malformed input rather than failing: this is a
/// best-effort display-string parser, not a wire-format decoder, and a
/// malformed sample should not be treated as a huge activity spike.
pub fn parse_net_io(s: &str) -> NetIo {
    let mut parts = s.split('/');
    let rx = parts.next().map(parse_one).unwrap_or(0);
    let tx = parts.next().map(parse_one).unwrap_or(0);
    NetIo { rx_bytes: rx, tx_bytes: tx }
}

fn parse_one(field: &str) -> u64 {
    let field = field.trim().to_lowercase();
    if field.is_empty() {
        return 0;
    }

    let (num_str, multiplier) = if let Some(num) = field.strip_suffix("gb").or_else(|| field.strip_suffix("g")) {
        (num, 1024u64 * 1024 * 1024)
    } else if let Some(num) = field.strip_suffix("mb").or_else(|| field.strip_suffix("m")) {
        (num, 1024u64 * 1024)
    } else if let Some(num) = field.strip_suffix("kb").or_else(|| field.strip_suffix("k")) {
        (num, 1024u64)
    } else if let Some(num) = field.strip_suffix('b') {
        (num, 1)
    } else {
        (field.as_str(), 1)
    };

    num_str
        .trim()
        .parse::<f64>()
        .map(|n| (n * multiplier as f64) as u64)
        .unwrap_or(0)
}

/// Format a byte count back into the human-oriented unit the parser above
/// accepts, matching Docker's own `stats` text rendering convention.
pub fn format_net_io(net_io: NetIo) -> String {
    format!("{} / {}", format_bytes(net_io.rx_bytes), format_bytes(net_io.tx_bytes))
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes = bytes as f64;

    if bytes >= GB {
        format!("{:.1}GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.1}kB", bytes / KB)
    } else {
        format!("{}B", bytes as u64)
    }
}
