//! Byte-count formatting and UTF-8 safe truncation of diagnostic text.

/// Format a byte count into IEC units (KiB, MiB, GiB, TiB) with trimmed precision.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes} B");
    }

    let precision = if value >= 10.0 { 1 } else { 2 };
    let rendered = format!("{value:.precision$}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered} {}", UNITS[unit])
}

/// Keep at most `max` bytes from the end of `raw`, decoded lossily and cut on a char boundary.
pub fn tail_utf8(raw: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }

    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Keep at most `max` bytes from the start of `text`, cut on a char boundary.
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
