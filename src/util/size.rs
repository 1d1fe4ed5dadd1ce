//! Size helper functions.

/// Convert kilobytes to bytes.
#[inline]
pub const fn kb(n: usize) -> usize {
    n * 1024
}

/// Convert megabytes to bytes.
#[inline]
pub const fn mb(n: usize) -> usize {
    n * 1024 * 1024
}

/// Parse a byte count such as `"4096"`, `"64k"`, `"16M"` or `"1g"`.
///
/// Used for the `TLSFALLOC_*` environment overrides.
pub fn parse_bytes(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, scale) = match text.char_indices().last()? {
        (i, 'k' | 'K') => (&text[..i], kb(1)),
        (i, 'm' | 'M') => (&text[..i], mb(1)),
        (i, 'g' | 'G') => (&text[..i], mb(1024)),
        _ => (text, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_conversions() {
        assert_eq!(kb(1), 1024);
        assert_eq!(mb(1), 1024 * 1024);
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("64k"), Some(kb(64)));
        assert_eq!(parse_bytes(" 16M "), Some(mb(16)));
        assert_eq!(parse_bytes("1g"), Some(mb(1024)));
        assert_eq!(parse_bytes("lots"), None);
        assert_eq!(parse_bytes(""), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }
}
