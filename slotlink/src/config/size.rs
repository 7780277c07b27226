//! Human-readable byte sizes ("2MB", "512KB").

use thiserror::Error;

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '2MB', '512KB', or '65536'")]
pub struct SizeParseError {
    input: String,
}

const UNITS: [(&str, usize); 6] = [
    ("GB", 1024 * 1024 * 1024),
    ("G", 1024 * 1024 * 1024),
    ("MB", 1024 * 1024),
    ("M", 1024 * 1024),
    ("KB", 1024),
    ("K", 1024),
];

/// Parse a size string into bytes.
///
/// Bare numbers are bytes; `K`/`KB`, `M`/`MB` and `G`/`GB` suffixes are
/// binary multiples. Case and surrounding whitespace are ignored.
///
/// ```
/// use slotlink::config::parse_size;
///
/// assert_eq!(parse_size("65536").unwrap(), 65536);
/// assert_eq!(parse_size("2MB").unwrap(), 2 * 1024 * 1024);
/// assert_eq!(parse_size("512 kb").unwrap(), 512 * 1024);
/// ```
pub fn parse_size(s: &str) -> Result<usize, SizeParseError> {
    let err = || SizeParseError {
        input: s.to_string(),
    };
    let upper = s.trim().to_uppercase();
    if upper.is_empty() {
        return Err(err());
    }

    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|rest| (rest, *mult)))
        .unwrap_or((upper.as_str(), 1));

    let num: usize = digits.trim().parse().map_err(|_| err())?;
    num.checked_mul(multiplier).ok_or_else(err)
}

/// Format a byte count using the largest unit that divides it exactly.
///
/// ```
/// use slotlink::config::format_size;
///
/// assert_eq!(format_size(2 * 1024 * 1024), "2MB");
/// assert_eq!(format_size(1000), "1000");
/// ```
pub fn format_size(bytes: usize) -> String {
    for (suffix, mult) in UNITS.iter().filter(|(s, _)| s.len() == 2) {
        if bytes >= *mult && bytes % mult == 0 {
            return format!("{}{}", bytes / mult, suffix);
        }
    }
    bytes.to_string()
}
