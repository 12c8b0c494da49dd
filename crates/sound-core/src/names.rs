//! Object name sanitizing.

/// Longest name accepted for a sink, source or card.
pub const NAME_MAX: usize = 128;

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Whether `name` can be registered as-is.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX && name.chars().all(is_valid_char)
}

/// Turn arbitrary text into a registrable name.
///
/// Invalid characters become `_`. Returns `None` for empty input.
pub fn make_valid_name(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let name: String = raw
        .chars()
        .map(|c| if is_valid_char(c) { c } else { '_' })
        .take(NAME_MAX)
        .collect();
    Some(name)
}
