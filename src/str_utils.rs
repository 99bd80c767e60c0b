/// Prefix of at most `max_chars` characters, cut on a char boundary.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Leading part of an id, enough to tell turns and conversations apart in logs.
pub fn short_id(id: &str) -> &str {
    prefix_chars(id, 8)
}
