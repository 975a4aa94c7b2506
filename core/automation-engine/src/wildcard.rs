//! Topic path wildcard matching
//!
//! Patterns are slash-delimited. `+` matches exactly one segment, `#` (final
//! segment only) matches one or more trailing segments.

/// Single-level wildcard segment
pub const WILDCARD_SINGLE: &str = "+";

/// Multi-level wildcard segment (final position only)
pub const WILDCARD_MULTI: &str = "#";

/// Topic segment separator
pub const SEPARATOR: char = '/';

/// Does `pattern` match the concrete topic path `topic`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if !is_wildcard(pattern) {
        return false;
    }

    let mut pattern_segments = pattern.split(SEPARATOR).peekable();
    let mut topic_segments = topic.split(SEPARATOR);

    while let Some(segment) = pattern_segments.next() {
        if segment == WILDCARD_MULTI && pattern_segments.peek().is_none() {
            // at least one trailing segment must remain
            return topic_segments.next().is_some();
        }
        match topic_segments.next() {
            Some(level) if segment == WILDCARD_SINGLE || segment == level => {}
            _ => return false,
        }
    }

    topic_segments.next().is_none()
}

/// Whether a pattern contains any wildcard segment
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|segment| segment == WILDCARD_SINGLE || segment == WILDCARD_MULTI)
}

/// Check an input pattern is well formed
///
/// Wildcards must occupy a whole segment and `#` may only appear last.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("input pattern must not be empty".to_string());
    }

    let segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    for (index, segment) in segments.iter().enumerate() {
        let is_last = index + 1 == segments.len();
        if *segment == WILDCARD_MULTI && !is_last {
            return Err(format!("'#' must be the final segment in pattern {}", pattern));
        }
        if segment.len() > 1 && (segment.contains('+') || segment.contains('#')) {
            return Err(format!("wildcard must occupy a whole segment in pattern {}", pattern));
        }
    }

    Ok(())
}

/// Check a concrete topic name carries no wildcard characters
pub fn validate_topic_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("topic name is required".to_string());
    }
    if name.contains('+') || name.contains('#') {
        return Err(format!("topic name {} must not contain wildcards", name));
    }
    Ok(())
}
