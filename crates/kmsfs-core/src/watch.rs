use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Notification that something matching a watch filter changed.
pub trait ChangeToken: Send + Sync {
    /// True once a change has been observed. Tokens never reset.
    fn has_changed(&self) -> bool;
}

/// Token for stores that cannot observe changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverChanges;

impl ChangeToken for NeverChanges {
    fn has_changed(&self) -> bool {
        false
    }
}

/// Shared flag a store fires when a write matches the filter it was created for.
#[derive(Debug, Default, Clone)]
pub struct ChangeSignal {
    fired: Arc<AtomicBool>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }

    /// Whether any clone besides this one is still alive.
    pub fn is_observed(&self) -> bool {
        Arc::strong_count(&self.fired) > 1
    }
}

impl ChangeToken for ChangeSignal {
    fn has_changed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Glob match of a store path against a watch filter.
///
/// `*` matches any run of characters within one segment, `?` matches a single
/// character and a `**` segment matches any number of segments (including none).
pub fn filter_matches(filter: &str, path: &str) -> bool {
    let pattern = split_segments(filter);
    let path = split_segments(path);
    match_segments(&pattern, &path)
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, tail)) => {
                let head: Vec<char> = head.chars().collect();
                let segment: Vec<char> = segment.chars().collect();
                match_segment(&head, &segment) && match_segments(rest, tail)
            }
            None => false,
        },
    }
}

fn match_segment(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((&'*', rest)) => (0..=text.len()).any(|skip| match_segment(rest, &text[skip..])),
        Some((&'?', rest)) => !text.is_empty() && match_segment(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && match_segment(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filters_match_exact_paths() {
        assert!(filter_matches("config/app.json", "config/app.json"));
        assert!(filter_matches("/config/app.json", "config/app.json/"));
        assert!(!filter_matches("config/app.json", "config/other.json"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        assert!(filter_matches("*.encrypted", "db.json.encrypted"));
        assert!(filter_matches("secrets/*.keyname", "secrets/db.keyname"));
        assert!(!filter_matches("*.encrypted", "nested/db.encrypted"));
        assert!(filter_matches("db.????", "db.json"));
    }

    #[test]
    fn double_star_spans_segments() {
        assert!(filter_matches("**", "a/b/c"));
        assert!(filter_matches("**/*.encrypted", "top.encrypted"));
        assert!(filter_matches("**/*.encrypted", "a/b/top.encrypted"));
        assert!(!filter_matches("a/**/x", "b/c/x"));
    }

    #[test]
    fn signal_fires_once_and_stays_fired() {
        let signal = ChangeSignal::new();
        let token: Box<dyn ChangeToken> = Box::new(signal.clone());
        assert!(!token.has_changed());
        signal.fire();
        assert!(token.has_changed());
        assert!(!NeverChanges.has_changed());
        assert!(signal.is_observed());
        drop(token);
        assert!(!signal.is_observed());
    }
}
