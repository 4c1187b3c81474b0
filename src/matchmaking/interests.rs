//! Interest tag normalization

use std::collections::BTreeSet;

use crate::config::MatchmakingConfig;

/// Normalized interest set. Ordered so shared-interest lists are stable.
pub type Interests = BTreeSet<String>;

/// Trim, lowercase, drop empties, clip to `max_len` characters and keep the
/// first `max_count` distinct tags in the order given.
pub fn normalize_interests<S: AsRef<str>>(raw: &[S], max_count: usize, max_len: usize) -> Interests {
    let mut out = Interests::new();
    for tag in raw {
        if out.len() >= max_count {
            break;
        }
        let tag: String = tag
            .as_ref()
            .trim()
            .to_lowercase()
            .chars()
            .take(max_len)
            .collect();
        let tag = tag.trim_end().to_string();
        if !tag.is_empty() {
            out.insert(tag);
        }
    }
    out
}

pub fn normalize_with(config: &MatchmakingConfig, raw: &[String]) -> Interests {
    normalize_interests(raw, config.max_interests, config.max_interest_len)
}

/// Intersection in sorted order
pub fn shared_interests(a: &Interests, b: &Interests) -> Vec<String> {
    a.intersection(b).cloned().collect()
}
