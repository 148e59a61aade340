//! Build version derivation.
//!
//! A Build template carries a start-version pattern like "v0.0.1" or
//! "2024-build-1". Each new build gets the next version after the most
//! recent one, never going below the pattern's own number.

use std::sync::OnceLock;

use regex::Regex;

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*[^\d])?(\d+)([^\d].*)?$").expect("version pattern is valid"))
}

/// Compute the next build version from the template's start-version pattern
/// and the most recent build's version.
///
/// The pattern decomposes into (prefix, integer body, suffix). When the
/// pattern has no integer body, or `current_version` does not share the
/// prefix and suffix, the pattern itself is returned unchanged.
pub fn next_build_version(start_version: &str, current_version: &str) -> String {
    let Some(caps) = pattern().captures(start_version) else {
        return start_version.to_string();
    };

    let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    if !current_version.starts_with(prefix)
        || !current_version.ends_with(suffix)
        || current_version.len() < prefix.len() + suffix.len()
    {
        return start_version.to_string();
    }

    let middle = &current_version[prefix.len()..current_version.len() - suffix.len()];
    let Ok(current) = middle.parse::<u64>() else {
        return start_version.to_string();
    };
    let Ok(start) = body.parse::<u64>() else {
        return start_version.to_string();
    };

    let next = start.max(current + 1);
    format!("{}{}{}", prefix, next, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increments_current() {
        assert_eq!(next_build_version("v0.0.1", "v0.0.5"), "v0.0.6");
    }

    #[test]
    fn test_start_wins_over_older_current() {
        assert_eq!(next_build_version("v1.0.0", "v0.9.9"), "v1.0.0");
    }

    #[test]
    fn test_multi_digit_rollover() {
        assert_eq!(next_build_version("2024-build-1", "2024-build-9"), "2024-build-10");
    }

    #[test]
    fn test_pattern_without_digits_is_returned_unchanged() {
        assert_eq!(next_build_version("release", "release"), "release");
        assert_eq!(next_build_version("release", "v5"), "release");
    }

    #[test]
    fn test_prefix_mismatch_returns_pattern() {
        assert_eq!(next_build_version("v0.0.1", "build-7"), "v0.0.1");
    }

    #[test]
    fn test_suffix_preserved() {
        assert_eq!(next_build_version("1-rc", "3-rc"), "4-rc");
    }

    #[test]
    fn test_bare_number() {
        assert_eq!(next_build_version("1", "41"), "42");
    }

    #[test]
    fn test_non_numeric_middle_returns_pattern() {
        assert_eq!(next_build_version("v0.0.1", "v0.0.x"), "v0.0.1");
    }

    #[test]
    fn test_monotonic_over_repeated_derivation() {
        let mut version = "v0.0.1".to_string();
        for _ in 0..10 {
            let next = next_build_version("v0.0.1", &version);
            assert_ne!(next, version);
            version = next;
        }
        assert_eq!(version, "v0.0.11");
    }
}
