//! Utility functions for Quince
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;

use if_addrs::IfAddr;

/// Region names: alphanumeric, underscore, hyphen
static REGION_NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_-]+$").expect("Invalid regex pattern"));

/// Validate a region name.
///
/// Names beginning with a double underscore are reserved for internal regions.
///
/// # Examples
///
/// ```
/// use quince_common::is_valid_region_name;
///
/// assert!(is_valid_region_name("orders-2024"));
/// assert!(!is_valid_region_name("a/b"));
/// assert!(!is_valid_region_name("__internal"));
/// ```
pub fn is_valid_region_name(name: &str) -> bool {
    !name.starts_with("__") && REGION_NAME_PATTERN.is_match(name)
}

/// Replace every occurrence of `token` in `text` with `value`.
///
/// Matching is literal and proceeds left to right without overlap. An empty
/// token leaves the text unchanged.
///
/// # Examples
///
/// ```
/// use quince_common::replace_strings;
///
/// assert_eq!(replace_strings("a${x}b${x}", "${x}", "1"), "a1b1");
/// assert_eq!(replace_strings("aaa", "aa", "b"), "ba");
/// ```
pub fn replace_strings(text: &str, token: &str, value: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut start = 0;
    for (index, _) in text.match_indices(token) {
        result.push_str(&text[start..index]);
        result.push_str(value);
        start = index + token.len();
    }
    result.push_str(&text[start..]);
    result
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_strings_basic() {
        assert_eq!(
            replace_strings("locators=${HOST}[1],${HOST}[2]", "${HOST}", "node1"),
            "locators=node1[1],node1[2]"
        );
        assert_eq!(replace_strings("no match", "zz", "y"), "no match");
        assert_eq!(replace_strings("", "a", "b"), "");
    }

    #[test]
    fn test_replace_strings_non_overlapping() {
        assert_eq!(replace_strings("aaaa", "aa", "x"), "xx");
        assert_eq!(replace_strings("aaa", "aa", "x"), "xa");
    }

    #[test]
    fn test_replace_strings_no_regex_semantics() {
        assert_eq!(replace_strings("a.b.c", ".", "\\"), "a\\b\\c");
        assert_eq!(replace_strings("x*y", ".*", "z"), "x*y");
    }

    #[test]
    fn test_replace_strings_value_contains_token() {
        assert_eq!(replace_strings("ab", "a", "aa"), "aab");
    }

    #[test]
    fn test_replace_strings_empty_token() {
        assert_eq!(replace_strings("abc", "", "x"), "abc");
    }

    #[test]
    fn test_region_names() {
        assert!(is_valid_region_name("testRemoteFetch"));
        assert!(is_valid_region_name("a_b-c"));
        assert!(!is_valid_region_name(""));
        assert!(!is_valid_region_name("with space"));
        assert!(!is_valid_region_name("__PR"));
    }

    #[test]
    fn test_local_ip_returns_valid_ip() {
        let ip = local_ip();
        assert!(
            ip == "127.0.0.1" || ip.split('.').filter_map(|s| s.parse::<u8>().ok()).count() == 4
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_matches_std_replace(text in "[ab]{0,16}", token in "[ab]{1,3}", value in "[xy]{0,3}") {
            proptest::prop_assert_eq!(replace_strings(&text, &token, &value), text.replace(&token, &value));
        }
    }
}
