//! Unique, cloud-safe resource names.
//!
//! Every resource a test case creates is named through this module so that
//! parallel runs (and parallel cases within one run) never collide. Names use
//! only lowercase ASCII letters, digits and `-`, which every common cloud
//! naming rule accepts.
//!
//! # Example
//!
//! ```
//! use provcheck::names::{compact_unique_name, is_valid_resource_name, unique_name};
//!
//! let group = unique_name("storage-test");
//! assert!(group.starts_with("storage-test-"));
//! assert!(is_valid_resource_name(&group));
//!
//! // Storage accounts reject `-` and cap the length at 24.
//! let account = compact_unique_name("st", 24);
//! assert!(account.len() <= 24);
//! assert!(!account.contains('-'));
//! ```

use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

/// Separator placed between the prefix and the random suffix.
pub const SEPARATOR: char = '-';

/// Length of the random suffix.
///
/// 36^12 possible suffixes; collisions inside a single run are treated as an
/// environmental anomaly rather than something to recover from.
pub const SUFFIX_LEN: usize = 12;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates `prefix-<random suffix>`.
///
/// The prefix is normalized first: uppercase letters are lowercased, `_`
/// and whitespace become `-`, and anything else outside `[a-z0-9-]` is
/// dropped.
pub fn unique_name(prefix: &str) -> String {
    let prefix = sanitize(prefix);
    let suffix = random_suffix(SUFFIX_LEN);
    if prefix.is_empty() {
        suffix
    } else {
        format!("{}{}{}", prefix, SEPARATOR, suffix)
    }
}

/// Generates a unique name without separators, truncated to `max_len`.
///
/// Some resources (storage accounts for instance) only accept lowercase
/// alphanumerics and have a short length limit. The prefix is shortened
/// before the suffix so the random part always survives truncation.
pub fn compact_unique_name(prefix: &str, max_len: usize) -> String {
    let prefix: String = sanitize(prefix).chars().filter(|c| *c != SEPARATOR).collect();
    let suffix_len = SUFFIX_LEN.min(max_len);
    let prefix_len = max_len.saturating_sub(suffix_len).min(prefix.len());

    let mut name = String::with_capacity(max_len);
    name.push_str(&prefix[..prefix_len]);
    name.push_str(&random_suffix(suffix_len));
    name
}

/// Returns `true` if `name` satisfies the common resource naming rule.
///
/// The rule: 1 to 63 characters of `[a-z0-9-]`, starting and ending with an
/// alphanumeric.
pub fn is_valid_resource_name(name: &str) -> bool {
    static RULE: OnceLock<Regex> = OnceLock::new();
    let rule = RULE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex is valid")
    });
    rule.is_match(name)
}

/// Turns free-form text (such as a test case name) into a name fragment.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if (c == SEPARATOR || c == '_' || c.is_whitespace())
            && !out.is_empty()
            && !out.ends_with(SEPARATOR)
        {
            out.push(SEPARATOR);
        }
    }
    while out.ends_with(SEPARATOR) {
        out.pop();
    }
    out
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
