// Text helpers shared by ingestion and serving: label extraction, tweet URL
// normalization, identifier parsing.

use std::sync::LazyLock;

use regex::Regex;

static RE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w&/])([#$][\p{L}\p{N}_]*[\p{L}_][\p{L}\p{N}_]*)").unwrap()
});

static RE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([A-Za-z0-9_]{1,15})/status(?:es)?/(\d+)").unwrap()
});

const TWEET_HOSTS: &[&str] = &[
    "twitter.com",
    "www.twitter.com",
    "mobile.twitter.com",
    "x.com",
    "www.x.com",
    "mobile.x.com",
];

/// Labels are compared lowercase, keeping their `#`/`$` sigil. A bare word is
/// treated as a hashtag.
pub fn normalize_label(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with('#') || lower.starts_with('$') {
        lower
    } else {
        format!("#{lower}")
    }
}

/// Extract hashtags and cashtags from post text, normalized and deduplicated in
/// order of first appearance.
pub fn extract_labels(text: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for cap in RE_LABEL.captures_iter(text) {
        let label = normalize_label(&cap[1]);
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

/// Collapse whitespace runs and strip zero-width characters from scraped text.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a tweet URL into `(username, status_id)`. Accepts twitter.com and x.com
/// hosts (including www/mobile), with or without scheme.
fn parse_tweet_url(raw: &str) -> Option<(String, String)> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !TWEET_HOSTS.contains(&host.as_str()) {
        return None;
    }
    let caps = RE_STATUS.captures(parsed.path())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn is_valid_tweet_url(raw: &str) -> bool {
    parse_tweet_url(raw).is_some()
}

/// Canonical form: `https://x.com/{user}/status/{id}`, no query or fragment.
pub fn normalize_tweet_url(raw: &str) -> Option<String> {
    parse_tweet_url(raw).map(|(user, id)| format!("https://x.com/{user}/status/{id}"))
}

pub fn tweet_id_from_url(raw: &str) -> Option<String> {
    parse_tweet_url(raw).map(|(_, id)| id)
}

/// Resolve a validation identifier: a tweet URL yields its status id, anything
/// else is taken as an id verbatim. Empty input yields `None`.
pub fn identifier_from(raw: &str) -> Option<String> {
    if let Some(id) = tweet_id_from_url(raw) {
        return Some(id);
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains(char::is_whitespace) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hashtags_and_cashtags() {
        let labels = extract_labels("Watching #Bitcoin and $BTC today, #bitcoin again #AI_2024");
        assert_eq!(labels, vec!["#bitcoin", "$btc", "#ai_2024"]);
    }

    #[test]
    fn ignores_numeric_only_tags_and_url_fragments() {
        let labels = extract_labels("price $100 see https://example.com/#section &#39;");
        assert!(labels.is_empty(), "got {labels:?}");
    }

    #[test]
    fn bare_label_becomes_hashtag() {
        assert_eq!(normalize_label("Crypto"), "#crypto");
        assert_eq!(normalize_label(" $ETH "), "$eth");
    }

    #[test]
    fn normalizes_twitter_and_x_urls() {
        assert_eq!(
            normalize_tweet_url("https://twitter.com/Alice/status/123?s=20").as_deref(),
            Some("https://x.com/Alice/status/123")
        );
        assert_eq!(
            normalize_tweet_url("mobile.x.com/bob/statuses/456").as_deref(),
            Some("https://x.com/bob/status/456")
        );
        assert!(!is_valid_tweet_url("https://example.com/alice/status/1"));
        assert!(!is_valid_tweet_url("https://x.com/alice"));
    }

    #[test]
    fn identifier_accepts_urls_and_bare_ids() {
        assert_eq!(identifier_from("https://x.com/a/status/99").as_deref(), Some("99"));
        assert_eq!(identifier_from(" id-123 ").as_deref(), Some("id-123"));
        assert_eq!(identifier_from("https://example.com/post/1"), None);
        assert_eq!(identifier_from("   "), None);
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_text("  gm\u{200b}  \n\n world "), "gm world");
    }
}
