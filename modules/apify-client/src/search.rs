// Search-term convention of the tweet scraper:
// `since:2024-01-01_00:00:00_UTC until:2024-01-01_23:59:59_UTC #bitcoin`.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

static RE_SINCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bsince:(\S+)").unwrap());
static RE_UNTIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\buntil:(\S+)").unwrap());

const BOUND_FORMAT: &str = "%Y-%m-%d_%H:%M:%S_UTC";

/// A parsed search term: the free-text expression plus optional bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    pub query: String,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SearchTerm {
    pub fn new(query: impl Into<String>, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self {
            query: query.into(),
            since,
            until,
        }
    }

    /// Split a raw term into bounds and expression. Unparseable bounds are
    /// dropped (and logged) rather than failing the whole term.
    pub fn parse(raw: &str) -> Self {
        let since = RE_SINCE.captures(raw).and_then(|c| parse_bound(&c[1]));
        let until = RE_UNTIL.captures(raw).and_then(|c| parse_bound(&c[1]));

        let stripped = RE_SINCE.replace_all(raw, "");
        let stripped = RE_UNTIL.replace_all(&stripped, "");
        let query = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

        Self { query, since, until }
    }

    /// Render back into the scraper's convention.
    pub fn format(&self) -> String {
        let mut parts = Vec::new();
        if let Some(since) = self.since {
            parts.push(format!("since:{}", since.format(BOUND_FORMAT)));
        }
        if let Some(until) = self.until {
            parts.push(format!("until:{}", until.format(BOUND_FORMAT)));
        }
        if !self.query.is_empty() {
            parts.push(self.query.clone());
        }
        parts.join(" ")
    }
}

fn parse_bound(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, BOUND_FORMAT) {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    tracing::warn!(bound = raw, "Unparseable search-term bound, ignoring");
    None
}
