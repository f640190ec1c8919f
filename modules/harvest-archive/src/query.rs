// Search expressions: `#tag`, `$tag`, keywords, quoted phrases, `OR`.
//
// `#bitcoin btc OR $eth` = (label #bitcoin AND keyword "btc") OR (label $eth).

use harvest_common::{normalize_label, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Matches a stored classification label exactly.
    Label(String),
    /// Case-insensitive substring of the post text.
    Keyword(String),
}

impl Term {
    fn matches(&self, record: &Record, lowered_text: &str) -> bool {
        match self {
            Term::Label(label) => record.has_label(label),
            Term::Keyword(keyword) => lowered_text.contains(keyword.as_str()),
        }
    }
}

/// A disjunction of conjunctions. No alternatives means "match everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryExpr {
    pub alternatives: Vec<Vec<Term>>,
}

impl QueryExpr {
    pub fn parse(raw: &str) -> Self {
        let mut alternatives = Vec::new();
        let mut current: Vec<Term> = Vec::new();

        for token in tokenize(raw) {
            if token == "OR" {
                if !current.is_empty() {
                    alternatives.push(std::mem::take(&mut current));
                }
                continue;
            }
            if let Some(term) = to_term(&token) {
                current.push(term);
            }
        }
        if !current.is_empty() {
            alternatives.push(current);
        }

        Self { alternatives }
    }

    pub fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        if self.is_empty() {
            return true;
        }
        let lowered = record.text.to_lowercase();
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|term| term.matches(record, &lowered)))
    }
}

fn to_term(token: &str) -> Option<Term> {
    let token = token.trim_matches(|c| c == '(' || c == ')');
    if token.is_empty() {
        return None;
    }
    let is_tag = (token.starts_with('#') || token.starts_with('$')) && token.len() > 1;
    if is_tag {
        Some(Term::Label(normalize_label(token)))
    } else {
        Some(Term::Keyword(token.to_lowercase()))
    }
}

/// Whitespace tokenizer that keeps `"quoted phrases"` together.
fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut quoted = false;

    for c in raw.chars() {
        match c {
            '"' => {
                if quoted && !buf.is_empty() {
                    tokens.push(std::mem::take(&mut buf));
                }
                quoted = !quoted;
            }
            c if c.is_whitespace() && !quoted => {
                if !buf.is_empty() {
                    tokens.push(std::mem::take(&mut buf));
                }
            }
            c => buf.push(c),
        }
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }
    tokens
}

/// `LIKE` pattern for a substring match, escaping `%`, `_` and `\`.
pub(crate) fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use harvest_common::{DataSource, Engagement};

    fn record(text: &str, labels: &[&str]) -> Record {
        Record {
            id: "1".into(),
            url: "https://x.com/a/status/1".into(),
            author: "a".into(),
            author_display_name: None,
            created_at: Utc::now(),
            text: text.into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            source: DataSource::X,
            engagement: Engagement::default(),
            media_urls: vec![],
            is_retweet: false,
            is_reply: false,
            conversation_id: None,
        }
    }

    #[test]
    fn parses_alternatives_and_conjunctions() {
        let expr = QueryExpr::parse("#Bitcoin btc OR $ETH");
        assert_eq!(
            expr.alternatives,
            vec![
                vec![Term::Label("#bitcoin".into()), Term::Keyword("btc".into())],
                vec![Term::Label("$eth".into())],
            ]
        );
    }

    #[test]
    fn quoted_phrase_is_one_keyword() {
        let expr = QueryExpr::parse("\"Proof of Stake\" OR");
        assert_eq!(expr.alternatives, vec![vec![Term::Keyword("proof of stake".into())]]);
    }

    #[test]
    fn empty_expression_matches_everything() {
        let expr = QueryExpr::parse("   ");
        assert!(expr.is_empty());
        assert!(expr.matches(&record("anything", &[])));
    }

    #[test]
    fn matches_labels_and_keywords() {
        let r = record("Mining BTC at scale", &["#bitcoin"]);
        assert!(QueryExpr::parse("#bitcoin").matches(&r));
        assert!(QueryExpr::parse("#bitcoin btc").matches(&r));
        assert!(!QueryExpr::parse("#bitcoin eth").matches(&r));
        assert!(QueryExpr::parse("#eth OR mining").matches(&r));
        assert!(!QueryExpr::parse("#btc").matches(&r));
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("100%_x\\"), "%100\\%\\_x\\\\%");
    }
}
