// Keeps only complete records that touch a target hashtag.

use harvest_common::{normalize_label, Record};

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    labels: Vec<String>,
    keywords: Vec<String>,
}

impl RecordFilter {
    /// An empty target list keeps every complete record.
    pub fn new(targets: &[String]) -> Self {
        let labels: Vec<String> = targets.iter().map(|t| normalize_label(t)).collect();
        let keywords = labels
            .iter()
            .map(|l| l.trim_start_matches(['#', '$']).to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self { labels, keywords }
    }

    pub fn is_complete(record: &Record) -> bool {
        !record.id.trim().is_empty() && !record.url.trim().is_empty() && !record.text.trim().is_empty()
    }

    pub fn keep(&self, record: &Record) -> bool {
        if !Self::is_complete(record) {
            return false;
        }
        if self.labels.is_empty() {
            return true;
        }
        if record.labels.iter().any(|l| self.labels.contains(l)) {
            return true;
        }
        let text = record.text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}
