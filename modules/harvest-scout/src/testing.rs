// Test doubles for the fetch seam.
//
// MockFetcher: scripted SourceFetcher (fixed records, generated records,
// failures, delays) that counts its calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use harvest_common::{extract_labels, identifier_from, DataSource, Engagement, Record};

use crate::fetch::{FetchError, FetchSpec, SourceFetcher};
use crate::pool::{EgressIdentity, SourceAccount};

/// A complete record authored by `trader`, labelled from its text.
pub fn record(id: &str, text: &str) -> Record {
    Record {
        id: id.to_string(),
        url: format!("https://x.com/trader/status/{id}"),
        author: "trader".into(),
        author_display_name: Some("Trader".into()),
        created_at: Utc::now(),
        text: text.to_string(),
        labels: extract_labels(text),
        source: DataSource::X,
        engagement: Engagement::default(),
        media_urls: vec![],
        is_retweet: false,
        is_reply: false,
        conversation_id: None,
    }
}

pub fn sample_records(prefix: &str, n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| record(&format!("{prefix}{i}"), &format!("post {i} about #bitcoin")))
        .collect()
}

enum Script {
    Fixed(Vec<Record>),
    /// Fresh, distinct records on every call.
    Generate(usize),
    Fail(FetchError),
}

pub struct MockFetcher {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
    accounts_seen: Mutex<Vec<String>>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            script: Script::Fixed(Vec::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            accounts_seen: Mutex::new(Vec::new()),
        }
    }

    /// Return these records on every call. Lookups only get the requested ones.
    pub fn returning(mut self, records: Vec<Record>) -> Self {
        self.script = Script::Fixed(records);
        self
    }

    pub fn generating(mut self, per_call: usize) -> Self {
        self.script = Script::Generate(per_call);
        self
    }

    pub fn failing(mut self, err: FetchError) -> Self {
        self.script = Script::Fail(err);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn accounts_seen(&self) -> Vec<String> {
        self.accounts_seen.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        account: &SourceAccount,
        _identity: &EgressIdentity,
        spec: &FetchSpec,
    ) -> Result<Vec<Record>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.accounts_seen.lock() {
            seen.push(account.id.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let records = match &self.script {
            Script::Fail(err) => return Err(err.clone()),
            Script::Fixed(records) => records.clone(),
            Script::Generate(n) => sample_records(&format!("gen{call}-"), *n),
        };

        match spec {
            FetchSpec::Search { .. } => Ok(records),
            FetchSpec::Lookup { urls } => {
                let wanted: HashSet<String> = urls.iter().filter_map(|u| identifier_from(u)).collect();
                Ok(records.into_iter().filter(|r| wanted.contains(&r.id)).collect())
            }
        }
    }
}
