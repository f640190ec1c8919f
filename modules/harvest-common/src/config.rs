use std::env;

use tracing::info;

use crate::error::ConfigError;

/// Hashtags the collector rotates through when no `TARGET_HASHTAGS` is set.
pub const DEFAULT_TARGET_HASHTAGS: &[&str] = &[
    "#bitcoin",
    "#bitcoincharts",
    "#bitcoiner",
    "#bitcoinexchange",
    "#bitcoinmining",
    "#bitcoinnews",
    "#bitcoinprice",
    "#bitcointechnology",
    "#bitcointrading",
    "#bittensor",
    "#btc",
    "#cryptocurrency",
    "#crypto",
    "#defi",
    "#decentralizedfinance",
    "#tao",
    "#ai",
    "#artificialintelligence",
    "#blockchain",
    "#web3",
    "#ethereum",
    "#solana",
    "#cardano",
    "#polkadot",
];

/// A source account as configured: `id:token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCredential {
    pub id: String,
    pub token: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    /// Postgres primary. When unset the in-memory store is used.
    pub database_url: Option<String>,
    /// SQLite file shared with the downstream miner (secondary mirror).
    pub miner_sqlite_path: Option<String>,
    pub retention_days: i64,

    // Web server
    pub api_host: String,
    pub api_port: u16,
    pub api_token: String,
    pub freshness_window_secs: i64,
    pub fallback_timeout_secs: u64,

    // Collection
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    pub tweets_per_hour: u64,
    pub max_concurrent: usize,
    pub fetch_timeout_secs: u64,
    pub target_hashtags: Vec<String>,

    // Resources
    pub upstream_url: String,
    pub proxies: Vec<String>,
    pub accounts: Vec<AccountCredential>,
    pub preferred_proxy_prefixes: Vec<String>,
    /// Reserved for the API's validation fallback, disjoint from the
    /// collector's `proxies` and `accounts`.
    pub fallback_proxies: Vec<String>,
    pub fallback_accounts: Vec<AccountCredential>,
}

impl Config {
    /// Load the collector's configuration (`scout` binary).
    pub fn scout_from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        if config.proxies.is_empty() {
            return Err(ConfigError::Missing("PROXIES"));
        }
        if config.accounts.is_empty() {
            return Err(ConfigError::Missing("ACCOUNTS"));
        }
        Ok(config)
    }

    /// Load the API server's configuration. The token is required; the
    /// fallback proxies and accounts are optional (without them validation has
    /// no live fallback).
    pub fn api_from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        if config.api_token.is_empty() {
            return Err(ConfigError::Missing("API_TOKEN"));
        }
        Ok(config)
    }

    /// Build a config from an arbitrary key lookup. Missing keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let target_hashtags = match get("TARGET_HASHTAGS") {
            Some(raw) => split_list(&raw).into_iter().map(|t| crate::normalize_label(&t)).collect(),
            None => DEFAULT_TARGET_HASHTAGS.iter().map(|s| s.to_string()).collect(),
        };

        let accounts = match get("ACCOUNTS") {
            Some(raw) => parse_accounts("ACCOUNTS", &raw)?,
            None => Vec::new(),
        };
        let fallback_accounts = match get("FALLBACK_ACCOUNTS") {
            Some(raw) => parse_accounts("FALLBACK_ACCOUNTS", &raw)?,
            None => Vec::new(),
        };
        let proxies = get("PROXIES").map(|raw| split_list(&raw)).unwrap_or_default();
        let fallback_proxies = get("FALLBACK_PROXIES").map(|raw| split_list(&raw)).unwrap_or_default();

        // The collector and the API run as separate processes with separate
        // pools; a shared account or proxy would have two cooldown clocks.
        if let Some(shared) = fallback_accounts.iter().find(|f| accounts.iter().any(|a| a.id == f.id)) {
            return Err(ConfigError::Invalid {
                key: "FALLBACK_ACCOUNTS",
                value: shared.id.clone(),
                reason: "also listed in ACCOUNTS".to_string(),
            });
        }
        if let Some(shared) = fallback_proxies.iter().find(|f| proxies.contains(f)) {
            return Err(ConfigError::Invalid {
                key: "FALLBACK_PROXIES",
                value: redact_url(shared),
                reason: "also listed in PROXIES".to_string(),
            });
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            miner_sqlite_path: get("MINER_SQLITE_PATH"),
            retention_days: parse_or(get("RETENTION_DAYS"), "RETENTION_DAYS", 30)?,
            api_host: get("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse_or(get("API_PORT"), "API_PORT", 8000)?,
            api_token: get("API_TOKEN").unwrap_or_default(),
            freshness_window_secs: parse_or(get("FRESHNESS_WINDOW_SECS"), "FRESHNESS_WINDOW_SECS", 86_400)?,
            fallback_timeout_secs: parse_or(get("FALLBACK_TIMEOUT_SECS"), "FALLBACK_TIMEOUT_SECS", 30)?,
            batch_size: parse_or(get("SCRAPER_BATCH_SIZE"), "SCRAPER_BATCH_SIZE", 150)?,
            batch_interval_secs: parse_or(get("SCRAPER_BATCH_INTERVAL"), "SCRAPER_BATCH_INTERVAL", 300)?,
            tweets_per_hour: parse_or(get("SCRAPER_TWEETS_PER_HOUR"), "SCRAPER_TWEETS_PER_HOUR", 1800)?,
            max_concurrent: parse_or(get("SCRAPER_MAX_CONCURRENT"), "SCRAPER_MAX_CONCURRENT", 5)?,
            fetch_timeout_secs: parse_or(get("FETCH_TIMEOUT_SECS"), "FETCH_TIMEOUT_SECS", 45)?,
            target_hashtags,
            upstream_url: get("UPSTREAM_URL").unwrap_or_else(|| "https://api.apify.com/v2".to_string()),
            proxies,
            accounts,
            preferred_proxy_prefixes: get("PREFERRED_PROXY_PREFIXES")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            fallback_proxies,
            fallback_accounts,
        })
    }

    /// Log the loaded configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            database = self.database_url.as_deref().map(redact_url).unwrap_or_else(|| "memory".to_string()),
            miner_sqlite = self.miner_sqlite_path.as_deref().unwrap_or("(none)"),
            retention_days = self.retention_days,
            batch_size = self.batch_size,
            batch_interval_secs = self.batch_interval_secs,
            tweets_per_hour = self.tweets_per_hour,
            max_concurrent = self.max_concurrent,
            hashtags = self.target_hashtags.len(),
            proxies = self.proxies.len(),
            accounts = self.accounts.len(),
            fallback_proxies = self.fallback_proxies.len(),
            fallback_accounts = self.fallback_accounts.len(),
            api_token_set = !self.api_token.is_empty(),
            "Configuration loaded"
        );
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_accounts(key: &'static str, raw: &str) -> Result<Vec<AccountCredential>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((id, token)) if !id.is_empty() && !token.is_empty() => Ok(AccountCredential {
                id: id.to_string(),
                token: token.to_string(),
            }),
            _ => Err(ConfigError::Invalid {
                key,
                value: entry.split(':').next().unwrap_or_default().to_string(),
                reason: "expected id:token".to_string(),
            }),
        })
        .collect()
}

fn parse_or<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "(unparseable)".to_string(),
    }
}
