// Egress identities (proxies) and source accounts, leased out in pairs.
//
// All state lives behind one mutex that is never held across an await, so a
// pair is taken atomically and no resource is ever leased twice.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use harvest_common::{AccountCredential, Config};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No healthy identity/account pair available")]
    Unavailable,

    #[error("Unknown pool resource: {0}")]
    UnknownResource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Cooling,
    Banned,
}

/// A network egress path. `proxy_url` of `None` means a direct connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressIdentity {
    pub id: String,
    pub proxy_url: Option<String>,
}

/// Credentials for the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAccount {
    pub id: String,
    pub token: String,
}

/// How a leased pair's fetch went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum rest for an account after each use.
    pub account_cooldown: Duration,
    /// Consecutive retryable failures before a resource is banned.
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// EMA smoothing factor for the success-rate estimate.
    pub alpha: f64,
    /// Score multiplier for identities on a preferred proxy prefix.
    pub preference_weight: f64,
    pub preferred_prefixes: Vec<String>,
    /// Bans lift on their own after this long. `None` keeps them until `reset`.
    pub ban_duration: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            account_cooldown: Duration::from_secs(5),
            failure_threshold: 3,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
            alpha: 0.2,
            preference_weight: 1.5,
            preferred_prefixes: Vec::new(),
            ban_duration: Some(Duration::from_secs(3600)),
        }
    }
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preferred_prefixes: config.preferred_proxy_prefixes.clone(),
            ..Default::default()
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    health: Health,
    held: bool,
    last_used: Option<Instant>,
    cooldown_until: Option<Instant>,
    banned_at: Option<Instant>,
    consecutive_failures: u32,
    success_rate: f64,
    requests: u64,
    successes: u64,
    weight: f64,
}

impl Slot {
    fn new(weight: f64) -> Self {
        Self {
            health: Health::Healthy,
            held: false,
            last_used: None,
            cooldown_until: None,
            banned_at: None,
            consecutive_failures: 0,
            success_rate: 1.0,
            requests: 0,
            successes: 0,
            weight,
        }
    }

    fn refresh(&mut self, now: Instant, ban_duration: Option<Duration>) {
        match self.health {
            Health::Cooling if self.cooldown_until.map_or(true, |t| t <= now) => {
                self.health = Health::Healthy;
                self.cooldown_until = None;
            }
            Health::Banned => {
                let lifted = match (ban_duration, self.banned_at) {
                    (Some(d), Some(at)) => at + d <= now,
                    _ => false,
                };
                if lifted {
                    self.reset();
                }
            }
            _ => {}
        }
    }

    fn available(&self) -> bool {
        self.health == Health::Healthy && !self.held
    }

    fn score(&self) -> f64 {
        self.success_rate * self.weight
    }

    fn reset(&mut self) {
        self.health = Health::Healthy;
        self.cooldown_until = None;
        self.banned_at = None;
        self.consecutive_failures = 0;
    }

    fn ban(&mut self, now: Instant) {
        self.health = Health::Banned;
        self.banned_at = Some(now);
        self.cooldown_until = None;
    }

    fn cool(&mut self, now: Instant, for_: Duration) {
        if for_.is_zero() {
            self.health = Health::Healthy;
            self.cooldown_until = None;
        } else {
            self.health = Health::Cooling;
            self.cooldown_until = Some(now + for_);
        }
    }

    fn record(&mut self, outcome: &ReleaseOutcome, now: Instant, config: &PoolConfig, rest: Duration) {
        self.held = false;
        self.last_used = Some(now);
        self.requests += 1;
        match outcome {
            ReleaseOutcome::Success => {
                self.successes += 1;
                self.success_rate += config.alpha * (1.0 - self.success_rate);
                self.consecutive_failures = 0;
                self.cool(now, rest);
            }
            ReleaseOutcome::Retryable(_) => {
                self.success_rate -= config.alpha * self.success_rate;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold {
                    self.ban(now);
                } else {
                    self.cool(now, config.backoff(self.consecutive_failures));
                }
            }
            ReleaseOutcome::Fatal(_) => {
                self.success_rate -= config.alpha * self.success_rate;
                self.consecutive_failures += 1;
                self.ban(now);
            }
        }
    }
}

/// Best available slot: highest score, then longest idle (never used first).
fn pick<'a>(slots: impl Iterator<Item = &'a Slot>) -> Option<usize> {
    slots
        .enumerate()
        .filter(|(_, s)| s.available())
        .max_by(|(_, a), (_, b)| {
            a.score()
                .total_cmp(&b.score())
                .then_with(|| match (a.last_used, b.last_used) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(x), Some(y)) => y.cmp(&x),
                })
        })
        .map(|(i, _)| i)
}

struct PoolState {
    identities: Vec<(EgressIdentity, Slot)>,
    accounts: Vec<(SourceAccount, Slot)>,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, identity: usize, account: usize, outcome: &ReleaseOutcome) {
        let now = Instant::now();
        let mut state = self.lock();
        let cooldown = self.config.account_cooldown;
        if let Some((ident, slot)) = state.identities.get_mut(identity) {
            slot.record(outcome, now, &self.config, Duration::ZERO);
            if slot.health == Health::Banned {
                warn!(identity = ident.id.as_str(), ?outcome, "Identity banned");
            }
        }
        if let Some((acct, slot)) = state.accounts.get_mut(account) {
            slot.record(outcome, now, &self.config, cooldown);
            if slot.health == Health::Banned {
                warn!(account = acct.id.as_str(), ?outcome, "Account banned");
            }
        }
    }
}

/// Counts per health state for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub cooling: usize,
    pub banned: usize,
    pub held: usize,
}

impl HealthCounts {
    fn tally<'a, T: 'a>(items: impl Iterator<Item = &'a (T, Slot)>) -> Self {
        let mut counts = Self::default();
        for (_, slot) in items {
            match slot.health {
                Health::Healthy => counts.healthy += 1,
                Health::Cooling => counts.cooling += 1,
                Health::Banned => counts.banned += 1,
            }
            if slot.held {
                counts.held += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub identities: HealthCounts,
    pub accounts: HealthCounts,
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl PoolSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

/// Shared pool of identities and accounts. Cloning shares the same state.
#[derive(Clone)]
pub struct ResourcePool {
    shared: Arc<Shared>,
}

impl ResourcePool {
    pub fn new(identities: Vec<EgressIdentity>, accounts: Vec<SourceAccount>, config: PoolConfig) -> Self {
        let identities = identities
            .into_iter()
            .map(|identity| {
                let preferred = identity.proxy_url.as_deref().is_some_and(|url| {
                    let host = proxy_host(url);
                    config.preferred_prefixes.iter().any(|p| host.starts_with(p.as_str()))
                });
                let weight = if preferred { config.preference_weight } else { 1.0 };
                (identity, Slot::new(weight))
            })
            .collect();
        let accounts = accounts.into_iter().map(|a| (a, Slot::new(1.0))).collect();

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState { identities, accounts }),
            }),
        }
    }

    /// Build the collector's pool from `PROXIES` and `ACCOUNTS`.
    pub fn from_config(config: &Config) -> Self {
        Self::from_lists("proxy", &config.proxies, &config.accounts, config)
    }

    /// Build the API's validation-fallback pool from `FALLBACK_PROXIES` and
    /// `FALLBACK_ACCOUNTS`, which never overlap the collector's.
    pub fn fallback_from_config(config: &Config) -> Self {
        Self::from_lists(
            "fallback-proxy",
            &config.fallback_proxies,
            &config.fallback_accounts,
            config,
        )
    }

    fn from_lists(prefix: &str, proxies: &[String], credentials: &[AccountCredential], config: &Config) -> Self {
        let identities = proxies
            .iter()
            .enumerate()
            .map(|(i, url)| EgressIdentity {
                id: format!("{prefix}-{i}"),
                proxy_url: Some(url.clone()),
            })
            .collect();
        let accounts = credentials
            .iter()
            .map(|AccountCredential { id, token }| SourceAccount {
                id: id.clone(),
                token: token.clone(),
            })
            .collect();
        let pool = Self::new(identities, accounts, PoolConfig::from_config(config));
        info!(
            identities = proxies.len(),
            accounts = credentials.len(),
            preferred_prefixes = config.preferred_proxy_prefixes.len(),
            kind = prefix,
            "Resource pool ready"
        );
        pool
    }

    /// Lease the best available identity and account together.
    pub fn acquire(&self) -> Result<Lease, PoolError> {
        let now = Instant::now();
        let ban_duration = self.shared.config.ban_duration;
        let mut state = self.shared.lock();

        let state = &mut *state;
        for (_, slot) in state.identities.iter_mut() {
            slot.refresh(now, ban_duration);
        }
        for (_, slot) in state.accounts.iter_mut() {
            slot.refresh(now, ban_duration);
        }

        let picked = (
            pick(state.identities.iter().map(|(_, s)| s)),
            pick(state.accounts.iter().map(|(_, s)| s)),
        );
        let (Some(i), Some(a)) = picked else {
            return Err(PoolError::Unavailable);
        };

        state.identities[i].1.held = true;
        state.accounts[a].1.held = true;
        let identity = state.identities[i].0.clone();
        let account = state.accounts[a].0.clone();
        debug!(identity = identity.id.as_str(), account = account.id.as_str(), "Leased pair");

        Ok(Lease {
            shared: Some(self.shared.clone()),
            identity_idx: i,
            account_idx: a,
            identity,
            account,
        })
    }

    /// Poll `acquire` until it succeeds or `timeout` elapses.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease, PoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire() {
                Ok(lease) => return Ok(lease),
                Err(PoolError::Unavailable) if Instant::now() < deadline => {
                    let wait = Duration::from_millis(50).min(deadline - Instant::now());
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a banned or cooling resource to service.
    pub fn reset(&self, id: &str) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if let Some((_, slot)) = state.identities.iter_mut().find(|(r, _)| r.id == id) {
            slot.reset();
            info!(identity = id, "Identity reset");
            return Ok(());
        }
        if let Some((_, slot)) = state.accounts.iter_mut().find(|(r, _)| r.id == id) {
            slot.reset();
            info!(account = id, "Account reset");
            return Ok(());
        }
        Err(PoolError::UnknownResource(id.to_string()))
    }

    pub fn health_of(&self, id: &str) -> Option<Health> {
        let state = self.shared.lock();
        state
            .identities
            .iter()
            .map(|(r, s)| (r.id.as_str(), s))
            .chain(state.accounts.iter().map(|(r, s)| (r.id.as_str(), s)))
            .find(|(rid, _)| *rid == id)
            .map(|(_, s)| s.health)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.lock();
        PoolSnapshot {
            identities: HealthCounts::tally(state.identities.iter()),
            accounts: HealthCounts::tally(state.accounts.iter()),
            total_requests: state.accounts.iter().map(|(_, s)| s.requests).sum(),
            successful_requests: state.accounts.iter().map(|(_, s)| s.successes).sum(),
        }
    }

    pub fn capacity(&self) -> usize {
        let state = self.shared.lock();
        state.identities.len().min(state.accounts.len())
    }
}

/// Exclusive use of one identity and one account. Released exactly once:
/// through [`Lease::release`], or as an abandoned retryable failure on drop.
pub struct Lease {
    shared: Option<Arc<Shared>>,
    identity_idx: usize,
    account_idx: usize,
    identity: EgressIdentity,
    account: SourceAccount,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("identity_idx", &self.identity_idx)
            .field("account_idx", &self.account_idx)
            .field("identity", &self.identity)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub fn identity(&self) -> &EgressIdentity {
        &self.identity
    }

    pub fn account(&self) -> &SourceAccount {
        &self.account
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.identity_idx, self.account_idx, &outcome);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            debug!(identity = self.identity.id.as_str(), "Lease dropped without release");
            shared.release(
                self.identity_idx,
                self.account_idx,
                &ReleaseOutcome::Retryable("abandoned".into()),
            );
        }
    }
}

/// Host part of a proxy URL, credentials stripped.
fn proxy_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, r)| r);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(identities: usize, accounts: usize, config: PoolConfig) -> ResourcePool {
        ResourcePool::new(
            (0..identities)
                .map(|i| EgressIdentity {
                    id: format!("ip-{i}"),
                    proxy_url: Some(format!("http://user:pw@10.0.0.{i}:8080")),
                })
                .collect(),
            (0..accounts)
                .map(|i| SourceAccount {
                    id: format!("acct-{i}"),
                    token: format!("tok-{i}"),
                })
                .collect(),
            config,
        )
    }

    fn no_cooldown() -> PoolConfig {
        PoolConfig {
            account_cooldown: Duration::ZERO,
            base_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn never_leases_more_pairs_than_resources() {
        let pool = pool(3, 3, no_cooldown());
        let leases: Vec<Lease> = (0..3).map(|_| pool.acquire().unwrap()).collect();

        let mut accounts: Vec<&str> = leases.iter().map(|l| l.account().id.as_str()).collect();
        accounts.sort();
        accounts.dedup();
        assert_eq!(accounts.len(), 3, "an account was leased twice");

        assert_eq!(pool.acquire().unwrap_err(), PoolError::Unavailable);
        drop(leases);
    }

    #[test]
    fn release_makes_pair_available_again() {
        let pool = pool(1, 1, no_cooldown());
        let lease = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        lease.release(ReleaseOutcome::Success);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn dropped_lease_counts_as_retryable_failure() {
        let pool = pool(1, 1, no_cooldown());
        drop(pool.acquire().unwrap());
        let snap = pool.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.successful_requests, 0);
        assert_eq!(snap.accounts.held, 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn fatal_failure_bans_identity_and_account() {
        let pool = pool(1, 1, no_cooldown());
        pool.acquire()
            .unwrap()
            .release(ReleaseOutcome::Fatal("revoked".into()));
        assert_eq!(pool.health_of("ip-0"), Some(Health::Banned));
        assert_eq!(pool.health_of("acct-0"), Some(Health::Banned));
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Unavailable);

        pool.reset("ip-0").unwrap();
        pool.reset("acct-0").unwrap();
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn repeated_retryable_failures_ban() {
        let pool = pool(1, 1, no_cooldown());
        for _ in 0..2 {
            pool.acquire()
                .unwrap()
                .release(ReleaseOutcome::Retryable("timeout".into()));
            assert_eq!(pool.health_of("acct-0"), Some(Health::Healthy));
        }
        pool.acquire()
            .unwrap()
            .release(ReleaseOutcome::Retryable("timeout".into()));
        assert_eq!(pool.health_of("acct-0"), Some(Health::Banned));
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn success_resets_failure_streak() {
        let pool = pool(1, 1, no_cooldown());
        for _ in 0..2 {
            pool.acquire()
                .unwrap()
                .release(ReleaseOutcome::Retryable("blocked".into()));
        }
        pool.acquire().unwrap().release(ReleaseOutcome::Success);
        pool.acquire()
            .unwrap()
            .release(ReleaseOutcome::Retryable("blocked".into()));
        assert_eq!(pool.health_of("acct-0"), Some(Health::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn used_account_cools_then_returns() {
        let config = PoolConfig {
            account_cooldown: Duration::from_secs(5),
            ..Default::default()
        };
        let pool = pool(1, 1, config);
        pool.acquire().unwrap().release(ReleaseOutcome::Success);
        assert_eq!(pool.health_of("acct-0"), Some(Health::Cooling));
        assert!(pool.acquire().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(pool.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn ban_lifts_after_ban_duration() {
        let config = PoolConfig {
            ban_duration: Some(Duration::from_secs(60)),
            ..no_cooldown()
        };
        let pool = pool(1, 1, config);
        pool.acquire()
            .unwrap()
            .release(ReleaseOutcome::Fatal("407".into()));
        assert!(pool.acquire().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(pool.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_waits_for_release() {
        let pool = pool(1, 1, no_cooldown());
        let lease = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        lease.release(ReleaseOutcome::Success);
        let held = waiter.await.unwrap().unwrap();

        let err = pool.acquire_timeout(Duration::from_millis(100)).await;
        assert_eq!(err.err(), Some(PoolError::Unavailable));
        held.release(ReleaseOutcome::Success);
    }

    #[test]
    fn preferred_identity_wins_and_unused_breaks_ties() {
        let config = PoolConfig {
            preferred_prefixes: vec!["10.0.0.2".into()],
            ..no_cooldown()
        };
        let preferred = pool(3, 1, config);
        let lease = preferred.acquire().unwrap();
        assert_eq!(lease.identity().id, "ip-2");
        lease.release(ReleaseOutcome::Success);

        let plain = pool(2, 1, no_cooldown());
        let first = plain.acquire().unwrap();
        let first_id = first.identity().id.clone();
        first.release(ReleaseOutcome::Success);
        let second = plain.acquire().unwrap();
        assert_ne!(second.identity().id, first_id, "never-used identity should go first");
    }

    #[test]
    fn collector_and_fallback_pools_use_disjoint_resources() {
        let env = [
            ("PROXIES", "http://10.0.0.1:8080"),
            ("ACCOUNTS", "alice:tok1"),
            ("FALLBACK_PROXIES", "http://10.0.1.1:8080,http://10.0.1.2:8080"),
            ("FALLBACK_ACCOUNTS", "carol:tok3"),
        ];
        let config = Config::from_lookup(|key| {
            env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
        })
        .unwrap();

        let collector = ResourcePool::from_config(&config);
        let fallback = ResourcePool::fallback_from_config(&config);
        assert_eq!(collector.capacity(), 1);
        assert_eq!(fallback.capacity(), 1);
        assert_eq!(fallback.snapshot().identities.healthy, 2);

        let lease = fallback.acquire().unwrap();
        assert_eq!(lease.account().id, "carol");
        assert!(lease.identity().id.starts_with("fallback-proxy-"));
        assert_eq!(collector.health_of("carol"), None);
        assert_eq!(collector.acquire().unwrap().account().id, "alice");
    }

    #[test]
    fn proxy_host_strips_scheme_and_credentials() {
        assert_eq!(proxy_host("http://u:p@1.2.3.4:8080"), "1.2.3.4");
        assert_eq!(proxy_host("socks5://proxy.example.net:1080/"), "proxy.example.net");
        assert_eq!(proxy_host("5.6.7.8"), "5.6.7.8");
    }
}
