//! Certificate store
//!
//! In-memory index of certificate bundles keyed by normalised hostname,
//! mirrored to a [`Cache`] and filled by a [`CertIssuer`].
//!
//! # Lookup
//!
//! 1. A ready, unexpired bundle in memory is returned immediately, even when
//!    it is inside the renewal window (the scheduler renews it).
//! 2. On a memory miss the host policy is consulted before any I/O. Rejected
//!    names never get an index entry or a cache entry.
//! 3. Otherwise one fetch runs per hostname: the cache is tried first, then
//!    the issuer. Concurrent callers wait on the same watch channel.
//!
//! Fetches run on their own task, so a caller that goes away (a client
//! disconnecting mid-handshake) does not cancel an issuance other callers are
//! waiting on.
//!
//! A failed fetch records its error; lookups inside the failure cooldown get
//! that error back without a new attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use autocert_common::RetryPolicy;
use autocert_config::RenewalConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::acme::CertIssuer;
use crate::bundle::CertBundle;
use crate::cache::{Cache, ACCOUNT_KEY};
use crate::error::{AutocertError, CacheError};
use crate::hostname::normalize_hostname;
use crate::policy::HostPolicy;

/// Result slot shared by every caller waiting on one fetch
type Outcome = Option<Result<Arc<CertBundle>, AutocertError>>;

/// Timing and sizing knobs for the store
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// How long before expiry a bundle becomes due for renewal
    pub renew_before: Duration,
    /// Minimum time between failed attempts for one hostname
    pub failure_cooldown: Duration,
    /// Idle time after which an entry is dropped from memory
    pub retention: Duration,
    /// Upper bound on indexed hostnames
    pub max_entries: usize,
    /// Retry policy for cache writes after issuance
    pub cache_retry: RetryPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from_config(&RenewalConfig::default())
    }
}

impl StoreSettings {
    pub fn from_config(config: &RenewalConfig) -> Self {
        Self {
            renew_before: config.renew_before(),
            failure_cooldown: config.failure_cooldown(),
            retention: config.retention(),
            max_entries: config.max_entries,
            cache_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)),
        }
    }
}

/// Lifecycle of one hostname in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Indexed but never fetched
    Absent,
    /// A fetch is in flight
    Fetching,
    /// A bundle is available
    Ready,
    /// The last fetch failed and there is no bundle
    Failed,
}

/// Outcome of [`CertificateStore::renew`]
#[derive(Debug, Clone)]
pub enum Renewal {
    /// The current bundle is outside the renewal window
    NotDue,
    /// A replacement bundle was issued and installed
    Renewed(Arc<CertBundle>),
}

struct EntryState {
    phase: EntryPhase,
    bundle: Option<Arc<CertBundle>>,
    last_attempt: Option<Instant>,
    last_access: Instant,
    failure: Option<AutocertError>,
    inflight: Option<watch::Receiver<Outcome>>,
    /// Removed from the index; lookups holding this entry must start over
    retired: bool,
}

struct StoreEntry {
    hostname: String,
    state: Mutex<EntryState>,
}

impl StoreEntry {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            state: Mutex::new(EntryState {
                phase: EntryPhase::Absent,
                bundle: None,
                last_attempt: None,
                last_access: Instant::now(),
                failure: None,
                inflight: None,
                retired: false,
            }),
        }
    }

    /// Mark the entry as leaving the index, unless a fetch is running
    ///
    /// Only call from an index removal predicate so the mark and the removal
    /// happen together.
    fn retire(&self) -> bool {
        let mut state = self.state.lock();
        if live_inflight(&state).is_some() {
            return false;
        }
        state.retired = true;
        true
    }
}

/// Where a fetch starts looking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Cache first, then the issuer
    Load,
    /// Straight to the issuer
    Renew,
}

/// Result of the synchronous half of a lookup
enum Lookup {
    Ready(Arc<CertBundle>),
    Wait(watch::Receiver<Outcome>),
}

/// Hostname-indexed certificate store with single-flight issuance
pub struct CertificateStore {
    index: DashMap<String, Arc<StoreEntry>>,
    cache: Arc<dyn Cache>,
    issuer: Arc<dyn CertIssuer>,
    policy: Arc<dyn HostPolicy>,
    settings: StoreSettings,
}

impl CertificateStore {
    pub fn new(
        cache: Arc<dyn Cache>,
        issuer: Arc<dyn CertIssuer>,
        policy: Arc<dyn HostPolicy>,
        settings: StoreSettings,
    ) -> Self {
        Self {
            index: DashMap::new(),
            cache,
            issuer,
            policy,
            settings,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Certificate for `name`, loading or issuing it if needed
    ///
    /// # Errors
    ///
    /// - [`AutocertError::InvalidServerName`] if `name` is not a usable hostname
    /// - [`AutocertError::PolicyRejected`] if the host policy refuses it
    /// - the recorded error while a failure cooldown is active
    /// - whatever the cache load or the issuer returned otherwise
    pub async fn get_certificate(&self, name: &str) -> Result<Arc<CertBundle>, AutocertError> {
        let hostname = normalize_hostname(name)?;

        match self.lookup(&hostname, Utc::now())? {
            Lookup::Ready(bundle) => Ok(bundle),
            Lookup::Wait(rx) => wait(&hostname, rx).await,
        }
    }

    /// Ready bundle from memory, without I/O
    ///
    /// Returns `None` for unknown, fetching, failed and expired entries.
    pub fn lookup_ready(&self, name: &str) -> Option<Arc<CertBundle>> {
        let hostname = normalize_hostname(name).ok()?;
        let entry = self.index.get(&hostname).map(|e| Arc::clone(e.value()))?;

        let mut state = entry.state.lock();
        let bundle = state.bundle.as_ref().filter(|b| !b.is_expired_at(Utc::now()))?;
        let bundle = Arc::clone(bundle);
        state.last_access = Instant::now();
        Some(bundle)
    }

    /// Ready bundle from memory; on a miss start a background fetch
    ///
    /// For callers that cannot wait, such as a rustls certificate resolver.
    /// A later call returns the bundle once the fetch completes.
    pub fn lookup_or_prefetch(&self, name: &str) -> Option<Arc<CertBundle>> {
        if let Some(bundle) = self.lookup_ready(name) {
            return Some(bundle);
        }
        let hostname = normalize_hostname(name).ok()?;

        match self.lookup(&hostname, Utc::now()) {
            Ok(Lookup::Ready(bundle)) => Some(bundle),
            Ok(Lookup::Wait(_)) => {
                debug!(host = %hostname, "Certificate fetch running in background");
                None
            }
            Err(e) => {
                debug!(host = %hostname, error = %e, "No certificate available");
                None
            }
        }
    }

    /// Synchronous half of a lookup: memory hit, or join/start a fetch
    fn lookup(&self, hostname: &str, now: DateTime<Utc>) -> Result<Lookup, AutocertError> {
        loop {
            let entry = match self.index.get(hostname) {
                Some(entry) => Arc::clone(entry.value()),
                None => {
                    if !self.policy.approve(hostname) {
                        debug!(host = %hostname, "Host policy rejected certificate request");
                        return Err(AutocertError::PolicyRejected {
                            host: hostname.to_string(),
                        });
                    }
                    Arc::clone(
                        self.index
                            .entry(hostname.to_string())
                            .or_insert_with(|| Arc::new(StoreEntry::new(hostname)))
                            .value(),
                    )
                }
            };

            if let Some(lookup) = self.lookup_entry(&entry, now) {
                return lookup;
            }
            trace!(host = %hostname, "Entry left the index during lookup, retrying");
        }
    }

    /// Lookup against one entry; `None` if it was retired in the meantime
    fn lookup_entry(
        &self,
        entry: &Arc<StoreEntry>,
        now: DateTime<Utc>,
    ) -> Option<Result<Lookup, AutocertError>> {
        let mut state = entry.state.lock();
        if state.retired {
            return None;
        }
        state.last_access = Instant::now();

        if let Some(bundle) = &state.bundle {
            if !bundle.is_expired_at(now) {
                return Some(Ok(Lookup::Ready(Arc::clone(bundle))));
            }
        }

        if let Some(rx) = live_inflight(&state) {
            return Some(Ok(Lookup::Wait(rx)));
        }

        if let Some(failure) = self.cooling_down(&state) {
            return Some(Err(failure));
        }

        Some(
            self.start_fetch(entry, &mut state, FetchMode::Load)
                .map(Lookup::Wait),
        )
    }

    /// Recorded failure if the cooldown since the last attempt is still running
    fn cooling_down(&self, state: &EntryState) -> Option<AutocertError> {
        let (failure, at) = match (&state.failure, state.last_attempt) {
            (Some(failure), Some(at)) => (failure, at),
            _ => return None,
        };

        let remaining = cooldown_remaining(self.settings.failure_cooldown, at.elapsed())?;
        debug!(
            remaining_ms = remaining.as_millis() as u64,
            "Returning recorded failure during cooldown"
        );
        Some(failure.clone())
    }

    /// Mark the entry fetching and spawn the fetch task
    fn start_fetch(
        &self,
        entry: &Arc<StoreEntry>,
        state: &mut EntryState,
        mode: FetchMode,
    ) -> Result<watch::Receiver<Outcome>, AutocertError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AutocertError::Configuration("certificate fetch requires a Tokio runtime".into())
        })?;

        let (tx, rx) = watch::channel(None);
        state.phase = EntryPhase::Fetching;
        state.inflight = Some(rx.clone());
        state.last_attempt = Some(Instant::now());

        let task = FetchTask {
            entry: Arc::clone(entry),
            cache: Arc::clone(&self.cache),
            issuer: Arc::clone(&self.issuer),
            cache_retry: self.settings.cache_retry,
            mode,
        };

        debug!(host = %entry.hostname, mode = ?mode, "Starting certificate fetch");
        runtime.spawn(task.run(tx));
        Ok(rx)
    }

    // ========================================================================
    // Renewal
    // ========================================================================

    /// Hostnames whose bundles are due for renewal at `now`
    pub fn due_for_renewal(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .index
            .iter()
            .filter(|entry| {
                let state = entry.value().state.lock();
                state
                    .bundle
                    .as_ref()
                    .is_some_and(|b| b.is_renewal_due_at(now, self.settings.renew_before))
            })
            .map(|entry| entry.key().clone())
            .collect();
        due.sort();
        due
    }

    /// Re-issue the bundle for `name` if it is due at `now`
    ///
    /// Not due is a no-op. A failed renewal leaves the current bundle in
    /// place and records the failure for the cooldown.
    pub async fn renew(&self, name: &str, now: DateTime<Utc>) -> Result<Renewal, AutocertError> {
        let hostname = normalize_hostname(name)?;
        let entry = self
            .index
            .get(&hostname)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| AutocertError::Certificate(format!("no certificate for '{}'", hostname)))?;

        let rx = {
            let mut state = entry.state.lock();
            if state.retired {
                return Err(AutocertError::Certificate(format!(
                    "no certificate for '{}'",
                    hostname
                )));
            }
            let due = state
                .bundle
                .as_ref()
                .is_some_and(|b| b.is_renewal_due_at(now, self.settings.renew_before));
            if !due {
                return Ok(Renewal::NotDue);
            }

            match live_inflight(&state) {
                Some(rx) => rx,
                None => {
                    if let Some(failure) = self.cooling_down(&state) {
                        return Err(failure);
                    }
                    self.start_fetch(&entry, &mut state, FetchMode::Renew)?
                }
            }
        };

        wait(&hostname, rx).await.map(Renewal::Renewed)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop idle entries and bound the index size
    ///
    /// Entries with a fetch in flight are never evicted. Returns the number
    /// of entries removed from memory; the cache is left untouched.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let retention = self.settings.retention;
        let mut removed = 0;

        let idle: Vec<String> = self
            .index
            .iter()
            .filter(|entry| {
                let state = entry.value().state.lock();
                state.phase != EntryPhase::Fetching
                    && now.saturating_duration_since(state.last_access) >= retention
            })
            .map(|entry| entry.key().clone())
            .collect();

        for hostname in idle {
            if self
                .index
                .remove_if(&hostname, |_, entry| entry.retire())
                .is_some()
            {
                debug!(host = %hostname, "Evicted idle certificate entry");
                removed += 1;
            }
        }

        let excess = self.index.len().saturating_sub(self.settings.max_entries);
        if excess > 0 {
            let mut by_access: Vec<(Instant, String)> = self
                .index
                .iter()
                .filter_map(|entry| {
                    let state = entry.value().state.lock();
                    (state.phase != EntryPhase::Fetching)
                        .then(|| (state.last_access, entry.key().clone()))
                })
                .collect();
            by_access.sort();

            for (_, hostname) in by_access.into_iter().take(excess) {
                if self
                    .index
                    .remove_if(&hostname, |_, entry| entry.retire())
                    .is_some()
                {
                    removed += 1;
                }
            }
            warn!(
                max_entries = self.settings.max_entries,
                "Certificate index over capacity, evicted least recently used entries"
            );
        }

        if removed > 0 {
            info!(removed, remaining = self.index.len(), "Evicted certificate entries");
        }
        removed
    }

    /// Install a bundle for each of its hostnames, replacing any current one
    pub fn insert_bundle(&self, bundle: CertBundle) -> Arc<CertBundle> {
        let bundle = Arc::new(bundle);
        for hostname in bundle.hostnames() {
            loop {
                let entry = Arc::clone(
                    self.index
                        .entry(hostname.clone())
                        .or_insert_with(|| Arc::new(StoreEntry::new(hostname)))
                        .value(),
                );
                let mut state = entry.state.lock();
                if state.retired {
                    continue;
                }
                state.bundle = Some(Arc::clone(&bundle));
                state.failure = None;
                if state.phase != EntryPhase::Fetching {
                    state.phase = EntryPhase::Ready;
                }
                break;
            }
        }
        bundle
    }

    /// Drop `name` from memory and delete its cache entry
    ///
    /// A fetch in flight for `name` is allowed to finish first, so callers
    /// already waiting on it still get its outcome and its cache write is
    /// deleted too.
    pub async fn forget(&self, name: &str) -> Result<(), AutocertError> {
        let hostname = normalize_hostname(name)?;

        loop {
            let indexed = self.index.get(&hostname).map(|e| Arc::clone(e.value()));
            let Some(entry) = indexed else {
                self.cache.delete(&hostname).await?;
                break;
            };

            let inflight = live_inflight(&entry.state.lock());
            if let Some(rx) = inflight {
                debug!(host = %hostname, "Waiting for running fetch before forgetting");
                let _ = wait(&hostname, rx).await;
                continue;
            }

            self.cache.delete(&hostname).await?;
            if self
                .index
                .remove_if(&hostname, |_, e| Arc::ptr_eq(e, &entry) && e.retire())
                .is_some()
            {
                break;
            }
        }

        info!(host = %hostname, "Certificate forgotten");
        Ok(())
    }

    /// Load every valid bundle in the cache into memory
    ///
    /// Unreadable and expired entries are skipped. Returns the number loaded.
    pub async fn preload(&self) -> Result<usize, AutocertError> {
        let keys = self.cache.keys().await?;
        let mut loaded = 0;

        for key in keys.iter().filter(|k| k.as_str() != ACCOUNT_KEY) {
            if let Some(bundle) = load_cached(self.cache.as_ref(), key).await {
                self.insert_bundle(bundle);
                loaded += 1;
            }
        }

        info!(loaded, cached = keys.len(), "Preloaded certificates from cache");
        Ok(loaded)
    }

    /// Hostnames with a bundle in memory
    pub fn ready_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .index
            .iter()
            .filter(|entry| entry.value().state.lock().bundle.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Phase of `name`, if it is indexed
    pub fn phase(&self, name: &str) -> Option<EntryPhase> {
        let hostname = normalize_hostname(name).ok()?;
        self.index.get(&hostname).map(|e| e.value().state.lock().phase)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("entries", &self.index.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Time left in a failure cooldown, `None` once it has run out
fn cooldown_remaining(cooldown: Duration, elapsed: Duration) -> Option<Duration> {
    (elapsed < cooldown).then(|| cooldown.saturating_sub(elapsed))
}

/// In-flight receiver whose fetch task is still alive
fn live_inflight(state: &EntryState) -> Option<watch::Receiver<Outcome>> {
    state
        .inflight
        .as_ref()
        .filter(|rx| rx.has_changed().is_ok())
        .cloned()
}

async fn wait(
    hostname: &str,
    mut rx: watch::Receiver<Outcome>,
) -> Result<Arc<CertBundle>, AutocertError> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => match outcome.as_ref() {
            Some(result) => result.clone(),
            None => Err(AutocertError::Abandoned(hostname.to_string())),
        },
        Err(_) => Err(AutocertError::Abandoned(hostname.to_string())),
    }
}

/// Valid cached bundle for `hostname`, if any
async fn load_cached(cache: &dyn Cache, hostname: &str) -> Option<CertBundle> {
    let data = match cache.get(hostname).await {
        Ok(data) => data,
        Err(CacheError::Miss) => return None,
        Err(e) => {
            warn!(host = %hostname, error = %e, "Failed to read certificate cache");
            return None;
        }
    };

    let bundle = match CertBundle::from_cache_bytes(&data) {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(host = %hostname, error = %e, "Ignoring corrupt certificate cache entry");
            return None;
        }
    };

    if !bundle.covers(hostname) {
        warn!(host = %hostname, "Cached certificate does not cover its key, ignoring");
        return None;
    }
    if bundle.is_expired_at(Utc::now()) {
        debug!(host = %hostname, expired = %bundle.not_after(), "Cached certificate expired");
        return None;
    }

    debug!(host = %hostname, expires = %bundle.not_after(), "Loaded certificate from cache");
    Some(bundle)
}

/// One fetch for one hostname, run on its own task
struct FetchTask {
    entry: Arc<StoreEntry>,
    cache: Arc<dyn Cache>,
    issuer: Arc<dyn CertIssuer>,
    cache_retry: RetryPolicy,
    mode: FetchMode,
}

impl FetchTask {
    async fn run(self, tx: watch::Sender<Outcome>) {
        let result = self.fetch().await;

        {
            let mut state = self.entry.state.lock();
            state.inflight = None;
            match &result {
                Ok(bundle) => {
                    state.bundle = Some(Arc::clone(bundle));
                    state.failure = None;
                    state.phase = EntryPhase::Ready;
                }
                Err(e) => {
                    state.failure = Some(e.clone());
                    state.last_attempt = Some(Instant::now());
                    state.phase = if state.bundle.is_some() {
                        EntryPhase::Ready
                    } else {
                        EntryPhase::Failed
                    };
                }
            }
        }

        tx.send_replace(Some(result));
    }

    async fn fetch(&self) -> Result<Arc<CertBundle>, AutocertError> {
        let hostname = self.entry.hostname.as_str();

        if self.mode == FetchMode::Load {
            if let Some(bundle) = load_cached(self.cache.as_ref(), hostname).await {
                return Ok(Arc::new(bundle));
            }
        }

        let bundle = self.issuer.issue(hostname).await?;
        if !bundle.covers(hostname) {
            return Err(AutocertError::Certificate(format!(
                "issued certificate does not cover '{}'",
                hostname
            )));
        }

        self.persist(hostname, &bundle).await;
        info!(host = %hostname, expires = %bundle.not_after(), "Certificate installed");
        Ok(Arc::new(bundle))
    }

    /// Write the bundle to the cache; failure keeps the in-memory copy
    async fn persist(&self, hostname: &str, bundle: &CertBundle) {
        let data = match bundle.to_cache_bytes() {
            Ok(data) => data,
            Err(e) => {
                error!(host = %hostname, error = %e, "Failed to encode certificate for cache");
                return;
            }
        };

        let result = self
            .cache_retry
            .run("cache write", |_: &CacheError| true, || {
                self.cache.put(hostname, &data)
            })
            .await;

        match result {
            Ok(()) => debug!(host = %hostname, "Saved certificate to cache"),
            Err(e) => error!(
                host = %hostname,
                error = %e,
                "Failed to save certificate to cache, keeping it in memory only"
            ),
        }
    }
}
