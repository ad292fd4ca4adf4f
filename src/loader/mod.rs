//! Credential loaders: one watch-and-reconnect task per configured secret.
//!
//! ```text
//!            ┌──────────────┐  watch ok   ┌──────────┐
//!   start ──►│ Disconnected │────────────►│ Watching │──┐ Added/Modified → parse → put
//!            └──────────────┘             └──────────┘◄─┘ Deleted → clear
//!                 ▲    │ watch failed          │ Error / stream end
//!                 │    ▼                       ▼
//!            ┌──────────────────────────────────────┐
//!            │ Reconnecting(delay)                  │
//!            └──────────────────────────────────────┘
//!   cancel (from any state) ──► Terminated
//! ```
//!
//! Loaders share nothing but the [`CredentialCache`], so one secret stuck in
//! a reconnect cycle never delays another.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::ReconnectPolicy;

use crate::config::{CredentialsConfig, ReconnectConfig, SecretConfig};
use crate::credential::CredentialCache;
use crate::feed::{ChangeFeed, SecretEvent, SecretEventStream, SecretFields};

/// Consecutive identical failures logged at `warn` before dropping to `debug`.
const LOUD_FAILURES: u32 = 3;

/// Spawns and owns the per-secret loader tasks.
pub struct CredentialLoader {
    feed: Arc<dyn ChangeFeed>,
    cache: Arc<CredentialCache>,
    secrets: Vec<SecretConfig>,
    reconnect: ReconnectConfig,
}

impl CredentialLoader {
    /// Create a loader for every secret in `config`.
    #[must_use]
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        cache: Arc<CredentialCache>,
        config: &CredentialsConfig,
    ) -> Self {
        Self {
            feed,
            cache,
            secrets: config.secrets.clone(),
            reconnect: config.reconnect.clone(),
        }
    }

    /// Spawn one task per secret. All of them stop when `cancel` fires.
    #[must_use]
    pub fn start(&self, cancel: CancellationToken) -> LoaderHandle {
        let tasks = self
            .secrets
            .iter()
            .map(|secret| {
                let watch = SecretWatch {
                    name: secret.name.clone(),
                    fields: secret.fields(),
                    feed: Arc::clone(&self.feed),
                    cache: Arc::clone(&self.cache),
                    policy: ReconnectPolicy::new(&self.reconnect),
                    failures: FailureLog::default(),
                };
                tokio::spawn(watch.run(cancel.child_token()))
            })
            .collect();

        info!(secrets = self.secrets.len(), "Credential loaders started");
        LoaderHandle { cancel, tasks }
    }
}

/// Running loader tasks.
#[derive(Debug)]
pub struct LoaderHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LoaderHandle {
    /// Signal every loader to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every loader to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Credential loader task panicked");
            }
        }
    }

    /// Cancel and wait.
    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}

enum State {
    Disconnected,
    Watching(SecretEventStream),
    Reconnecting(Duration),
    Terminated,
}

struct SecretWatch {
    name: String,
    fields: SecretFields,
    feed: Arc<dyn ChangeFeed>,
    cache: Arc<CredentialCache>,
    policy: ReconnectPolicy,
    failures: FailureLog,
}

impl SecretWatch {
    async fn run(mut self, cancel: CancellationToken) {
        let mut state = State::Disconnected;
        loop {
            state = match state {
                State::Disconnected => self.connect(&cancel).await,
                State::Watching(stream) => self.consume(stream, &cancel).await,
                State::Reconnecting(delay) => {
                    debug!(secret = %self.name, delay = ?delay, "Reconnecting after delay");
                    if sleep_or_cancel(delay, &cancel).await {
                        State::Disconnected
                    } else {
                        State::Terminated
                    }
                }
                State::Terminated => break,
            };
        }
        debug!(secret = %self.name, "Credential loader stopped");
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> State {
        if cancel.is_cancelled() {
            return State::Terminated;
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return State::Terminated,
            result = self.feed.watch(&self.name) => result,
        };

        match result {
            Ok(stream) => {
                // Failures are forgotten only once the watch delivers something.
                if self.failures.is_failing() {
                    debug!(secret = %self.name, "Watch re-established");
                } else {
                    info!(secret = %self.name, "Watch established");
                }
                State::Watching(stream)
            }
            Err(e) => {
                self.failures
                    .record(&self.name, "watch request failed", &e.to_string());
                State::Reconnecting(self.policy.next_delay())
            }
        }
    }

    async fn consume(
        &mut self,
        mut stream: SecretEventStream,
        cancel: &CancellationToken,
    ) -> State {
        let mut delivered = false;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break State::Terminated,
                event = stream.next() => event,
            };

            match event {
                Some(SecretEvent::Added(payload) | SecretEvent::Modified(payload)) => {
                    delivered = true;
                    self.progress();
                    if let Err(e) = self.cache.put_payload(&self.name, &payload, &self.fields) {
                        warn!(
                            secret = %self.name,
                            error = %e,
                            "Credential rejected, keeping previous one"
                        );
                    }
                }
                Some(SecretEvent::Deleted) => {
                    delivered = true;
                    self.progress();
                    if self.cache.clear(&self.name) {
                        warn!(secret = %self.name, "Secret deleted, credential cleared");
                    }
                }
                Some(SecretEvent::Error(e)) => {
                    self.failures.record(&self.name, "watch failed", &e.to_string());
                    break self.reconnect(delivered);
                }
                None => {
                    self.failures
                        .record(&self.name, "watch ended", "feed closed the stream");
                    break self.reconnect(delivered);
                }
            }
        }
    }

    fn progress(&mut self) {
        if self.failures.recover() {
            info!(secret = %self.name, "Watch recovered");
        }
    }

    fn reconnect(&mut self, delivered: bool) -> State {
        if delivered {
            self.policy.reset();
        }
        State::Reconnecting(self.policy.next_delay())
    }
}

/// `true` if the full delay elapsed, `false` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Keeps a persistent failure from flooding the log.
#[derive(Debug, Default)]
struct FailureLog {
    consecutive: u32,
    last: Option<String>,
}

impl FailureLog {
    fn record(&mut self, secret: &str, what: &str, reason: &str) {
        let message = format!("{what}: {reason}");
        if self.last.as_deref() == Some(message.as_str()) {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
            self.last = Some(message);
        }

        if self.consecutive <= LOUD_FAILURES {
            warn!(secret, reason, consecutive = self.consecutive, "Credential {what}");
        } else {
            debug!(secret, reason, consecutive = self.consecutive, "Credential {what}");
        }
    }

    fn is_failing(&self) -> bool {
        self.consecutive > 0
    }

    /// Forget past failures; `true` if there were any.
    fn recover(&mut self) -> bool {
        let had_failures = self.consecutive > 0;
        self.consecutive = 0;
        self.last = None;
        had_failures
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::error::{CacheError, WatchError};
    use crate::feed::RawSecretPayload;

    /// What one call to `watch` produces.
    enum Script {
        Fail,
        Events(Vec<SecretEvent>),
    }

    /// Replays scripted watches per secret; once a secret's script runs out,
    /// watches stay open and silent.
    #[derive(Default)]
    struct FakeFeed {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        calls: Mutex<HashMap<String, Vec<Instant>>>,
        total_calls: AtomicUsize,
    }

    impl FakeFeed {
        fn script(self, secret: &str, steps: Vec<Script>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(secret.to_string(), steps.into());
            self
        }

        fn calls(&self, secret: &str) -> Vec<Instant> {
            self.calls.lock().unwrap().get(secret).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChangeFeed for FakeFeed {
        async fn watch(&self, secret: &str) -> Result<SecretEventStream, WatchError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .entry(secret.to_string())
                .or_default()
                .push(Instant::now());

            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(secret)
                .and_then(VecDeque::pop_front);
            match step {
                Some(Script::Fail) => Err(WatchError::Establish {
                    secret: secret.to_string(),
                    reason: "connection refused".to_string(),
                }),
                Some(Script::Events(events)) => Ok(futures::stream::iter(events).boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn pem_payload(cn: &str) -> RawSecretPayload {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let cert = params.self_signed(&key_pair).unwrap();
        let mut data = HashMap::new();
        data.insert("tls.crt".to_string(), cert.pem().into_bytes());
        data.insert("tls.key".to_string(), key_pair.serialize_pem().into_bytes());
        RawSecretPayload::new(data)
    }

    fn config(names: &[&str]) -> CredentialsConfig {
        CredentialsConfig {
            secrets: names.iter().map(|n| SecretConfig::new(*n)).collect(),
            reconnect: ReconnectConfig::default(),
        }
    }

    fn stream_error(secret: &str) -> SecretEvent {
        SecretEvent::Error(WatchError::Stream {
            secret: secret.to_string(),
            reason: "connection reset".to_string(),
        })
    }

    fn cn(cache: &CredentialCache, name: &str) -> Option<String> {
        cache.get(name).ok().and_then(|c| c.info().common_name.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_within_two_intervals_after_error() {
        // GIVEN: a feed that delivers one Error and closes
        let feed = Arc::new(FakeFeed::default().script(
            "client",
            vec![Script::Events(vec![stream_error("client")])],
        ));
        let cache = Arc::new(CredentialCache::new());
        let started = Instant::now();

        // WHEN
        let handle =
            CredentialLoader::new(feed.clone(), cache, &config(&["client"])).start(CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(10)).await;

        // THEN: initial watch plus at least one reconnect inside 2 × 5s
        let calls = feed.calls("client");
        assert!(calls.len() >= 2, "only {} watch calls", calls.len());
        assert!(calls[1] - started <= Duration::from_secs(10));
        assert!(calls[1] - calls[0] >= Duration::from_secs(5));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_watch_requests() {
        let feed = Arc::new(
            FakeFeed::default().script("client", vec![Script::Fail, Script::Fail]),
        );
        let cache = Arc::new(CredentialCache::new());

        let handle =
            CredentialLoader::new(feed.clone(), cache, &config(&["client"])).start(CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(feed.calls("client").len(), 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn added_then_deleted_clears_cache() {
        // GIVEN: a secret that is loaded and then removed
        let feed = Arc::new(FakeFeed::default().script(
            "client",
            vec![Script::Events(vec![
                SecretEvent::Added(pem_payload("first")),
                SecretEvent::Deleted,
            ])],
        ));
        let cache = Arc::new(CredentialCache::new());

        // WHEN
        let handle = CredentialLoader::new(feed, Arc::clone(&cache), &config(&["client"]))
            .start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // THEN
        assert_eq!(
            cache.get("client").unwrap_err(),
            CacheError::Empty("client".to_string())
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_update_keeps_previous_credential() {
        let mut bad = HashMap::new();
        bad.insert("tls.crt".to_string(), b"not pem".to_vec());
        bad.insert("tls.key".to_string(), b"not pem".to_vec());
        let feed = Arc::new(FakeFeed::default().script(
            "client",
            vec![Script::Events(vec![
                SecretEvent::Added(pem_payload("good")),
                SecretEvent::Modified(RawSecretPayload::new(bad)),
            ])],
        ));
        let cache = Arc::new(CredentialCache::new());

        let handle = CredentialLoader::new(feed, Arc::clone(&cache), &config(&["client"]))
            .start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cn(&cache, "client").as_deref(), Some("good"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn modified_replaces_in_delivery_order() {
        let feed = Arc::new(FakeFeed::default().script(
            "client",
            vec![Script::Events(vec![
                SecretEvent::Added(pem_payload("v1")),
                SecretEvent::Modified(pem_payload("v2")),
                SecretEvent::Modified(pem_payload("v3")),
            ])],
        ));
        let cache = Arc::new(CredentialCache::new());

        let handle = CredentialLoader::new(feed, Arc::clone(&cache), &config(&["client"]))
            .start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cn(&cache, "client").as_deref(), Some("v3"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_secret_does_not_block_healthy_one() {
        // GIVEN: one secret whose feed always fails and one that loads
        let feed = Arc::new(
            FakeFeed::default()
                .script("broken", (0..100).map(|_| Script::Fail).collect())
                .script(
                    "healthy",
                    vec![Script::Events(vec![SecretEvent::Added(pem_payload("ok"))])],
                ),
        );
        let cache = Arc::new(CredentialCache::new());

        // WHEN
        let handle = CredentialLoader::new(
            feed.clone(),
            Arc::clone(&cache),
            &config(&["broken", "healthy"]),
        )
        .start(CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(30)).await;

        // THEN
        assert_eq!(cn(&cache, "healthy").as_deref(), Some("ok"));
        assert!(cache.get("broken").is_err());
        assert!(feed.calls("broken").len() >= 5);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_reconnecting() {
        // GIVEN: a feed that always fails
        let feed = Arc::new(
            FakeFeed::default().script("client", (0..100).map(|_| Script::Fail).collect()),
        );
        let cache = Arc::new(CredentialCache::new());
        let cancel = CancellationToken::new();
        let handle =
            CredentialLoader::new(feed.clone(), cache, &config(&["client"])).start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // WHEN
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("loader did not stop");

        // THEN: no further watch attempts
        let calls = feed.total_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.total_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_open_watch() {
        let feed = Arc::new(FakeFeed::default());
        let cache = Arc::new(CredentialCache::new());

        let handle =
            CredentialLoader::new(feed, cache, &config(&["a", "b"])).start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("loaders did not stop");
    }

    fn secret_watch(feed: Arc<FakeFeed>, cache: Arc<CredentialCache>) -> SecretWatch {
        SecretWatch {
            name: "client".to_string(),
            fields: SecretFields::default(),
            feed,
            cache,
            policy: ReconnectPolicy::new(&ReconnectConfig::default()),
            failures: FailureLog::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watches_that_fail_before_delivering_keep_the_failure_count() {
        // GIVEN: five watches that connect and fail at once, then one that delivers
        let mut steps: Vec<Script> = (0..5)
            .map(|_| Script::Events(vec![stream_error("client")]))
            .collect();
        steps.push(Script::Events(vec![
            SecretEvent::Added(pem_payload("ok")),
            stream_error("client"),
        ]));
        let feed = Arc::new(FakeFeed::default().script("client", steps));
        let mut watch = secret_watch(feed, Arc::new(CredentialCache::new()));
        let cancel = CancellationToken::new();

        // WHEN: the connect-then-fail cycle repeats
        for _ in 0..5 {
            let State::Watching(stream) = watch.connect(&cancel).await else {
                panic!("watch was not established");
            };
            watch.consume(stream, &cancel).await;
        }

        // THEN: successful connects do not reset suppression
        assert_eq!(watch.failures.consecutive, 5);

        // WHEN: a watch delivers an event before failing
        let State::Watching(stream) = watch.connect(&cancel).await else {
            panic!("watch was not established");
        };
        watch.consume(stream, &cancel).await;

        // THEN: the count restarts from that failure
        assert_eq!(watch.failures.consecutive, 1);
    }

    #[test]
    fn failure_log_counts_identical_failures() {
        let mut log = FailureLog::default();
        for _ in 0..5 {
            log.record("s", "watch failed", "refused");
        }
        assert_eq!(log.consecutive, 5);

        log.record("s", "watch failed", "timeout");
        assert_eq!(log.consecutive, 1);

        assert!(log.recover());
        assert!(!log.recover());
    }
}
