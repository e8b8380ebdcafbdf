//! Background health probing and the authoritative "is this provider usable"
//! gate.
//!
//! Each registered provider gets its own probe task. Probe history is kept
//! per provider for a trailing 24h window and every profile is rebuilt from
//! that history after each probe. Nothing here blocks payment requests: the
//! retry loops only read cached profiles.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::config::Config;
use crate::app::error::RouterError;
use crate::ledger::AttemptLedger;
use crate::models::health::history_window;
use crate::models::{HealthCheckResult, HealthStatusChange, ProviderHealthProfile, Recommendation};
use crate::services::provider_registry::ProviderRegistry;
use crate::utils::Clock;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const MIN_SUCCESS_RATE: f64 = 80.0;
pub const MAX_AVG_RESPONSE_MS: f64 = 3_000.0;

#[derive(Debug, Clone)]
pub struct HealthMonitorSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Upper bound of the random delay before a provider's first probe.
    pub jitter: Duration,
    /// Probes answering at or above this are unhealthy even on HTTP success.
    pub healthy_latency_ms: u64,
    pub default_provider: String,
}

impl HealthMonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.health_check_interval(),
            probe_timeout: config.health_check_timeout(),
            jitter: Duration::from_millis(config.health_check_jitter_ms),
            healthy_latency_ms: 3_000,
            default_provider: config.default_provider.clone(),
        }
    }
}

struct ProbeTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<dyn AttemptLedger>,
    clock: Arc<dyn Clock>,
    settings: HealthMonitorSettings,
    history: DashMap<String, VecDeque<HealthCheckResult>>,
    profiles: DashMap<String, ProviderHealthProfile>,
    probe_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<HealthStatusChange>,
    tasks: Mutex<HashMap<String, ProbeTask>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        ledger: Arc<dyn AttemptLedger>,
        clock: Arc<dyn Clock>,
        settings: HealthMonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry,
            ledger,
            clock,
            settings,
            history: DashMap::new(),
            profiles: DashMap::new(),
            probe_locks: DashMap::new(),
            events,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthStatusChange> {
        self.events.subscribe()
    }

    fn probe_lock(&self, provider: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.probe_locks.entry(provider.to_string()).or_default().value())
    }

    /// One bounded liveness call. Probe failures become unhealthy results;
    /// only an unregistered provider is an error.
    pub async fn probe(&self, provider: &str) -> Result<HealthCheckResult, RouterError> {
        self.registry.adapter(provider)?;
        let lock = self.probe_lock(provider);
        let _in_flight = lock.lock().await;
        self.probe_exclusive(provider).await
    }

    /// Caller holds the provider's probe lock.
    async fn probe_exclusive(&self, provider: &str) -> Result<HealthCheckResult, RouterError> {
        let adapter = self.registry.adapter(provider)?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.settings.probe_timeout, adapter.probe()).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (healthy, status_code, error) = match outcome {
            Ok(Ok(response)) => {
                let healthy =
                    response.is_success() && response_time_ms < self.settings.healthy_latency_ms;
                let error = (!response.is_success())
                    .then(|| format!("HTTP {}", response.status_code));
                (healthy, Some(response.status_code), error)
            }
            Ok(Err(e)) => (false, None, Some(e.to_string())),
            Err(_) => (
                false,
                None,
                Some(format!(
                    "probe timed out after {}ms",
                    self.settings.probe_timeout.as_millis()
                )),
            ),
        };

        let result = HealthCheckResult {
            provider: provider.to_string(),
            healthy,
            response_time_ms,
            status_code,
            error,
            timestamp: self.clock.now(),
        };
        debug!(
            "Probe {} -> healthy={} in {}ms",
            provider, result.healthy, result.response_time_ms
        );

        self.record(result.clone()).await;
        Ok(result)
    }

    async fn record(&self, result: HealthCheckResult) {
        let profile = {
            let mut history = self.history.entry(result.provider.clone()).or_default();
            history.push_back(result.clone());
            let cutoff = result.timestamp - history_window();
            while history.front().map(|r| r.timestamp < cutoff).unwrap_or(false) {
                history.pop_front();
            }
            ProviderHealthProfile::from_history(&result.provider, &*history)
        };

        if let Some(profile) = profile {
            let previous = self
                .profiles
                .insert(profile.provider.clone(), profile.clone());

            if let Some(previous) = previous {
                if previous.is_healthy != profile.is_healthy {
                    self.emit_change(&profile, previous.is_healthy);
                }
            }
        }

        if let Err(e) = self.ledger.record_health_check(&result).await {
            warn!("Failed to persist health check for {}: {}", result.provider, e);
        }
    }

    fn emit_change(&self, profile: &ProviderHealthProfile, was_healthy: bool) {
        if profile.is_healthy {
            info!("Provider {} recovered", profile.provider);
        } else {
            warn!(
                "Provider {} became unhealthy ({} consecutive failures)",
                profile.provider, profile.consecutive_failures
            );
        }
        // No subscribers is fine.
        let _ = self.events.send(HealthStatusChange {
            provider: profile.provider.clone(),
            was_healthy,
            is_healthy: profile.is_healthy,
            at: profile.last_checked_at,
        });
    }

    /// Cached profile without triggering a probe.
    pub fn cached_profile(&self, provider: &str) -> Option<ProviderHealthProfile> {
        self.profiles.get(provider).map(|p| p.clone())
    }

    /// Cached profile, probing once on a cold start. Concurrent cold callers
    /// share the first caller's probe.
    pub async fn get_health(&self, provider: &str) -> Result<ProviderHealthProfile, RouterError> {
        if let Some(profile) = self.cached_profile(provider) {
            return Ok(profile);
        }
        self.registry.adapter(provider)?;
        let lock = self.probe_lock(provider);
        let _in_flight = lock.lock().await;
        if let Some(profile) = self.cached_profile(provider) {
            return Ok(profile);
        }
        self.probe_exclusive(provider).await?;
        self.cached_profile(provider)
            .ok_or_else(|| RouterError::UnknownProvider(provider.to_string()))
    }

    pub async fn get_all_providers_health(&self) -> Vec<ProviderHealthProfile> {
        let lookups = self.registry.names().map(|name| self.get_health(name));
        futures::future::join_all(lookups)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Probes one provider, or every provider concurrently.
    pub async fn force_health_check(
        &self,
        provider: Option<&str>,
    ) -> Result<Vec<HealthCheckResult>, RouterError> {
        match provider {
            Some(name) => Ok(vec![self.probe(name).await?]),
            None => {
                let probes = self.registry.names().map(|name| self.probe(name));
                futures::future::join_all(probes).await.into_iter().collect()
            }
        }
    }

    pub fn passes_gate(profile: &ProviderHealthProfile) -> bool {
        profile.is_healthy
            && profile.consecutive_failures < MAX_CONSECUTIVE_FAILURES
            && profile.success_rate > MIN_SUCCESS_RATE
            && profile.avg_response_time_ms < MAX_AVG_RESPONSE_MS
    }

    /// The single "usable right now" predicate. Unknown providers are never usable.
    pub async fn should_use_provider(&self, provider: &str) -> bool {
        match self.get_health(provider).await {
            Ok(profile) => Self::passes_gate(&profile),
            Err(e) => {
                warn!("Health lookup for {} failed: {}", provider, e);
                false
            }
        }
    }

    pub async fn recommend(&self, preferred: Option<&str>, fallback: Option<&str>) -> Recommendation {
        if let Some(preferred) = preferred {
            if self.should_use_provider(preferred).await {
                return Recommendation {
                    provider: preferred.to_string(),
                    degraded: false,
                };
            }
        }

        if let Some(fallback) = fallback {
            if self.should_use_provider(fallback).await {
                warn!("Recommending fallback provider {} (degraded mode)", fallback);
                return Recommendation {
                    provider: fallback.to_string(),
                    degraded: true,
                };
            }
        }

        // Strict comparison keeps the earlier-registered provider on ties.
        let mut best: Option<(String, f64)> = None;
        for name in self.registry.names() {
            if let Some(profile) = self.profiles.get(name) {
                let score = profile.composite_score();
                if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                    best = Some((name.to_string(), score));
                }
            }
        }

        let provider = best
            .map(|(name, _)| name)
            .unwrap_or_else(|| self.settings.default_provider.clone());
        Recommendation {
            provider,
            degraded: true,
        }
    }

    /// Spawns one probe task per registered provider that is not already running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        for name in self.registry.names() {
            if tasks.contains_key(name) {
                continue;
            }
            let token = CancellationToken::new();
            let handle = tokio::spawn(Arc::clone(self).probe_loop(name.to_string(), token.clone()));
            tasks.insert(name.to_string(), ProbeTask { token, handle });
        }
        info!(
            "Health monitor started for {} providers (every {:?})",
            tasks.len(),
            self.settings.interval
        );
    }

    /// Cancels every probe task and waits for them to exit.
    pub async fn shutdown(&self) {
        let tasks: Vec<ProbeTask> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.token.cancel();
        }
        for task in tasks {
            if let Err(e) = task.handle.await {
                warn!("Probe task ended abnormally: {}", e);
            }
        }
        info!("Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    async fn probe_loop(self: Arc<Self>, provider: String, token: CancellationToken) {
        let jitter = self.initial_jitter();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.probe(&provider) => {
                    if let Err(e) = outcome {
                        warn!("Scheduled probe of {} failed: {}", provider, e);
                    }
                }
            }
        }
        debug!("Probe loop for {} stopped", provider);
    }

    fn initial_jitter(&self) -> Duration {
        let max = self.settings.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::ProviderCapabilities;
    use crate::testing::{ScriptedProbe, ScriptedProvider};
    use crate::utils::ManualClock;
    use chrono::{DateTime, Utc};

    fn settings() -> HealthMonitorSettings {
        HealthMonitorSettings {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            jitter: Duration::ZERO,
            healthy_latency_ms: 3_000,
            default_provider: "paystack".into(),
        }
    }

    fn build(
        providers: &[Arc<ScriptedProvider>],
    ) -> (Arc<HealthMonitor>, Arc<MemoryLedger>, Arc<ManualClock>) {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry
                .register(provider.clone(), ProviderCapabilities::new(["NGN"], ["NG"]))
                .unwrap();
        }
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
        let monitor = HealthMonitor::new(Arc::new(registry), ledger.clone(), clock.clone(), settings());
        (Arc::new(monitor), ledger, clock)
    }

    fn monitor(providers: &[Arc<ScriptedProvider>]) -> (Arc<HealthMonitor>, Arc<MemoryLedger>) {
        let (monitor, ledger, _) = build(providers);
        (monitor, ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_success_is_unhealthy() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack.push_probe(ScriptedProbe::Slow {
            status: 200,
            delay: Duration::from_millis(3_500),
        });
        let (monitor, _) = monitor(&[paystack]);

        let result = monitor.probe("paystack").await.unwrap();
        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(200));
        assert!(result.response_time_ms >= 3_500);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_is_recorded_not_raised() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack.push_probe(ScriptedProbe::Slow {
            status: 200,
            delay: Duration::from_secs(60),
        });
        let (monitor, ledger) = monitor(&[paystack]);

        let result = monitor.probe("paystack").await.unwrap();
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("timed out"));

        let rows = ledger
            .health_history("paystack", DateTime::<Utc>::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_and_http_errors_are_unhealthy() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack
            .push_probe(ScriptedProbe::TransportError("connection refused".into()))
            .push_probe(ScriptedProbe::Status(503));
        let (monitor, _) = monitor(&[paystack]);

        let first = monitor.probe("paystack").await.unwrap();
        assert!(!first.healthy);
        assert!(first.error.unwrap().contains("connection refused"));

        let second = monitor.probe("paystack").await.unwrap();
        assert!(!second.healthy);
        assert_eq!(second.status_code, Some(503));
    }

    #[tokio::test]
    async fn three_consecutive_failures_close_the_gate_and_one_success_resets() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack.push_probe(ScriptedProbe::Status(200));
        let (monitor, _) = monitor(&[paystack.clone()]);
        monitor.probe("paystack").await.unwrap();

        paystack.set_default_probe(ScriptedProbe::Status(500));
        for _ in 0..3 {
            monitor.probe("paystack").await.unwrap();
        }
        let profile = monitor.get_health("paystack").await.unwrap();
        assert_eq!(profile.consecutive_failures, 3);
        assert!(!monitor.should_use_provider("paystack").await);

        paystack.set_default_probe(ScriptedProbe::Status(200));
        monitor.probe("paystack").await.unwrap();
        assert_eq!(monitor.get_health("paystack").await.unwrap().consecutive_failures, 0);
    }

    #[test]
    fn gate_requires_every_metric() {
        let base = ProviderHealthProfile {
            provider: "paystack".into(),
            is_healthy: true,
            consecutive_failures: 0,
            success_rate: 95.0,
            avg_response_time_ms: 400.0,
            uptime_percent: 99.0,
            last_checked_at: DateTime::<Utc>::UNIX_EPOCH,
            checks_in_window: 20,
        };
        assert!(HealthMonitor::passes_gate(&base));
        assert!(!HealthMonitor::passes_gate(&ProviderHealthProfile { consecutive_failures: 3, ..base.clone() }));
        assert!(!HealthMonitor::passes_gate(&ProviderHealthProfile { success_rate: 80.0, ..base.clone() }));
        assert!(!HealthMonitor::passes_gate(&ProviderHealthProfile { avg_response_time_ms: 3_000.0, ..base.clone() }));
        assert!(!HealthMonitor::passes_gate(&ProviderHealthProfile { is_healthy: false, ..base }));
    }

    #[tokio::test]
    async fn cold_start_probes_once() {
        let paystack = ScriptedProvider::arc("paystack");
        let (monitor, _) = monitor(&[paystack.clone()]);

        assert!(monitor.cached_profile("paystack").is_none());
        let profile = monitor.get_health("paystack").await.unwrap();
        assert!(profile.is_healthy);
        monitor.get_health("paystack").await.unwrap();
        assert_eq!(paystack.probe_calls(), 1);

        assert!(matches!(
            monitor.get_health("stripe").await,
            Err(RouterError::UnknownProvider(_))
        ));
        assert!(!monitor.should_use_provider("stripe").await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_lookups_share_one_probe() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack.set_default_probe(ScriptedProbe::Slow {
            status: 200,
            delay: Duration::from_secs(9),
        });
        let (monitor, _) = monitor(&[paystack.clone()]);

        let started = Instant::now();
        let lookups = (0..5).map(|_| monitor.should_use_provider("paystack"));
        let verdicts = futures::future::join_all(lookups).await;

        assert_eq!(verdicts.len(), 5);
        assert_eq!(paystack.probe_calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn results_older_than_a_day_leave_the_profile() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack
            .push_probe(ScriptedProbe::Status(503))
            .push_probe(ScriptedProbe::Status(200));
        let (monitor, _, clock) = build(&[paystack]);

        monitor.probe("paystack").await.unwrap();
        let before = monitor.cached_profile("paystack").unwrap();
        assert_eq!(before.uptime_percent, 0.0);

        clock.advance(chrono::Duration::hours(25));
        monitor.probe("paystack").await.unwrap();

        let after = monitor.cached_profile("paystack").unwrap();
        assert_eq!(after.checks_in_window, 1);
        assert_eq!(after.uptime_percent, 100.0);
        assert_eq!(after.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn emits_status_changes_on_flip_only() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack
            .push_probe(ScriptedProbe::Status(200))
            .push_probe(ScriptedProbe::Status(200))
            .push_probe(ScriptedProbe::Status(502))
            .push_probe(ScriptedProbe::Status(502))
            .push_probe(ScriptedProbe::Status(200));
        let (monitor, _) = monitor(&[paystack]);
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.probe("paystack").await.unwrap();
        }

        let down = events.try_recv().unwrap();
        assert!(down.was_healthy && !down.is_healthy);
        let up = events.try_recv().unwrap();
        assert!(!up.was_healthy && up.is_healthy);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn recommend_walks_preferred_fallback_then_score() {
        let paystack = ScriptedProvider::arc("paystack");
        let yoco = ScriptedProvider::arc("yoco");
        let (monitor, _) = monitor(&[paystack.clone(), yoco.clone()]);

        let rec = monitor.recommend(Some("paystack"), Some("yoco")).await;
        assert_eq!(rec, Recommendation { provider: "paystack".into(), degraded: false });

        paystack.set_default_probe(ScriptedProbe::Status(500));
        monitor.force_health_check(Some("paystack")).await.unwrap();
        let rec = monitor.recommend(Some("paystack"), Some("yoco")).await;
        assert_eq!(rec, Recommendation { provider: "yoco".into(), degraded: true });

        yoco.set_default_probe(ScriptedProbe::Status(500));
        monitor.force_health_check(None).await.unwrap();
        monitor.force_health_check(None).await.unwrap();
        // paystack: 3 failures of 4 checks, yoco: 2 of 3; yoco scores higher.
        let rec = monitor.recommend(Some("paystack"), Some("yoco")).await;
        assert_eq!(rec.provider, "yoco");
        assert!(rec.degraded);
    }

    #[tokio::test]
    async fn recommend_defaults_without_any_profiles() {
        let (monitor, _) = monitor(&[ScriptedProvider::arc("paystack"), ScriptedProvider::arc("yoco")]);
        let rec = monitor.recommend(None, None).await;
        assert_eq!(rec.provider, "paystack");
        assert!(rec.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_probes_run_until_shutdown() {
        let paystack = ScriptedProvider::arc("paystack");
        let yoco = ScriptedProvider::arc("yoco");
        let (monitor, _) = monitor(&[paystack.clone(), yoco.clone()]);

        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(paystack.probe_calls(), 2);
        assert_eq!(yoco.probe_calls(), 2);

        monitor.shutdown().await;
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(paystack.probe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_probe_does_not_delay_other_providers() {
        let paystack = ScriptedProvider::arc("paystack");
        paystack.set_default_probe(ScriptedProbe::Slow {
            status: 200,
            delay: Duration::from_secs(9),
        });
        let yoco = ScriptedProvider::arc("yoco");
        let (monitor, _) = monitor(&[paystack, yoco]);

        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.cached_profile("yoco").is_some());
        assert!(monitor.cached_profile("paystack").is_none());
        monitor.shutdown().await;
    }
}
