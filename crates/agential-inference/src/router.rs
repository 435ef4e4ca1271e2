//! Primary/secondary inference routing with sticky failover.
//!
//! The router owns a declared primary and secondary endpoint and an explicit
//! state (`PRIMARY_ACTIVE`, `SECONDARY_ACTIVE`, `BOTH_DOWN`). A live call goes
//! to the active endpoint; on failure it gets exactly one immediate attempt on
//! the other. A successful fallback switches the active endpoint and the
//! switch sticks until the background probe sees the declared primary healthy
//! again.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use agential_core::defaults::{
    PROVIDER_CALL_TIMEOUT_SECS, PROVIDER_PROBE_INTERVAL_SECS, PROVIDER_PROBE_TIMEOUT_SECS,
};
use agential_core::{
    EndpointFailure, Error, InferenceProvider, InferenceRequest, InferenceResponse,
    ProviderEndpoint, ProviderHealth, ProviderRole, Result,
};

/// Router failover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterState {
    PrimaryActive,
    SecondaryActive,
    BothDown,
}

impl RouterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterState::PrimaryActive => "PRIMARY_ACTIVE",
            RouterState::SecondaryActive => "SECONDARY_ACTIVE",
            RouterState::BothDown => "BOTH_DOWN",
        }
    }

    fn active_for(role: ProviderRole) -> Self {
        match role {
            ProviderRole::Primary => RouterState::PrimaryActive,
            ProviderRole::Secondary => RouterState::SecondaryActive,
        }
    }

    /// Endpoint order for a live call in this state.
    fn call_order(&self) -> [ProviderRole; 2] {
        match self {
            RouterState::SecondaryActive => [ProviderRole::Secondary, ProviderRole::Primary],
            RouterState::PrimaryActive | RouterState::BothDown => {
                [ProviderRole::Primary, ProviderRole::Secondary]
            }
        }
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router timeouts and probe cadence.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on a single live call to one endpoint.
    pub call_timeout: Duration,
    /// Bound on a single probe.
    pub probe_timeout: Duration,
    /// Background probe interval.
    pub probe_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(PROVIDER_CALL_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(PROVIDER_PROBE_TIMEOUT_SECS),
            probe_interval: Duration::from_secs(PROVIDER_PROBE_INTERVAL_SECS),
        }
    }
}

impl RouterConfig {
    /// Read `PROVIDER_CALL_TIMEOUT_SECS`, `PROVIDER_PROBE_TIMEOUT_SECS` and
    /// `PROVIDER_PROBE_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = Self::default();
        Self {
            call_timeout: secs("PROVIDER_CALL_TIMEOUT_SECS", defaults.call_timeout),
            probe_timeout: secs("PROVIDER_PROBE_TIMEOUT_SECS", defaults.probe_timeout),
            probe_interval: secs("PROVIDER_PROBE_INTERVAL_SECS", defaults.probe_interval),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

/// State guarded by the router lock.
struct RouterInner {
    state: RouterState,
    primary: ProviderEndpoint,
    secondary: ProviderEndpoint,
}

impl RouterInner {
    fn endpoint_mut(&mut self, role: ProviderRole) -> &mut ProviderEndpoint {
        match role {
            ProviderRole::Primary => &mut self.primary,
            ProviderRole::Secondary => &mut self.secondary,
        }
    }

    fn set_state(&mut self, to: RouterState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        match to {
            RouterState::BothDown => error!(
                subsystem = "inference",
                component = "router",
                from = %from,
                router_state = %to,
                reason,
                "Both inference providers down"
            ),
            RouterState::SecondaryActive => warn!(
                subsystem = "inference",
                component = "router",
                from = %from,
                router_state = %to,
                provider = %self.secondary.identity,
                reason,
                "Failing over to secondary provider"
            ),
            RouterState::PrimaryActive => info!(
                subsystem = "inference",
                component = "router",
                from = %from,
                router_state = %to,
                provider = %self.primary.identity,
                reason,
                "Primary provider active"
            ),
        }
    }
}

/// Routes inference calls across a primary/secondary provider pair.
pub struct ProviderRouter {
    primary: Arc<dyn InferenceProvider>,
    secondary: Arc<dyn InferenceProvider>,
    inner: RwLock<RouterInner>,
    config: RouterConfig,
}

impl ProviderRouter {
    /// Create a router. Until `boot` runs the declared primary is assumed active.
    pub fn new(
        primary: Arc<dyn InferenceProvider>,
        secondary: Arc<dyn InferenceProvider>,
        config: RouterConfig,
    ) -> Self {
        let inner = RouterInner {
            state: RouterState::PrimaryActive,
            primary: ProviderEndpoint::new(primary.identity(), ProviderRole::Primary),
            secondary: ProviderEndpoint::new(secondary.identity(), ProviderRole::Secondary),
        };
        Self {
            primary,
            secondary,
            inner: RwLock::new(inner),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn state(&self) -> RouterState {
        self.inner.read().await.state
    }

    /// Snapshot of both endpoints, primary first.
    pub async fn endpoints(&self) -> [ProviderEndpoint; 2] {
        let inner = self.inner.read().await;
        [inner.primary.clone(), inner.secondary.clone()]
    }

    fn provider(&self, role: ProviderRole) -> &Arc<dyn InferenceProvider> {
        match role {
            ProviderRole::Primary => &self.primary,
            ProviderRole::Secondary => &self.secondary,
        }
    }

    /// Probe one endpoint under the probe timeout and record its health.
    async fn probe_endpoint(&self, role: ProviderRole) -> Result<()> {
        let provider = self.provider(role);
        let result =
            match tokio::time::timeout(self.config.probe_timeout, provider.probe()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "{} probe timed out after {:?}",
                    provider.identity(),
                    self.config.probe_timeout
                ))),
            };

        let mut inner = self.inner.write().await;
        let endpoint = inner.endpoint_mut(role);
        endpoint.last_probed_at = Some(Utc::now());
        endpoint.health = if result.is_ok() {
            ProviderHealth::Healthy
        } else {
            ProviderHealth::Down
        };
        debug!(
            subsystem = "inference",
            component = "router",
            op = "probe",
            provider = %endpoint.identity,
            health = %endpoint.health,
            "Endpoint probed"
        );
        result
    }

    /// Probe both endpoints and pick the starting state.
    ///
    /// Both healthy → declared primary; one healthy → that one; none → `BOTH_DOWN`.
    pub async fn boot(&self) -> RouterState {
        let (primary, secondary) = tokio::join!(
            self.probe_endpoint(ProviderRole::Primary),
            self.probe_endpoint(ProviderRole::Secondary)
        );

        let to = match (primary.is_ok(), secondary.is_ok()) {
            (true, _) => RouterState::PrimaryActive,
            (false, true) => RouterState::SecondaryActive,
            (false, false) => RouterState::BothDown,
        };

        let mut inner = self.inner.write().await;
        inner.set_state(to, "boot probe");
        info!(
            subsystem = "inference",
            component = "router",
            op = "boot",
            router_state = %inner.state,
            primary = %inner.primary.identity,
            primary_health = %inner.primary.health,
            secondary = %inner.secondary.identity,
            secondary_health = %inner.secondary.health,
            "Provider router booted"
        );
        inner.state
    }

    /// Route a call with the configured call timeout.
    pub async fn call(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        self.call_with_timeout(request, self.config.call_timeout)
            .await
    }

    /// Route a call: active endpoint first, then exactly one attempt on the other.
    pub async fn call_with_timeout(
        &self,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> Result<InferenceResponse> {
        let observed = self.state().await;
        let [first, fallback] = observed.call_order();

        let first_failure = match self.attempt(first, request, timeout).await {
            Ok(response) => {
                self.record_success(first, observed).await;
                return Ok(response);
            }
            Err(failure) => failure,
        };

        warn!(
            subsystem = "inference",
            component = "router",
            op = "call",
            provider = %first_failure.endpoint,
            error = %first_failure.cause,
            "Provider call failed, trying fallback"
        );
        self.mark_health(first, ProviderHealth::Degraded).await;

        match self.attempt(fallback, request, timeout).await {
            Ok(response) => {
                let mut inner = self.inner.write().await;
                inner.endpoint_mut(fallback).health = ProviderHealth::Healthy;
                inner.set_state(RouterState::active_for(fallback), "fallback call succeeded");
                Ok(response)
            }
            Err(fallback_failure) => {
                {
                    let mut inner = self.inner.write().await;
                    inner.endpoint_mut(first).health = ProviderHealth::Down;
                    inner.endpoint_mut(fallback).health = ProviderHealth::Down;
                    inner.set_state(RouterState::BothDown, "both endpoints failed a live call");
                }
                error!(
                    subsystem = "inference",
                    component = "router",
                    op = "call",
                    first = %first_failure,
                    fallback = %fallback_failure,
                    "Both inference providers failed"
                );
                Err(Error::provider_unavailable(first_failure, fallback_failure))
            }
        }
    }

    async fn attempt(
        &self,
        role: ProviderRole,
        request: &InferenceRequest,
        timeout: Duration,
    ) -> std::result::Result<InferenceResponse, EndpointFailure> {
        let provider = self.provider(role);
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, provider.complete(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(EndpointFailure::new(provider.identity(), e.to_string())),
            Err(_) => Err(EndpointFailure::new(
                provider.identity(),
                format!("timed out after {:?}", timeout),
            )),
        };
        debug!(
            subsystem = "inference",
            component = "router",
            op = "attempt",
            provider = provider.identity(),
            success = result.is_ok(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Provider attempt finished"
        );
        result
    }

    async fn record_success(&self, role: ProviderRole, observed: RouterState) {
        let mut inner = self.inner.write().await;
        inner.endpoint_mut(role).health = ProviderHealth::Healthy;
        // A call that succeeded while BOTH_DOWN recovers the router, unless a
        // concurrent call already moved it.
        if observed == RouterState::BothDown && inner.state == RouterState::BothDown {
            inner.set_state(RouterState::active_for(role), "live call succeeded");
        }
    }

    async fn mark_health(&self, role: ProviderRole, health: ProviderHealth) {
        self.inner.write().await.endpoint_mut(role).health = health;
    }

    /// One background probe pass.
    ///
    /// - `BOTH_DOWN`: probe both concurrently and activate whichever passes first.
    /// - `SECONDARY_ACTIVE`: restore the declared primary once its probe passes.
    /// - `PRIMARY_ACTIVE`: refresh both endpoints' health only.
    pub async fn probe_once(&self) -> RouterState {
        match self.state().await {
            RouterState::BothDown => {
                let mut probes: FuturesUnordered<_> =
                    [ProviderRole::Primary, ProviderRole::Secondary]
                        .into_iter()
                        .map(|role| async move { (role, self.probe_endpoint(role).await) })
                        .collect();

                while let Some((role, result)) = probes.next().await {
                    if result.is_ok() {
                        let mut inner = self.inner.write().await;
                        if inner.state == RouterState::BothDown {
                            inner.set_state(RouterState::active_for(role), "recovery probe passed");
                        }
                        break;
                    }
                }
            }
            RouterState::SecondaryActive => {
                let (primary, _) = tokio::join!(
                    self.probe_endpoint(ProviderRole::Primary),
                    self.probe_endpoint(ProviderRole::Secondary)
                );
                if primary.is_ok() {
                    let mut inner = self.inner.write().await;
                    if inner.state == RouterState::SecondaryActive {
                        inner.set_state(RouterState::PrimaryActive, "primary probe passed");
                    }
                }
            }
            RouterState::PrimaryActive => {
                let _ = tokio::join!(
                    self.probe_endpoint(ProviderRole::Primary),
                    self.probe_endpoint(ProviderRole::Secondary)
                );
            }
        }
        self.state().await
    }

    /// Run `probe_once` every `probe_interval` until the handle shuts down.
    pub fn spawn_probe_loop(self: &Arc<Self>) -> ProbeHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let router = Arc::clone(self);
        let interval = self.config.probe_interval;

        let task = tokio::spawn(async move {
            info!(
                subsystem = "inference",
                component = "router",
                interval_secs = interval.as_secs(),
                "Probe loop started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "inference", component = "router", "Probe loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        router.probe_once().await;
                    }
                }
            }
        });

        ProbeHandle { shutdown_tx, task }
    }
}

/// Handle to a running probe loop.
pub struct ProbeHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ProbeHandle {
    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the loop already exited.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("probe loop panicked: {}", e)))
    }
}
