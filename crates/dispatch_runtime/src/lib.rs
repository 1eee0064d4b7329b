//! Process wiring for the dispatch services.
//!
//! [`DispatchRuntime`] builds every component from a [`DispatchConfig`] and
//! runs them as sibling tokio tasks: matching consumers, the booking
//! lifecycle consumer, the gateway listener and its trip relay, the integrity
//! monitor, and periodic maintenance. Each task runs inside a `component`
//! span. The first component to fail cancels the others.

mod overrides;

pub use overrides::Overrides;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use dispatch_core::channel::{run_consumer, ChannelError, Connector, InMemoryBroker};
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::config::{ConfigError, DispatchConfig, GatewayConfig};
use dispatch_core::gateway::{
    gateway_supervisor, relay_subscription, CredentialVerifier, GatewayError, GatewayListener,
    JwtVerifier, LocationGateway, StaticTokenVerifier, TripRelay, TripRooms,
};
use dispatch_core::integrity::{
    integrity_subscription, integrity_supervisor, InMemoryAnomalyLog, InMemoryTrustLedger,
    IntegrityMonitor,
};
use dispatch_core::matching::{
    lifecycle_subscription, matching_subscription, matching_supervisor, BookingLifecycle,
    InMemoryAssignmentLedger, LedgerMode, MatchingWorker,
};
use dispatch_core::spatial::DriverGeoIndex;
use dispatch_core::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("{component} failed: {source}")]
    Channel {
        component: &'static str,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("{component} task aborted: {message}")]
    Task {
        component: &'static str,
        message: String,
    },
}

/// Static token table first, then JWTs when a secret is configured.
pub struct ConfiguredVerifier {
    table: StaticTokenVerifier,
    jwt: Option<JwtVerifier>,
}

impl ConfiguredVerifier {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let table = config
            .static_tokens
            .iter()
            .fold(StaticTokenVerifier::new(), |verifier, (token, worker_id)| {
                verifier.with_token(token, worker_id)
            });
        let jwt = config.token_secret.as_deref().map(JwtVerifier::new);
        if jwt.is_none() && config.static_tokens.is_empty() {
            warn!("no gateway credentials configured, every session will be refused");
        }
        Self { table, jwt }
    }
}

impl CredentialVerifier for ConfiguredVerifier {
    fn verify(&self, token: &str) -> Result<String, GatewayError> {
        match (self.table.verify(token), &self.jwt) {
            (Ok(worker_id), _) => Ok(worker_id),
            (Err(_), Some(jwt)) => jwt.verify(token),
            (Err(err), None) => Err(err),
        }
    }
}

/// Shared state of one dispatch process. Every handle is an explicit `Arc`.
pub struct DispatchRuntime<K: Connector = InMemoryBroker> {
    config: DispatchConfig,
    connector: K,
    clock: Arc<dyn Clock>,
    index: Arc<DriverGeoIndex>,
    ledger: Arc<InMemoryAssignmentLedger>,
    trust: Arc<InMemoryTrustLedger>,
    anomalies: Arc<InMemoryAnomalyLog>,
    rooms: Arc<TripRooms>,
}

impl DispatchRuntime<InMemoryBroker> {
    /// Runtime over a fresh in-process broker.
    pub fn in_memory(config: DispatchConfig) -> Result<Self, RuntimeError> {
        Self::new(config, InMemoryBroker::new(), Arc::new(SystemClock))
    }
}

impl<K: Connector + Clone> DispatchRuntime<K> {
    pub fn new(config: DispatchConfig, connector: K, clock: Arc<dyn Clock>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let index = Arc::new(DriverGeoIndex::new(
            config.index.geo_index_config()?,
            clock.clone(),
        ));
        Ok(Self {
            config,
            connector,
            ledger: Arc::new(InMemoryAssignmentLedger::with_clock(
                LedgerMode::Permissive,
                clock.clone(),
            )),
            clock,
            index,
            trust: Arc::new(InMemoryTrustLedger::new()),
            anomalies: Arc::new(InMemoryAnomalyLog::new()),
            rooms: Arc::new(TripRooms::new()),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn index(&self) -> &Arc<DriverGeoIndex> {
        &self.index
    }

    pub fn ledger(&self) -> &Arc<InMemoryAssignmentLedger> {
        &self.ledger
    }

    pub fn trust(&self) -> &Arc<InMemoryTrustLedger> {
        &self.trust
    }

    pub fn anomalies(&self) -> &Arc<InMemoryAnomalyLog> {
        &self.anomalies
    }

    /// Run until `shutdown` fires or a component fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        self.start(shutdown).await?.wait().await
    }

    /// Bind the gateway and spawn every component.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<RunningRuntime, RuntimeError> {
        let policy = self.config.broker.reconnect_policy();
        let instance = self.config.gateway.instance_id.clone();
        let mut tasks = JoinSet::new();

        let matching = Arc::new(matching_supervisor(self.connector.clone(), policy));
        let worker = Arc::new(MatchingWorker::new(
            self.index.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            self.config.matching.settings(),
        ));
        for _ in 0..self.config.matching.consumers {
            let supervisor = matching.clone();
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "matching", &instance, async move {
                run_consumer(&supervisor, &matching_subscription(), &*worker, &shutdown)
                    .await
                    .map_err(|source| RuntimeError::Channel {
                        component: "matching",
                        source,
                    })
            });
        }

        {
            let lifecycle = BookingLifecycle::new(self.ledger.clone());
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "booking lifecycle", &instance, async move {
                run_consumer(&matching, &lifecycle_subscription(), &lifecycle, &shutdown)
                    .await
                    .map_err(|source| RuntimeError::Channel {
                        component: "booking lifecycle",
                        source,
                    })
            });
        }

        let publisher = Arc::new(gateway_supervisor(self.connector.clone(), policy));
        let gateway = Arc::new(LocationGateway::new(
            self.index.clone(),
            self.rooms.clone(),
            publisher.clone(),
            Arc::new(ConfiguredVerifier::from_config(&self.config.gateway)),
            self.clock.clone(),
            self.config.gateway.settings(),
        ));
        let listener = GatewayListener::bind(&self.config.gateway.addr, gateway).await?;
        let gateway_addr = listener.local_addr().map_err(GatewayError::Io)?;
        {
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "gateway", &instance, async move {
                listener.run(shutdown).await.map_err(RuntimeError::from)
            });
        }

        {
            let relay = TripRelay::new(self.rooms.clone());
            let subscription = relay_subscription(&instance);
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "trip relay", &instance, async move {
                run_consumer(&publisher, &subscription, &relay, &shutdown)
                    .await
                    .map_err(|source| RuntimeError::Channel {
                        component: "trip relay",
                        source,
                    })
            });
        }

        let monitor = Arc::new(IntegrityMonitor::new(
            self.config.integrity.settings(),
            self.trust.clone(),
            self.anomalies.clone(),
            self.clock.clone(),
        ));
        {
            let supervisor = integrity_supervisor(self.connector.clone(), policy);
            let monitor = monitor.clone();
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "integrity", &instance, async move {
                run_consumer(&supervisor, &integrity_subscription(), &*monitor, &shutdown)
                    .await
                    .map_err(|source| RuntimeError::Channel {
                        component: "integrity",
                        source,
                    })
            });
        }

        {
            let index = self.index.clone();
            let ledger = self.ledger.clone();
            let interval = self.config.index.purge_interval();
            let claim_ttl = self.config.matching.claim_ttl();
            let retention = self.config.matching.settled_retention();
            let shutdown = shutdown.clone();
            spawn_component(&mut tasks, "maintenance", &instance, async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let entries = index.purge_expired();
                            let priors = monitor.purge_stale_priors();
                            let purged = ledger.purge(claim_ttl, retention);
                            if purged.released_workers > 0 {
                                warn!(
                                    workers = purged.released_workers,
                                    "claims expired without completion, drivers released"
                                );
                            }
                            debug!(
                                entries,
                                priors,
                                requests = purged.evicted_requests,
                                "expired state purged"
                            );
                        }
                    }
                }
                Ok(())
            });
        }

        info!(
            %gateway_addr,
            %instance,
            matching_consumers = self.config.matching.consumers,
            "dispatch runtime started"
        );
        Ok(RunningRuntime {
            gateway_addr,
            tasks,
            shutdown,
        })
    }
}

/// Spawn `task` inside a `component` span, tagged with its name.
fn spawn_component<F>(
    tasks: &mut JoinSet<ComponentResult>,
    component: &'static str,
    instance: &str,
    task: F,
) where
    F: Future<Output = Result<(), RuntimeError>> + Send + 'static,
{
    let span = info_span!("component", component, instance = %instance);
    tasks.spawn(async move { (component, task.await) }.instrument(span));
}

type ComponentResult = (&'static str, Result<(), RuntimeError>);

/// Handle on the spawned components of a started runtime.
pub struct RunningRuntime {
    gateway_addr: SocketAddr,
    tasks: JoinSet<ComponentResult>,
    shutdown: CancellationToken,
}

impl RunningRuntime {
    /// Address the gateway listener is bound to.
    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    /// Wait for every component to stop. The first failure cancels the rest
    /// and is returned once they have wound down.
    pub async fn wait(mut self) -> Result<(), RuntimeError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((component, Ok(()))) => {
                    info!(component, "component stopped");
                    None
                }
                Ok((component, Err(err))) => {
                    error!(component, error = %err, "component failed");
                    Some(err)
                }
                Err(join_error) => {
                    error!(error = %join_error, "component task aborted");
                    Some(RuntimeError::Task {
                        component: "unknown",
                        message: join_error.to_string(),
                    })
                }
            };
            if let Some(err) = failure {
                self.shutdown.cancel();
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
