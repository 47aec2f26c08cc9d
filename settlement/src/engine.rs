//! Settlement engine: wires configuration to running components
//!
//! Builds the guards, binds the configured rails and hands back an
//! [`Orchestrator`] plus the reserve feed. The external collaborators (ledger,
//! compliance, roles, gateways) are supplied by the caller.

use crate::{
    adapter::RailAdapter,
    book::RailContext,
    config::{Config, RailAdapterKind, RailConfig, StorageBackend, StorageConfig},
    confirmation::{spawn_confirmation_actor, ConfirmationHandle},
    orchestrator::{Collaborators, Orchestrator},
    rails::{AttestedRail, AttestedRailConfig, InMemoryGateway, NativeRail, RailGateway, TokenRail},
    registry::RailRegistry,
    Error, Result,
};
use rail_core::crypto::Domain;
use rail_core::{
    AccessControl, AssetLedger, ComplianceEvaluator, EventBus, MemoryStore, Metrics, Principal,
    RoleStore, SharedClock, TransferStore,
};
use reserve_guard::{AttestationRegistry, CircuitBreaker, CircuitId, LimitId, RateLimiter, ReserveFeed};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Collaborators owned by other systems
#[derive(Debug, Clone)]
pub struct EngineServices {
    /// Asset ledger
    pub ledger: Arc<dyn AssetLedger>,
    /// Compliance evaluator
    pub compliance: Arc<dyn ComplianceEvaluator>,
    /// Role store
    pub roles: Arc<dyn RoleStore>,
    /// Gateways for attested rails, by rail name
    pub gateways: HashMap<String, Arc<dyn RailGateway>>,
    /// Time source
    pub clock: SharedClock,
    /// Principal that performs startup configuration; must hold `Admin`
    pub bootstrap_admin: Principal,
}

/// Settlement engine
#[derive(Debug)]
pub struct SettlementEngine {
    config: Config,
    domain: Domain,
    orchestrator: Arc<Orchestrator>,
    attestations: Arc<AttestationRegistry>,
    feed: ReserveFeed,
    events: EventBus,
    metrics: Metrics,
}

/// Background tasks of a started engine
#[derive(Debug)]
pub struct RunningEngine {
    /// Confirmation actor handle
    pub confirmations: ConfirmationHandle,
    actor: JoinHandle<()>,
    feed: JoinHandle<()>,
}

impl RunningEngine {
    /// Stop background tasks
    pub async fn shutdown(self) -> Result<()> {
        self.feed.abort();
        self.confirmations.shutdown().await?;
        self.actor
            .await
            .map_err(|e| Error::Concurrency(format!("Confirmation actor failed: {}", e)))
    }
}

impl SettlementEngine {
    /// Create new settlement engine
    pub fn new(config: Config, services: EngineServices) -> Result<Self> {
        config.validate()?;

        let domain = config.domain.to_domain();
        let admin = services.bootstrap_admin.clone();
        let access = AccessControl::new(services.roles.clone());
        let clock = services.clock.clone();
        let events = EventBus::default();
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Metrics: {}", e)))?;

        let ctx = RailContext {
            store: open_store(&config.storage)?,
            clock: clock.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
        };

        let registry = Arc::new(RailRegistry::new(access.clone(), events.clone(), clock.clone()));
        for rail in &config.rails {
            let adapter = build_rail(rail, &domain, &services, ctx.clone())?;
            registry.set(&admin, adapter)?;
        }

        let breaker = Arc::new(CircuitBreaker::new(
            access.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
        ));
        for (id, definition) in &config.circuits {
            breaker.create_circuit(&admin, CircuitId::new(id.clone()), definition.clone())?;
        }

        let limiter = Arc::new(RateLimiter::new(
            access.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
        ));
        for (id, definition) in &config.rate_limits {
            limiter.create_limit(&admin, LimitId::new(id.clone()), definition.clone())?;
        }

        let attestations = Arc::new(AttestationRegistry::new(
            &domain,
            access.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let feed = ReserveFeed::new(attestations.clone(), breaker.clone());

        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.to_config(),
            Collaborators {
                registry,
                breaker,
                limiter,
                compliance: services.compliance.clone(),
                access,
                clock,
                events: events.clone(),
                metrics: metrics.clone(),
            },
        ));

        info!(
            service = %config.service_name,
            environment = %config.domain.environment,
            rails = config.rails.len(),
            circuits = config.circuits.len(),
            rate_limits = config.rate_limits.len(),
            "Settlement engine configured"
        );

        Ok(Self {
            config,
            domain,
            orchestrator,
            attestations,
            feed,
            events,
            metrics,
        })
    }

    /// Start the confirmation actor and the reserve feed
    pub fn start(&self) -> RunningEngine {
        let settings = &self.config.orchestrator;
        let (confirmations, actor) = spawn_confirmation_actor(
            self.orchestrator.clone(),
            settings.sweep_interval(),
            settings.mailbox_capacity,
        );
        let feed = self.feed.clone().spawn(settings.feed_interval());
        RunningEngine {
            confirmations,
            actor,
            feed,
        }
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Signing domain
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Attestation registry
    pub fn attestations(&self) -> &Arc<AttestationRegistry> {
        &self.attestations
    }

    /// Reserve feed
    pub fn feed(&self) -> &ReserveFeed {
        &self.feed
    }

    /// Event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Prometheus metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn open_store(config: &StorageConfig) -> Result<Arc<dyn TransferStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb")]
        StorageBackend::Rocksdb => Ok(Arc::new(rail_core::storage::RocksStore::open(
            config.data_dir.join("transfers"),
        )?)),
        #[cfg(not(feature = "rocksdb"))]
        StorageBackend::Rocksdb => Err(Error::Config(
            "rocksdb storage requires the `rocksdb` feature".to_string(),
        )),
    }
}

fn build_rail(
    rail: &RailConfig,
    domain: &Domain,
    services: &EngineServices,
    ctx: RailContext,
) -> Result<Arc<dyn RailAdapter>> {
    let ledger = services.ledger.clone();
    let adapter: Arc<dyn RailAdapter> = match rail.kind {
        RailAdapterKind::Native => Arc::new(NativeRail::new(&rail.name, ledger, ctx)),
        RailAdapterKind::Token => Arc::new(TokenRail::new(
            &rail.name,
            rail.allowed_assets.iter().cloned(),
            ledger,
            ctx,
        )?),
        RailAdapterKind::Attested => {
            let gateway: Arc<dyn RailGateway> = match services.gateways.get(&rail.name) {
                Some(gateway) => gateway.clone(),
                None => {
                    warn!(rail = %rail.name, "No gateway supplied, using in-memory gateway");
                    Arc::new(InMemoryGateway::new())
                }
            };
            Arc::new(AttestedRail::new(
                &rail.name,
                ledger,
                gateway,
                AttestedRailConfig {
                    relayer_key: rail.relayer_key_bytes()?,
                    domain_separator: domain.separator(),
                    confirmation_timeout: Duration::from_secs(rail.confirmation_timeout_secs),
                },
                ctx,
            ))
        }
    };
    Ok(adapter)
}
