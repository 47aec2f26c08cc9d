//! Settlement Rail Orchestrator
//!
//! Moves value across heterogeneous settlement rails under one lifecycle, gated by
//! the reserve guards.
//!
//! # Architecture
//!
//! 1. **Adapters**: every rail implements [`RailAdapter`] (`prepare`, `release`,
//!    `refund`, `status`) over a shared [`TransferBook`]
//! 2. **Registry**: [`RailRegistry`] maps a rail kind to its adapter
//! 3. **Orchestrator**: admits requests through the circuit breaker, compliance and
//!    rate limits, then drives single transfers and two-phase settlements
//! 4. **Confirmations**: asynchronous rails complete through the confirmation actor,
//!    which also refunds transfers whose confirmation never arrives
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, EngineServices, SettlementEngine};
//! use rail_core::collaborators::{DenyListCompliance, InMemoryLedger, InMemoryRoles};
//! use rail_core::{clock::system_clock, AccountId, AssetId, Principal, RailKind, Role, TransferRequest};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let services = EngineServices {
//!         ledger: Arc::new(InMemoryLedger::new().with_balance("alice", "USD", Decimal::from(500))),
//!         compliance: Arc::new(DenyListCompliance::new()),
//!         roles: Arc::new(InMemoryRoles::new().with_role("root", Role::Admin)),
//!         gateways: Default::default(),
//!         clock: system_clock(),
//!         bootstrap_admin: Principal::new("root"),
//!     };
//!     let engine = SettlementEngine::new(Config::default(), services)?;
//!
//!     let id = engine
//!         .orchestrator()
//!         .request_transfer(TransferRequest::new(
//!             RailKind::from_name("native"),
//!             AssetId::new("USD"),
//!             Decimal::from(100),
//!             AccountId::new("alice"),
//!             AccountId::new("bob"),
//!             1,
//!         ))
//!         .await?;
//!     println!("Settled {}", id);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod adapter;
pub mod book;
pub mod config;
pub mod confirmation;
pub mod engine;
pub mod error;
pub mod locks;
pub mod netting;
pub mod orchestrator;
pub mod rails;
pub mod registry;
pub mod types;

// Re-exports
pub use adapter::RailAdapter;
pub use book::{RailContext, TransferBook};
pub use config::Config;
pub use confirmation::{spawn_confirmation_actor, ConfirmationHandle, PendingQueue};
pub use engine::{EngineServices, RunningEngine, SettlementEngine};
pub use error::{Error, Result};
pub use netting::{NetSettlement, NettingEngine, NettingPlan};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig};
pub use registry::RailRegistry;
pub use types::*;
