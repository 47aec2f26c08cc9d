//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for the settlement pipeline.
//!
//! # Metrics
//!
//! - `settlement_transfers_prepared_total` - Transfers reserved on a rail
//! - `settlement_transfers_released_total` - Transfers finalized
//! - `settlement_transfers_refunded_total` - Reservations reversed
//! - `settlement_limit_rejections_total` - Rate-limit rejections
//! - `settlement_circuit_transitions_total` - Circuit state changes
//! - `settlement_attestations_accepted_total` - Signed attestations stored
//! - `settlement_pending_transfers` - Transfers awaiting external confirmation
//!
//! Each [`Metrics`] owns its registry, so several instances can coexist in one process.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Transfers prepared
    pub transfers_prepared: IntCounter,

    /// Transfers released
    pub transfers_released: IntCounter,

    /// Transfers refunded
    pub transfers_refunded: IntCounter,

    /// Rate-limit rejections
    pub limit_rejections: IntCounter,

    /// Circuit transitions
    pub circuit_transitions: IntCounter,

    /// Attestations accepted
    pub attestations_accepted: IntCounter,

    /// Transfers awaiting confirmation
    pub pending_transfers: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_prepared = IntCounter::new(
            "settlement_transfers_prepared_total",
            "Transfers reserved on a rail",
        )?;
        registry.register(Box::new(transfers_prepared.clone()))?;

        let transfers_released = IntCounter::new(
            "settlement_transfers_released_total",
            "Transfers finalized",
        )?;
        registry.register(Box::new(transfers_released.clone()))?;

        let transfers_refunded = IntCounter::new(
            "settlement_transfers_refunded_total",
            "Reservations reversed",
        )?;
        registry.register(Box::new(transfers_refunded.clone()))?;

        let limit_rejections = IntCounter::new(
            "settlement_limit_rejections_total",
            "Rate-limit rejections",
        )?;
        registry.register(Box::new(limit_rejections.clone()))?;

        let circuit_transitions = IntCounter::new(
            "settlement_circuit_transitions_total",
            "Circuit state changes",
        )?;
        registry.register(Box::new(circuit_transitions.clone()))?;

        let attestations_accepted = IntCounter::new(
            "settlement_attestations_accepted_total",
            "Signed attestations stored",
        )?;
        registry.register(Box::new(attestations_accepted.clone()))?;

        let pending_transfers = IntGauge::new(
            "settlement_pending_transfers",
            "Transfers awaiting external confirmation",
        )?;
        registry.register(Box::new(pending_transfers.clone()))?;

        Ok(Self {
            transfers_prepared,
            transfers_released,
            transfers_refunded,
            limit_rejections,
            circuit_transitions,
            attestations_accepted,
            pending_transfers,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
