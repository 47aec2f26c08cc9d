//! Asynchronous confirmations
//!
//! Transfers on asynchronous rails wait in a [`PendingQueue`] after `prepare`. A single
//! confirmation actor owns the completion path:
//!
//! ```text
//! relayer callbacks ──▶ ConfirmationHandle (Clone)
//!                               │ mpsc (bounded)
//!                               ▼
//!                      ConfirmationActor (one task)
//!                        ├─ Confirm  → Orchestrator::confirm
//!                        ├─ Sweep    → Orchestrator::expire_pending
//!                        └─ interval → Orchestrator::expire_pending
//! ```

use crate::{
    orchestrator::Orchestrator,
    types::{Confirmation, PendingTransfer},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rail_core::{TransferId, TransferStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Transfers waiting for a confirmation, keyed by transfer ID
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<HashMap<TransferId, PendingTransfer>>,
}

impl PendingQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry
    pub fn insert(&self, pending: PendingTransfer) {
        self.entries.lock().insert(pending.transfer_id, pending);
    }

    /// Remove an entry
    pub fn remove(&self, id: &TransferId) -> Option<PendingTransfer> {
        self.entries.lock().remove(id)
    }

    /// Look up an entry
    pub fn get(&self, id: &TransferId) -> Option<PendingTransfer> {
        self.entries.lock().get(id).cloned()
    }

    /// Entries whose deadline has passed, oldest first
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<PendingTransfer> {
        let mut expired: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|pending| pending.deadline <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|pending| (pending.deadline, pending.transfer_id));
        expired
    }

    /// All entries
    pub fn snapshot(&self) -> Vec<PendingTransfer> {
        self.entries.lock().values().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Message sent to the confirmation actor
#[derive(Debug)]
pub enum ConfirmationMessage {
    /// Apply a confirmation
    Confirm {
        /// Relayer callback
        confirmation: Confirmation,
        /// Resulting transfer status
        response: oneshot::Sender<Result<TransferStatus>>,
    },

    /// Expire overdue transfers now
    Sweep {
        /// Number of transfers expired
        response: oneshot::Sender<usize>,
    },

    /// Stop the actor
    Shutdown,
}

/// Actor that completes asynchronous transfers
#[derive(Debug)]
pub struct ConfirmationActor {
    orchestrator: Arc<Orchestrator>,
    mailbox: mpsc::Receiver<ConfirmationMessage>,
    sweep_interval: Duration,
}

impl ConfirmationActor {
    /// Create new actor
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        mailbox: mpsc::Receiver<ConfirmationMessage>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            mailbox,
            sweep_interval,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(ConfirmationMessage::Shutdown) | None => break,
                        Some(msg) => self.handle_message(msg).await,
                    }
                }

                _ = sweep.tick() => {
                    let expired = self.orchestrator.expire_pending().await;
                    if expired > 0 {
                        debug!(expired, "Sweep refunded overdue transfers");
                    }
                }
            }
        }

        info!(
            pending = self.orchestrator.pending().len(),
            "Confirmation actor stopped"
        );
    }

    async fn handle_message(&self, msg: ConfirmationMessage) {
        match msg {
            ConfirmationMessage::Confirm {
                confirmation,
                response,
            } => {
                let id = confirmation.transfer_id;
                let result = self.orchestrator.confirm(confirmation).await;
                if let Err(e) = &result {
                    error!(transfer_id = %id, error = %e, "Confirmation rejected");
                }
                let _ = response.send(result);
            }

            ConfirmationMessage::Sweep { response } => {
                let _ = response.send(self.orchestrator.expire_pending().await);
            }

            ConfirmationMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct ConfirmationHandle {
    sender: mpsc::Sender<ConfirmationMessage>,
}

impl ConfirmationHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ConfirmationMessage>) -> Self {
        Self { sender }
    }

    /// Deliver a confirmation and wait for its result
    pub async fn confirm(&self, confirmation: Confirmation) -> Result<TransferStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConfirmationMessage::Confirm {
                confirmation,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Expire overdue transfers immediately
    pub async fn sweep(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConfirmationMessage::Sweep { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ConfirmationMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the confirmation actor
pub fn spawn_confirmation_actor(
    orchestrator: Arc<Orchestrator>,
    sweep_interval: Duration,
    mailbox_capacity: usize,
) -> (ConfirmationHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = ConfirmationActor::new(orchestrator, rx, sweep_interval);
    let task = tokio::spawn(actor.run());
    (ConfirmationHandle::new(tx), task)
}
