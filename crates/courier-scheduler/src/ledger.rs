//! Delivery ledger: durable per-recipient outcomes, the basis for resuming a
//! partially sent message without sending twice.

use courier_core::error::Result;
use std::sync::Arc;

use crate::message::{DeliveryStatus, LedgerEntry, Recipient};
use crate::persistence::DispatchDb;

#[derive(Clone)]
pub struct Ledger {
    db: Arc<DispatchDb>,
}

impl Ledger {
    pub fn new(db: Arc<DispatchDb>) -> Self {
        Self { db }
    }

    pub fn is_delivered(&self, message_id: i64, recipient_id: i64) -> Result<bool> {
        self.db.is_delivered(message_id, recipient_id)
    }

    /// Record a successful send. Recording the same pair twice keeps one entry.
    pub fn record_sent(&self, message_id: i64, recipient_id: i64) -> Result<()> {
        if !self.db.insert_ledger(message_id, recipient_id, DeliveryStatus::Sent, None)? {
            tracing::debug!("Ledger already has SENT for message {message_id} → {recipient_id}");
        }
        Ok(())
    }

    pub fn record_failed(&self, message_id: i64, recipient_id: i64, error: &str) -> Result<()> {
        self.db
            .insert_ledger(message_id, recipient_id, DeliveryStatus::Failed, Some(error))?;
        Ok(())
    }

    pub fn entries(&self, message_id: i64) -> Result<Vec<LedgerEntry>> {
        self.db.ledger_entries(message_id)
    }

    /// Attached recipients that have no SENT entry yet, in id order.
    pub fn outstanding(&self, message_id: i64) -> Result<Vec<Recipient>> {
        let delivered = self.db.delivered_recipients(message_id)?;
        Ok(self
            .db
            .message_recipients(message_id)?
            .into_iter()
            .filter(|r| !delivered.contains(&r.id))
            .collect())
    }
}
