//! Send loop — one invocation delivers a message to its outstanding recipients
//! over a single channel connection.
//!
//! Recipients already marked SENT in the ledger are skipped, so running the
//! loop again after a partial run never sends twice.

use courier_core::error::{DispatchFailure, SendError};
use courier_core::traits::{Account, ChannelFactory, SendChannel};
use std::path::Path;

use crate::ledger::Ledger;
use crate::message::{Recipient, ScheduledMessage};

/// What one loop invocation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopReport {
    /// Recipients sent in this invocation.
    pub sent: Vec<i64>,
    /// Recipients that already had a SENT entry.
    pub skipped: Vec<i64>,
    /// Recipients the provider rejected, with the reason.
    pub failed: Vec<(i64, String)>,
}

impl LoopReport {
    /// No recipient in this pass was rejected. Recipients attached after the
    /// pass started are not covered; check the ledger for that.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Summary of rejected recipients for `last_error`.
    pub fn failure_summary(&self) -> String {
        let details: Vec<String> = self
            .failed
            .iter()
            .map(|(id, err)| format!("recipient {id}: {err}"))
            .collect();
        format!("{} recipient(s) failed ({})", self.failed.len(), details.join("; "))
    }
}

/// Run the send loop for `message` against `recipients` (stable id order).
///
/// The connection is released on every exit path.
pub async fn run_send_loop(
    factory: &dyn ChannelFactory,
    ledger: &Ledger,
    account: &Account,
    message: &ScheduledMessage,
    recipients: &[Recipient],
) -> Result<LoopReport, DispatchFailure> {
    let mut channel = factory.open(account)?;

    if let Err(e) = channel.connect().await {
        let _ = channel.disconnect().await;
        tracing::warn!("Connect failed for account {}: {e}", account.name);
        return Err(e.into());
    }

    let result = send_all(&*channel, ledger, message, recipients).await;

    if let Err(e) = channel.disconnect().await {
        tracing::debug!("Disconnect after message {} failed: {e}", message.id);
    }
    result
}

async fn send_all(
    channel: &dyn SendChannel,
    ledger: &Ledger,
    message: &ScheduledMessage,
    recipients: &[Recipient],
) -> Result<LoopReport, DispatchFailure> {
    let mut report = LoopReport::default();
    let attachment = message.attachment.as_deref().map(Path::new);

    for recipient in recipients {
        if ledger.is_delivered(message.id, recipient.id)? {
            report.skipped.push(recipient.id);
            continue;
        }

        match channel.send_message(&recipient.handle, &message.text, attachment).await {
            Ok(()) => {
                ledger.record_sent(message.id, recipient.id)?;
                tracing::info!(
                    "📨 Message {} sent to {} via {}",
                    message.id,
                    recipient.handle,
                    channel.name()
                );
                report.sent.push(recipient.id);
            }
            Err(SendError::Rejected(reason)) => {
                ledger.record_failed(message.id, recipient.id, &reason)?;
                tracing::warn!("Message {} to {} rejected: {reason}", message.id, recipient.handle);
                report.failed.push((recipient.id, reason));
            }
            // The rest of the recipients wait for the next invocation.
            Err(SendError::FloodWait { seconds }) => {
                return Err(DispatchFailure::RateLimited { seconds });
            }
            Err(e @ SendError::Disconnected(_)) => {
                ledger.record_failed(message.id, recipient.id, &e.to_string())?;
                return Err(e.into());
            }
            Err(e @ SendError::Unauthorized(_)) => return Err(e.into()),
        }
    }

    Ok(report)
}
