//! Transaction events
//!
//! One record per study lifecycle transition, written to the transaction
//! log sink. Records carry the study key, the peer endpoint where one is
//! known, the outcome and the error kind on failure. Nothing
//! patient-identifying goes through here.

use serde::{Deserialize, Serialize};

/// Lifecycle transition record for the transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionEvent {
    /// First instance of a study arrived.
    ReceivingStarted {
        study: String,
        peer: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Watcher handed the study to a pipeline worker.
    ProcessingStart {
        study: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Pipeline produced the derived series.
    ProcessingSuccess {
        study: String,
        derived_instances: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Pipeline failed; study went to quarantine.
    ProcessingFailed {
        study: String,
        error_kind: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// All derived instances were accepted downstream.
    SendingSuccess {
        study: String,
        peer: String,
        instances: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Egress failed; study went to quarantine.
    SendingFailed {
        study: String,
        peer: String,
        error_kind: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Study directory removed after successful egress.
    StudyDeleted {
        study: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Study directory preserved under the quarantine subtree.
    StudyQuarantined {
        study: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl TransactionEvent {
    /// Stable record name as it appears in the transaction log.
    pub fn name(&self) -> &'static str {
        match self {
            TransactionEvent::ReceivingStarted { .. } => "RECEIVING_STARTED",
            TransactionEvent::ProcessingStart { .. } => "PROCESSING_START",
            TransactionEvent::ProcessingSuccess { .. } => "PROCESSING_SUCCESS",
            TransactionEvent::ProcessingFailed { .. } => "PROCESSING_FAILED",
            TransactionEvent::SendingSuccess { .. } => "SENDING_SUCCESS",
            TransactionEvent::SendingFailed { .. } => "SENDING_FAILED",
            TransactionEvent::StudyDeleted { .. } => "STUDY_DELETED",
            TransactionEvent::StudyQuarantined { .. } => "STUDY_QUARANTINED",
        }
    }

    pub fn study(&self) -> &str {
        match self {
            TransactionEvent::ReceivingStarted { study, .. }
            | TransactionEvent::ProcessingStart { study, .. }
            | TransactionEvent::ProcessingSuccess { study, .. }
            | TransactionEvent::ProcessingFailed { study, .. }
            | TransactionEvent::SendingSuccess { study, .. }
            | TransactionEvent::SendingFailed { study, .. }
            | TransactionEvent::StudyDeleted { study, .. }
            | TransactionEvent::StudyQuarantined { study, .. } => study,
        }
    }
}

/// Write one transaction record.
///
/// Serialised as a single JSON value inside the line so the transaction
/// file stays greppable by record name and study key.
pub fn record(event: &TransactionEvent) {
    let detail = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    tracing::info!(
        target: "transaction",
        study = %event.study(),
        detail = %detail,
        "{}",
        event.name()
    );
}
