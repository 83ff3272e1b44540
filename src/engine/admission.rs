use crate::types::TransactionEvent;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject(String),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Decides which events reach the detector. Rejection is an expected outcome, not an error.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(&self, event: &TransactionEvent) -> AdmissionDecision;
}

/// Admits every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl AdmissionGate for AcceptAll {
    async fn admit(&self, _event: &TransactionEvent) -> AdmissionDecision {
        AdmissionDecision::Admit
    }
}

/// Rejects zero-value transfers and self transfers that carry no method call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipTrivialTransfers;

#[async_trait]
impl AdmissionGate for SkipTrivialTransfers {
    async fn admit(&self, event: &TransactionEvent) -> AdmissionDecision {
        if event.method.is_some() {
            return AdmissionDecision::Admit;
        }
        if event.sender == event.receiver {
            return AdmissionDecision::Reject("self transfer".to_string());
        }
        if event.amount.is_zero() {
            return AdmissionDecision::Reject("zero amount".to_string());
        }
        AdmissionDecision::Admit
    }
}
