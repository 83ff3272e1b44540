use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum_macros::{Display, EnumString};

/// Method metadata attached to events that invoke a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub selector: [u8; 4],
    pub name: Option<String>,
}

/// A transfer observed on chain, as delivered by the upstream event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub hash: B256,
    pub sender: Address,
    pub receiver: Address,
    /// Token contract, `Address::ZERO` for the native asset
    pub asset: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub method: Option<MethodCall>,
}

impl TransactionEvent {
    pub fn new(sender: Address, receiver: Address, amount: U256, block_number: u64, timestamp: u64) -> Self {
        Self {
            hash: B256::ZERO,
            sender,
            receiver,
            asset: Address::ZERO,
            amount,
            block_number,
            timestamp,
            method: None,
        }
    }

    pub fn with_hash(mut self, hash: B256) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_asset(mut self, asset: Address) -> Self {
        self.asset = asset;
        self
    }

    pub fn with_method(mut self, method: MethodCall) -> Self {
        self.method = Some(method);
        self
    }
}

/// Row kinds of the raw transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum TransactionKind {
    Transfer,
    ContractTransaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: u64,
    pub hash: B256,
    pub sender: Address,
    pub receiver: Address,
    pub asset: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: u64,
    pub processed: bool,
}

impl Transfer {
    /// Row for an admitted event. The id is assigned by the store on insert.
    pub fn from_event(event: &TransactionEvent) -> Self {
        Self {
            id: 0,
            hash: event.hash,
            sender: event.sender,
            receiver: event.receiver,
            asset: event.asset,
            amount: event.amount,
            block_number: event.block_number,
            timestamp: event.timestamp,
            processed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTransaction {
    pub id: u64,
    pub hash: B256,
    pub sender: Address,
    pub contract: Address,
    pub selector: [u8; 4],
    pub method_name: Option<String>,
    pub block_number: u64,
    pub timestamp: u64,
    pub processed: bool,
}

impl ContractTransaction {
    pub fn from_event(event: &TransactionEvent) -> Option<Self> {
        let method = event.method.as_ref()?;
        Some(Self {
            id: 0,
            hash: event.hash,
            sender: event.sender,
            contract: event.receiver,
            selector: method.selector,
            method_name: method.name.clone(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            processed: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.9 => Severity::Critical,
            s if s >= 0.8 => Severity::High,
            s if s >= 0.7 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// Output record for a cluster created or extended by a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub cluster_id: u64,
    pub members: BTreeSet<Address>,
    pub evidence: String,
    pub severity: Severity,
}
