//! Ledger Client Façade
//!
//! Abstract interface to the external UTXO ledger. Every mutation archives
//! the contract it exercises and creates a successor with a fresh contract
//! id, so callers must refresh contract ids before each exercise.

pub mod commands;
mod http;
mod offline;

pub use http::HttpLedgerClient;
pub use offline::OfflineLedgerClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger rejected command: {0}")]
    Rejected(String),

    #[error("contract not found: {0}")]
    ContractNotFound(String),

    #[error("malformed ledger payload: {0}")]
    Payload(String),
}

/// A command against a ledger template: create a contract or exercise a
/// choice on an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerCommand {
    #[serde(rename_all = "camelCase")]
    Create { template_id: String, payload: Value },
    #[serde(rename_all = "camelCase")]
    Exercise {
        template_id: String,
        contract_id: String,
        choice: String,
        argument: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandRequest {
    /// Client identifier forwarded to the ledger.
    pub user_id: String,
    /// Caller-generated idempotency token.
    pub command_id: String,
    pub act_as: Vec<String>,
    pub read_as: Vec<String>,
    pub commands: Vec<LedgerCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandResponse {
    pub transaction_id: String,
    /// Contract id created by the command, when the ledger reports one.
    pub new_contract_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveContract {
    pub contract_id: String,
    pub payload: Value,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit_command(
        &self,
        request: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse, LedgerError>;

    async fn get_active_contracts(
        &self,
        template_id: &str,
        party: &str,
    ) -> Result<Vec<ActiveContract>, LedgerError>;

    async fn get_contract(
        &self,
        contract_id: &str,
        party: &str,
    ) -> Result<Option<ActiveContract>, LedgerError>;

    /// True when the façade returns synthetic results instead of talking to
    /// a ledger. Callers may skip authoritative verification in that mode.
    fn is_offline(&self) -> bool {
        false
    }
}
