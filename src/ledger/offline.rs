use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::{
    ActiveContract, LedgerClient, LedgerError, SubmitCommandRequest, SubmitCommandResponse,
};

/// Façade for running without a ledger. Submissions succeed with synthetic
/// transaction and contract ids; queries return nothing. Deterministic enough
/// for local development and tests.
pub struct OfflineLedgerClient;

#[async_trait]
impl LedgerClient for OfflineLedgerClient {
    async fn submit_command(
        &self,
        request: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse, LedgerError> {
        debug!(
            command_id = %request.command_id,
            "Offline ledger: accepting command with synthetic result"
        );

        Ok(SubmitCommandResponse {
            transaction_id: format!("offline-tx-{}", Uuid::new_v4()),
            new_contract_id: Some(format!("offline-cid-{}", Uuid::new_v4())),
        })
    }

    async fn get_active_contracts(
        &self,
        _template_id: &str,
        _party: &str,
    ) -> Result<Vec<ActiveContract>, LedgerError> {
        Ok(Vec::new())
    }

    async fn get_contract(
        &self,
        _contract_id: &str,
        _party: &str,
    ) -> Result<Option<ActiveContract>, LedgerError> {
        Ok(None)
    }

    fn is_offline(&self) -> bool {
        true
    }
}
