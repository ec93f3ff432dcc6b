use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::ledger::{
    ActiveContract, LedgerClient, LedgerError, SubmitCommandRequest, SubmitCommandResponse,
};

/// Ledger JSON API client. Transport only; all protocol typing lives in
/// `commands.rs`.
pub struct HttpLedgerClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponseBody {
    transaction_id: String,
    new_contract_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveContractsBody {
    contracts: Vec<ActiveContract>,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, LedgerError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if response.status().is_client_error() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected(format!("{status}: {text}")));
        }
        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit_command(
        &self,
        request: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse, LedgerError> {
        debug!(
            command_id = %request.command_id,
            commands = request.commands.len(),
            "Submitting ledger command"
        );

        let response = self
            .post(
                "/v2/commands/submit-and-wait",
                serde_json::to_value(&request)
                    .map_err(|e| LedgerError::Payload(e.to_string()))?,
            )
            .await?;

        let body: SubmitResponseBody = response
            .json()
            .await
            .map_err(|e| LedgerError::Payload(e.to_string()))?;

        Ok(SubmitCommandResponse {
            transaction_id: body.transaction_id,
            new_contract_id: body.new_contract_id,
        })
    }

    async fn get_active_contracts(
        &self,
        template_id: &str,
        party: &str,
    ) -> Result<Vec<ActiveContract>, LedgerError> {
        let response = self
            .post(
                "/v2/state/active-contracts",
                json!({ "templateId": template_id, "party": party }),
            )
            .await?;

        let body: ActiveContractsBody = response
            .json()
            .await
            .map_err(|e| LedgerError::Payload(e.to_string()))?;

        Ok(body.contracts)
    }

    async fn get_contract(
        &self,
        contract_id: &str,
        party: &str,
    ) -> Result<Option<ActiveContract>, LedgerError> {
        let response = self
            .post(
                "/v2/state/contract",
                json!({ "contractId": contract_id, "party": party }),
            )
            .await;

        match response {
            Ok(response) => {
                let contract: Option<ActiveContract> = response
                    .json()
                    .await
                    .map_err(|e| LedgerError::Payload(e.to_string()))?;
                Ok(contract)
            }
            Err(LedgerError::Rejected(message)) if message.starts_with("404") => Ok(None),
            Err(e) => Err(e),
        }
    }
}
