//! Custodial Wallet Provider
//!
//! HTTP client for the external custodial wallet service funds leave through.
//! Supports mock mode for local development without a live provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::Wallet;
use crate::store::Store;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderError {
    /// HTTP request failed
    RequestFailed(String),
    /// Provider answered with something we could not read
    InvalidResponse(String),
    /// Provider refused the operation
    Rejected(String),
    Timeout,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::RequestFailed(msg) => write!(f, "provider request failed: {}", msg),
            ProviderError::InvalidResponse(msg) => write!(f, "invalid provider response: {}", msg),
            ProviderError::Rejected(msg) => write!(f, "provider rejected request: {}", msg),
            ProviderError::Timeout => write!(f, "provider call timed out"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        EngineError::ExternalService(e.to_string())
    }
}

// ============================================================================
// REQUEST/RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletResponse {
    pub wallet_id: String,
    pub address: String,
}

/// A provisioned custodial wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodialWallet {
    pub wallet_id: String,
    /// On-chain deposit address
    pub address: String,
}

impl From<CreateWalletResponse> for CustodialWallet {
    fn from(r: CreateWalletResponse) -> Self {
        Self { wallet_id: r.wallet_id, address: r.address }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub source_wallet_id: String,
    pub destination_address: String,
    /// Micro-USDC
    pub amount: u64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReferenceResponse {
    pub transaction_hash: Option<String>,
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

#[async_trait]
pub trait CustodialWalletProvider: Send + Sync {
    /// Create a custodial wallet; returns its provider id and deposit address
    async fn create_user_wallet(&self, user_id: &str) -> Result<CustodialWallet, ProviderError>;

    /// Start a transfer; returns the provider's transfer id
    async fn send_funds(&self, request: &TransferRequest) -> Result<String, ProviderError>;

    /// On-chain reference for a transfer
    async fn get_transaction_reference(&self, transfer_id: &str) -> Result<String, ProviderError>;
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

pub struct CustodialClient {
    endpoint_url: Option<String>,
    api_key: Option<String>,
    client: Client,
    /// Whether we're in mock mode (no provider configured)
    mock_mode: bool,
}

impl CustodialClient {
    pub fn new(endpoint_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let mock_mode = endpoint_url.is_none();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        CustodialClient {
            endpoint_url: endpoint_url.map(|u| u.trim_end_matches('/').to_string()),
            api_key,
            client,
            mock_mode,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.provider_url.clone(),
            config.provider_api_key.clone(),
            Duration::from_secs(config.provider_timeout_secs),
        )
    }

    pub fn is_mock_mode(&self) -> bool {
        self.mock_mode
    }

    /// Log connection status (call on startup)
    pub fn log_status(&self) {
        match &self.endpoint_url {
            None => {
                println!("⚠️  Custody provider: Mock mode (CUSTODY_PROVIDER_URL not set)");
                println!("   Transfers will be acknowledged locally");
            }
            Some(url) => println!("🔗 Custody provider: {}", url),
        }
    }

    fn url(&self, path: &str) -> Result<String, ProviderError> {
        self.endpoint_url
            .as_ref()
            .map(|base| format!("{}{}", base, path))
            .ok_or_else(|| ProviderError::RequestFailed("provider URL not configured".into()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn read<R: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<R, ProviderError> {
        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(ProviderError::RequestFailed(format!("provider returned status {}", status)));
        }
        response.json().await.map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::RequestFailed(e.to_string())
    }
}

#[async_trait]
impl CustodialWalletProvider for CustodialClient {
    async fn create_user_wallet(&self, user_id: &str) -> Result<CustodialWallet, ProviderError> {
        if self.mock_mode {
            let digest = Sha256::digest(user_id.as_bytes());
            return Ok(CustodialWallet {
                wallet_id: format!("cw_{}", Uuid::new_v4().simple()),
                address: format!("0x{}", hex::encode(&digest[..20])),
            });
        }
        let body = CreateWalletRequest { user_id: user_id.to_string() };
        let response = self
            .authorize(self.client.post(self.url("/wallets")?))
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let created: CreateWalletResponse = Self::read(response).await?;
        if created.address.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("wallet created without a deposit address".into()));
        }
        Ok(created.into())
    }

    async fn send_funds(&self, request: &TransferRequest) -> Result<String, ProviderError> {
        if self.mock_mode {
            return Ok(format!("mock_tx_{}", request.idempotency_key));
        }
        let response = self
            .authorize(self.client.post(self.url("/transfers")?))
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(request)
            .send()
            .await
            .map_err(request_error)?;
        let transfer: TransferResponse = Self::read(response).await?;
        Ok(transfer.transfer_id)
    }

    async fn get_transaction_reference(&self, transfer_id: &str) -> Result<String, ProviderError> {
        if self.mock_mode {
            return Ok(format!("0x{}", hex::encode(Sha256::digest(transfer_id.as_bytes()))));
        }
        let path = format!("/transfers/{}/reference", transfer_id);
        let response = self
            .authorize(self.client.get(self.url(&path)?))
            .send()
            .await
            .map_err(request_error)?;
        let reference: TransferReferenceResponse = Self::read(response).await?;
        // Providers may not have a hash yet; the transfer id is still a usable reference
        Ok(reference.transaction_hash.unwrap_or_else(|| transfer_id.to_string()))
    }
}

// ============================================================================
// WALLET PROVISIONING
// ============================================================================

/// Make sure `user_id` has a ledger wallet backed by a custodial wallet
pub async fn provision_wallet(
    store: &Store,
    config: &EngineConfig,
    provider: &dyn CustodialWalletProvider,
    user_id: &str,
) -> EngineResult<Wallet> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Validation("user id is required".into()));
    }
    if let Some(wallet) = store.get::<Wallet>(&user_id.to_string()).await {
        if wallet.provider_wallet_id.is_some() {
            return Ok(wallet);
        }
    }

    let custodial = provider.create_user_wallet(user_id).await?;

    if store.get::<Wallet>(&user_id.to_string()).await.is_none() {
        let wallet = Wallet::new(&format!("w_{}", Uuid::new_v4().simple()), user_id, 0);
        match store.create_wallet(wallet) {
            Ok(()) | Err(EngineError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let wallet = store
        .transaction(&config.transaction_retry, |tx| {
            let mut wallet = tx.lock::<Wallet>(&user_id.to_string())?;
            if wallet.provider_wallet_id.is_none() {
                wallet.provider_wallet_id = Some(custodial.wallet_id.clone());
                wallet.public_key = custodial.address.clone();
                tx.update(wallet.clone())?;
            }
            Ok(wallet)
        })
        .await?;

    tracing::info!(
        user_id,
        provider_wallet_id = ?wallet.provider_wallet_id,
        address = %wallet.public_key,
        "wallet provisioned"
    );
    Ok(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_mode_round_trip() {
        let client = CustodialClient::new(None, None, Duration::from_secs(1));
        assert!(client.is_mock_mode());

        let request = TransferRequest {
            source_wallet_id: "treasury".into(),
            destination_address: "0xabc".into(),
            amount: 5,
            idempotency_key: "k1".into(),
        };
        let transfer = client.send_funds(&request).await.unwrap();
        assert_eq!(transfer, "mock_tx_k1");
        let reference = client.get_transaction_reference(&transfer).await.unwrap();
        assert!(reference.starts_with("0x"));
        assert_eq!(reference.len(), 66);
    }

    #[tokio::test]
    async fn test_provision_wallet_is_idempotent() {
        let store = Store::new();
        let config = EngineConfig::default();
        let client = CustodialClient::new(None, None, Duration::from_secs(1));

        let first = provision_wallet(&store, &config, &client, "alice").await.unwrap();
        let second = provision_wallet(&store, &config, &client, "alice").await.unwrap();
        assert!(first.provider_wallet_id.is_some());
        assert_eq!(first.provider_wallet_id, second.provider_wallet_id);
        assert_eq!(first.id, second.id);
        assert!(first.public_key.starts_with("0x"));
        assert_eq!(first.public_key.len(), 42);
        assert_eq!(second.public_key, first.public_key);

        let stored = store.require::<Wallet>(&"alice".to_string()).await.unwrap();
        assert_eq!(stored.public_key, first.public_key);
    }

    #[test]
    fn test_provider_errors_map_to_external_service() {
        let err: EngineError = ProviderError::Timeout.into();
        assert!(matches!(err, EngineError::ExternalService(_)));
        assert!(!err.is_transient());
    }
}
