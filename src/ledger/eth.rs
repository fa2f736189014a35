//! JSON-RPC 経由で Ethereum 互換ノードに記録を送る台帳

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::prelude::abigen;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;

use crate::ledger::{ContractDescriptor, Ledger, LedgerError, LedgerReceipt};
use crate::model::LedgerSettings;

abigen!(
    RecordsContract,
    r"[
        function addRecord(string filename, string label)
    ]"
);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EthLedger<M = Provider<Http>> {
    contract: RecordsContract<M>,
    sender: Address,
    gas_limit: u64,
    legacy: bool,
    receipt_timeout: Option<Duration>,
}

impl EthLedger {
    /// ノードに接続し、コントラクトと送信元アカウントを決める
    pub async fn connect(settings: &LedgerSettings) -> Result<Self> {
        let provider = Provider::<Http>::try_from(settings.rpc_url.as_str())
            .with_context(|| format!("Invalid RPC URL: {}", settings.rpc_url))?
            .interval(Duration::from_millis(settings.poll_interval_ms));
        Self::with_client(provider, settings).await
    }
}

impl<M: Middleware + 'static> EthLedger<M> {
    /// 接続済みのクライアントから台帳を組み立てる
    ///
    /// チェーンIDで疎通を確かめてから、コントラクトの成果物を読み、送信元を決めます。
    pub async fn with_client(client: M, settings: &LedgerSettings) -> Result<Self> {
        let chain_id = tokio::time::timeout(PROBE_TIMEOUT, client.get_chainid())
            .await
            .with_context(|| format!("Ledger node at {} did not answer", settings.rpc_url))?
            .map_err(|e| anyhow!("Ledger node at {} is unreachable: {}", settings.rpc_url, e))?;

        let descriptor = ContractDescriptor::load(&settings.contract_path)?;

        let sender = match &settings.from_account {
            Some(account) => account
                .parse::<Address>()
                .with_context(|| format!("Invalid from_account: {}", account))?,
            None => client
                .get_accounts()
                .await
                .map_err(|e| anyhow!("Failed to list node accounts: {}", e))?
                .first()
                .copied()
                .context("Ledger node has no unlocked accounts")?,
        };

        tracing::info!(
            chain_id = %chain_id,
            network = %descriptor.network_id,
            contract = ?descriptor.address,
            sender = ?sender,
            "台帳に接続しました"
        );

        Ok(Self {
            contract: RecordsContract::new(descriptor.address, Arc::new(client)),
            sender,
            gas_limit: settings.gas_limit,
            legacy: settings.legacy_transactions,
            receipt_timeout: settings.receipt_timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn sender(&self) -> Address {
        self.sender
    }
}

#[async_trait]
impl<M: Middleware + 'static> Ledger for EthLedger<M> {
    async fn add_record(&self, filename: &str, label: &str) -> Result<LedgerReceipt, LedgerError> {
        let mut call = self
            .contract
            .add_record(filename.to_string(), label.to_string())
            .from(self.sender)
            .gas(self.gas_limit);
        if self.legacy {
            call = call.legacy();
        }

        let pending = call
            .send()
            .await
            .map_err(|e| LedgerError::Submit(e.to_string()))?;
        let tx_hash = format!("{:#x}", pending.tx_hash());
        tracing::debug!(tx_hash = %tx_hash, "トランザクションを送信しました");

        let confirmation_error = |reason: String| LedgerError::Confirmation {
            tx_hash: tx_hash.clone(),
            reason,
        };

        let result = match self.receipt_timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending)
                .await
                .map_err(|_| confirmation_error(format!("no receipt within {}s", timeout.as_secs())))?,
            None => pending.await,
        };
        let receipt = result
            .map_err(|e| confirmation_error(e.to_string()))?
            .ok_or_else(|| confirmation_error("transaction was dropped from the mempool".to_string()))?;
        let block_number = receipt
            .block_number
            .ok_or_else(|| confirmation_error("receipt has no block number".to_string()))?
            .as_u64();

        Ok(LedgerReceipt {
            tx_hash,
            block_number,
        })
    }
}
