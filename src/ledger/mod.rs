//! 分類結果の台帳（Ethereum互換チェーン）への記録
//!
//! 台帳は任意の協調者です。起動時に接続できなければ無効のまま動作し、
//! リクエスト中の失敗は結果ページの表示に反映されるだけで予測自体は返します。

pub mod contract;
pub mod eth;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::LedgerOutcome;

pub use contract::ContractDescriptor;
pub use eth::EthLedger;

/// 確定したトランザクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// `0x` 付き16進
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// 送信に失敗（ハッシュは得られていない）
    #[error("failed to submit transaction: {0}")]
    Submit(String),
    /// 送信済みだが確定を確認できなかった
    #[error("transaction {tx_hash} was not confirmed: {reason}")]
    Confirmation { tx_hash: String, reason: String },
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// `addRecord(filename, label)` を送り、確定まで待つ
    async fn add_record(&self, filename: &str, label: &str) -> Result<LedgerReceipt, LedgerError>;
}

/// 台帳への書き込みを試み、結果を表示用にまとめる。失敗はログに残すだけ
pub async fn record_best_effort(ledger: Option<&dyn Ledger>, filename: &str, label: &str) -> LedgerOutcome {
    let Some(ledger) = ledger else {
        return LedgerOutcome::disabled();
    };

    match ledger.add_record(filename, label).await {
        Ok(receipt) => {
            tracing::info!(
                filename,
                label,
                tx_hash = %receipt.tx_hash,
                block = receipt.block_number,
                "台帳に記録しました"
            );
            LedgerOutcome {
                tx_hash: Some(receipt.tx_hash),
                block_number: Some(receipt.block_number),
            }
        }
        Err(LedgerError::Confirmation { tx_hash, reason }) => {
            tracing::warn!(filename, tx_hash = %tx_hash, "台帳の確定を確認できませんでした: {}", reason);
            LedgerOutcome {
                tx_hash: Some(tx_hash),
                block_number: None,
            }
        }
        Err(e) => {
            tracing::error!(filename, "台帳への書き込みに失敗しました: {}", e);
            LedgerOutcome::disabled()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 呼び出しを記録し、決まった結果を返す台帳
    pub(crate) struct FakeLedger {
        pub calls: Mutex<Vec<(String, String)>>,
        pub result: fn() -> Result<LedgerReceipt, LedgerError>,
    }

    impl FakeLedger {
        pub(crate) fn new(result: fn() -> Result<LedgerReceipt, LedgerError>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result,
            }
        }

        pub(crate) fn confirmed() -> Self {
            Self::new(|| {
                Ok(LedgerReceipt {
                    tx_hash: "0x5e1f".to_string(),
                    block_number: 42,
                })
            })
        }
    }

    #[async_trait]
    impl Ledger for FakeLedger {
        async fn add_record(&self, filename: &str, label: &str) -> Result<LedgerReceipt, LedgerError> {
            self.calls
                .lock()
                .unwrap()
                .push((filename.to_string(), label.to_string()));
            (self.result)()
        }
    }

    #[tokio::test]
    async fn test_no_ledger_is_disabled() {
        let outcome = record_best_effort(None, "a.png", "TB").await;
        assert_eq!(outcome, LedgerOutcome::disabled());
    }

    #[tokio::test]
    async fn test_confirmed_record() {
        let ledger = FakeLedger::confirmed();
        let outcome = record_best_effort(Some(&ledger), "20240101120000_a.png", "normal").await;

        assert_eq!(outcome.tx_hash.as_deref(), Some("0x5e1f"));
        assert_eq!(outcome.block_number, Some(42));
        assert_eq!(
            *ledger.calls.lock().unwrap(),
            vec![("20240101120000_a.png".to_string(), "normal".to_string())]
        );
    }

    #[tokio::test]
    async fn test_submit_failure_looks_disabled() {
        let ledger = FakeLedger::new(|| Err(LedgerError::Submit("connection refused".to_string())));
        let outcome = record_best_effort(Some(&ledger), "a.png", "TB").await;
        assert_eq!(outcome.tx_hash_display(), "Blockchain disabled");
        assert_eq!(outcome.block_number_display(), "N/A");
    }

    #[tokio::test]
    async fn test_confirmation_failure_keeps_hash() {
        let ledger = FakeLedger::new(|| {
            Err(LedgerError::Confirmation {
                tx_hash: "0xdead".to_string(),
                reason: "timed out".to_string(),
            })
        });
        let outcome = record_best_effort(Some(&ledger), "a.png", "TB").await;
        assert_eq!(outcome.tx_hash_display(), "0xdead");
        assert_eq!(outcome.block_number_display(), "N/A");
    }
}
