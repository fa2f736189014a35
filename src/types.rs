use serde::{Deserialize, Serialize};

/// 1枚の画像に対する分類結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub probabilities: Vec<f32>,
}

// 結果ページでの表示
pub const LEDGER_DISABLED: &str = "Blockchain disabled";
pub const BLOCK_UNAVAILABLE: &str = "N/A";

/// 台帳書き込みの結果（失敗しても予測結果は返す）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
}

impl LedgerOutcome {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn tx_hash_display(&self) -> &str {
        self.tx_hash.as_deref().unwrap_or(LEDGER_DISABLED)
    }

    pub fn block_number_display(&self) -> String {
        self.block_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| BLOCK_UNAVAILABLE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_outcome_sentinels() {
        let disabled = LedgerOutcome::disabled();
        assert_eq!(disabled.tx_hash_display(), "Blockchain disabled");
        assert_eq!(disabled.block_number_display(), "N/A");

        let unconfirmed = LedgerOutcome {
            tx_hash: Some("0xabc".to_string()),
            block_number: None,
        };
        assert_eq!(unconfirmed.tx_hash_display(), "0xabc");
        assert_eq!(unconfirmed.block_number_display(), "N/A");

        let confirmed = LedgerOutcome {
            tx_hash: Some("0xabc".to_string()),
            block_number: Some(17),
        };
        assert_eq!(confirmed.block_number_display(), "17");
    }
}
