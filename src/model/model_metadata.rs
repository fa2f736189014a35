//! モデルアーティファクトのメタデータ
//!
//! tar.gz 内の `metadata.json` として保存されます。
//! トポロジを丸ごと埋め込むので、推論側はこのファイルだけでネットワークを再構築できます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::topology::Topology;

/// アーティファクトのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// ネットワーク構成（入力形状とラベル表を含む）
    pub topology: Topology,

    /// 学習可能パラメータ数
    pub num_params: usize,

    /// 取り込んだ重みファイル名
    pub source_weights: String,

    /// 作成時刻（RFC3339）
    pub created_at: String,
}

impl ArtifactMetadata {
    pub fn new(topology: Topology, num_params: usize, source_weights: impl Into<String>) -> Self {
        Self {
            topology,
            num_params,
            source_weights: source_weights.into(),
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
