//! アーティファクトのメタデータから推論に必要な情報を取り出す
//!
//! ラベル表と入力形状だけを持ちます。

use crate::ml::topology::InputShape;
use crate::model::model_metadata::ArtifactMetadata;

/// 推論設定
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラスラベル（インデックス順、空文字列も含めてそのまま保持）
    pub class_labels: Vec<String>,

    /// モデル入力形状
    pub input: InputShape,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ArtifactMetadata) -> Self {
        Self {
            class_labels: metadata.topology.labels.clone(),
            input: metadata.topology.input.clone(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index).map(String::as_str)
    }

    /// ラベルが空文字列になっているインデックス
    pub fn empty_label_indices(&self) -> Vec<usize> {
        self.class_labels
            .iter()
            .enumerate()
            .filter(|(_, label)| label.trim().is_empty())
            .map(|(index, _)| index)
            .collect()
    }

    /// ラベル表をログに出す。空ラベルは警告する
    pub fn log_summary(&self) {
        tracing::info!(
            num_classes = self.num_classes(),
            "入力 {}x{}x{} / クラスラベル: {:?}",
            self.input.height,
            self.input.width,
            self.input.channels,
            self.class_labels
        );
        for index in self.empty_label_indices() {
            tracing::warn!(index, "クラス {} のラベルが空文字列です（そのまま返されます）", index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::topology::Topology;

    fn builtin_config() -> InferenceConfig {
        let metadata = ArtifactMetadata::new(Topology::builtin().unwrap(), 0, "w.safetensors");
        InferenceConfig::from_metadata(&metadata)
    }

    #[test]
    fn test_label_table() {
        let config = builtin_config();
        assert_eq!(config.num_classes(), 9);
        assert_eq!(config.class_index_to_label(0), Some("PTB"));
        assert_eq!(config.class_index_to_label(1), Some("normal"));
        assert_eq!(config.class_index_to_label(3), Some("tuberculosis pleuritis"));
        assert_eq!(config.class_index_to_label(8), Some("right upper pneumonia"));
        assert_eq!(config.class_index_to_label(9), None);
    }

    #[test]
    fn test_empty_label_is_preserved() {
        let config = builtin_config();
        assert_eq!(config.class_index_to_label(6), Some(""));
        assert_eq!(config.empty_label_indices(), vec![6]);
    }
}
