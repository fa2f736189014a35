//! 重みファイルからモデルアーティファクトを組み立てる（オフライン処理）
//!
//! トポロジからネットワークを構築し、外部で学習された重みを取り込んで
//! `metadata.json` + `model.bin` の tar.gz を1つ書き出します。

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_ndarray::{NdArray, NdArrayDevice};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ml::topology::{Topology, TopologyError};
use crate::ml::weights::{load_weights, WeightsError};
use crate::model::{save_artifact, ArtifactMetadata};

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("weights file not found: {0}")]
    MissingWeights(PathBuf),
    #[error("failed to read weights file {path}: {source}")]
    ReadWeights {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("weights do not match the topology: {0}")]
    Weights(#[from] WeightsError),
    #[error("failed to serialize model record: {0}")]
    Record(String),
    #[error("failed to write artifact: {0:#}")]
    Artifact(anyhow::Error),
}

/// 組み立て結果
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructOutcome {
    /// 実際に書き込んだアーティファクトのパス
    pub artifact_path: PathBuf,
    pub num_params: usize,
}

/// CPUバックエンドでアーティファクトを組み立てる
pub fn reconstruct_model(
    weights_path: &Path,
    topology: &Topology,
    output_path: &Path,
) -> Result<ReconstructOutcome, ReconstructError> {
    reconstruct_model_on::<NdArray>(weights_path, topology, output_path, &NdArrayDevice::default())
}

pub fn reconstruct_model_on<B: Backend>(
    weights_path: &Path,
    topology: &Topology,
    output_path: &Path,
    device: &B::Device,
) -> Result<ReconstructOutcome, ReconstructError> {
    if !weights_path.is_file() {
        return Err(ReconstructError::MissingWeights(weights_path.to_path_buf()));
    }

    let plan = topology.plan()?;
    plan.log_layers();

    let bytes = std::fs::read(weights_path).map_err(|source| ReconstructError::ReadWeights {
        path: weights_path.to_path_buf(),
        source,
    })?;
    let model = load_weights::<B>(&bytes, &plan, device)?;
    tracing::info!(
        weights = %weights_path.display(),
        num_params = plan.num_params(),
        "重みを取り込みました"
    );

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = Recorder::<B>::record(&recorder, model.into_record(), ())
        .map_err(|e| ReconstructError::Record(format!("{:?}", e)))?;

    let source_weights = weights_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let metadata = ArtifactMetadata::new(topology.clone(), plan.num_params(), source_weights);

    let artifact_path =
        save_artifact(output_path, &metadata, &model_binary).map_err(ReconstructError::Artifact)?;
    tracing::info!(artifact = %artifact_path.display(), "アーティファクトを保存しました");

    Ok(ReconstructOutcome {
        artifact_path,
        num_params: plan.num_params(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::topology::tests::tiny_topology;
    use crate::ml::weights::tests::synthetic_weights;
    use crate::model::load_artifact;

    #[test]
    fn test_missing_weights_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("full_model");

        let result = reconstruct_model(&dir.path().join("model_4.safetensors"), &tiny_topology(), &output);
        assert!(matches!(result, Err(ReconstructError::MissingWeights(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_incompatible_weights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let weights_path = dir.path().join("weights.safetensors");
        let plan = tiny_topology().plan().unwrap();
        std::fs::write(&weights_path, synthetic_weights(&plan, &[0.0; 9])).unwrap();

        // 組み込みトポロジとは形状が合わない
        let result = reconstruct_model(
            &weights_path,
            &Topology::builtin().unwrap(),
            &dir.path().join("full_model"),
        );
        assert!(matches!(
            result,
            Err(ReconstructError::Weights(WeightsError::ShapeMismatch { .. }))
        ));
        assert!(!dir.path().join("full_model.tar.gz").exists());
    }

    #[test]
    fn test_artifact_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let weights_path = dir.path().join("weights.safetensors");
        let topology = tiny_topology();
        let plan = topology.plan().unwrap();
        std::fs::write(&weights_path, synthetic_weights(&plan, &[0.0; 9])).unwrap();

        let outcome = reconstruct_model(&weights_path, &topology, &dir.path().join("out/full_model")).unwrap();
        assert_eq!(outcome.artifact_path, dir.path().join("out/full_model.tar.gz"));
        assert_eq!(outcome.num_params, plan.num_params());

        let (metadata, binary) = load_artifact(&outcome.artifact_path).unwrap();
        assert_eq!(metadata.topology, topology);
        assert_eq!(metadata.num_params, plan.num_params());
        assert_eq!(metadata.source_weights, "weights.safetensors");
        assert!(!binary.is_empty());
    }
}
