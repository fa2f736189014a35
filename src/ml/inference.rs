//! モデル推論機能

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::ml::ml_model::XrayClassifier;
use crate::ml::preprocess::{image_to_input, InputTensor};
use crate::ml::topology::ModelPlan;
use crate::model::{load_artifact, log_metadata_info, AppConfig, DeviceType, InferenceConfig};
use crate::types::Prediction;

/// 分類のエラー
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// 画像として読めない入力（利用者側の誤り）
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// HTTP層から見た分類器
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifyError>;
}

struct LoadedModel<B: Backend> {
    model: XrayClassifier<B>,
    device: B::Device,
}

/// 推論エンジン
///
/// burn のパラメータは `Sync` とは限らないため、モデルは `Mutex` の内側に置きます。
pub struct InferenceEngine<B: Backend> {
    inner: Mutex<LoadedModel<B>>,
    plan: ModelPlan,
    config: InferenceConfig,
}

impl<B: Backend> InferenceEngine<B> {
    /// アーティファクトを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(artifact_path: P, device: B::Device) -> Result<Self> {
        let artifact_path = artifact_path.as_ref();
        let (metadata, model_binary) = load_artifact(artifact_path)
            .with_context(|| format!("Failed to load model artifact: {}", artifact_path.display()))?;
        log_metadata_info(&metadata);

        let plan = metadata
            .topology
            .plan()
            .context("Embedded topology is invalid")?;
        if plan.num_params() != metadata.num_params {
            tracing::warn!(
                expected = metadata.num_params,
                planned = plan.num_params(),
                "メタデータのパラメータ数がトポロジと一致しません"
            );
        }

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = XrayClassifier::<B>::init(&plan, &device).load_record(record);

        let config = InferenceConfig::from_metadata(&metadata);
        Ok(Self::from_model(model, plan, config, device))
    }

    /// 構築済みのモデルから作成
    pub fn from_model(model: XrayClassifier<B>, plan: ModelPlan, config: InferenceConfig, device: B::Device) -> Self {
        config.log_summary();
        Self {
            inner: Mutex::new(LoadedModel { model, device }),
            plan,
            config,
        }
    }

    /// 前処理済みテンソルからクラス確率を計算
    pub fn predict_tensor(&self, input: &InputTensor) -> Result<Vec<f32>, ClassifyError> {
        let expected = self.config.input.batch_shape();
        if input.shape() != expected {
            return Err(ClassifyError::Inference(format!(
                "input shape {:?} does not match model input {:?}",
                input.shape(),
                expected
            )));
        }

        let inner = self
            .inner
            .lock()
            .map_err(|_| ClassifyError::Inference("model lock poisoned".to_string()))?;

        let tensor = Tensor::<B, 1>::from_floats(input.data(), &inner.device).reshape(expected);
        let output = inner
            .model
            .forward(&self.plan, tensor)
            .map_err(|e| ClassifyError::Inference(e.to_string()))?;

        output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifyError::Inference(format!("推論結果の取得エラー: {:?}", e)))
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

impl<B: Backend> Classifier for InferenceEngine<B> {
    fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifyError> {
        let input = image_to_input(image, &self.config.input)?;
        let probabilities = self.predict_tensor(&input)?;

        let class_index = argmax(&probabilities)
            .ok_or_else(|| ClassifyError::Inference("model produced no scores".to_string()))?;
        let label = self
            .config
            .class_index_to_label(class_index)
            .ok_or_else(|| {
                ClassifyError::Inference(format!("クラスインデックス {} は範囲外です", class_index))
            })?
            .to_string();

        tracing::debug!(class_index, label = %label, "分類しました");
        Ok(Prediction {
            class_index,
            label,
            probabilities,
        })
    }
}

/// 最大値のインデックス（同値なら先頭、NaNは無視）
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// 設定されたデバイスで分類器を読み込む
pub fn load_classifier(config: &AppConfig) -> Result<Arc<dyn Classifier>> {
    let path = &config.model.artifact_path;
    match config.device_type {
        DeviceType::Cpu => {
            let engine = InferenceEngine::<burn_ndarray::NdArray>::load(path, burn_ndarray::NdArrayDevice::default())?;
            Ok(Arc::new(engine))
        }
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            let engine = InferenceEngine::<burn_wgpu::Wgpu>::load(path, burn_wgpu::WgpuDevice::default())?;
            Ok(Arc::new(engine))
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => anyhow::bail!("device_type \"wgpu\" requires building with the `wgpu` feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::reconstruct::reconstruct_model;
    use crate::ml::topology::tests::tiny_topology;
    use crate::ml::topology::Topology;
    use crate::ml::weights::{load_weights, tests::synthetic_weights};
    use crate::model::ArtifactMetadata;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([120, 60, 30])));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn tiny_engine(head_bias: &[f32]) -> InferenceEngine<NdArray> {
        let device = NdArrayDevice::default();
        let topology = tiny_topology();
        let plan = topology.plan().unwrap();
        let model = load_weights::<NdArray>(&synthetic_weights(&plan, head_bias), &plan, &device).unwrap();
        let config = InferenceConfig::from_metadata(&ArtifactMetadata::new(topology, plan.num_params(), "w"));
        InferenceEngine::from_model(model, plan, config, device)
    }

    #[test]
    fn test_argmax_first_maximum_wins() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.1]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_classify_returns_label_from_table() {
        let mut bias = vec![0.0; 9];
        bias[7] = 6.0;
        let engine = tiny_engine(&bias);

        let prediction = engine.classify(&png(640, 480)).unwrap();
        assert_eq!(prediction.class_index, 7);
        assert_eq!(prediction.label, "TB");
        assert_eq!(prediction.probabilities.len(), 9);
        assert!(engine.config().class_labels.contains(&prediction.label));
    }

    #[test]
    fn test_empty_label_is_returned_verbatim() {
        let mut bias = vec![0.0; 9];
        bias[6] = 6.0;
        let prediction = tiny_engine(&bias).classify(&png(20, 20)).unwrap();
        assert_eq!(prediction.class_index, 6);
        assert_eq!(prediction.label, "");
    }

    #[test]
    fn test_undecodable_image_is_decode_error() {
        let engine = tiny_engine(&[0.0; 9]);
        assert!(matches!(engine.classify(b"not an image"), Err(ClassifyError::Decode(_))));
    }

    #[test]
    fn test_wrong_input_shape_is_rejected() {
        let engine = tiny_engine(&[0.0; 9]);
        let mut topology = tiny_topology();
        topology.input.height = 20;
        let other = crate::ml::preprocess::rgb_to_input(&ImageBuffer::from_pixel(4, 4, Rgb([0, 0, 0])), &topology.input);
        assert!(matches!(engine.predict_tensor(&other), Err(ClassifyError::Inference(_))));
    }

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let topology = tiny_topology();
        let plan = topology.plan().unwrap();
        let mut bias = vec![0.0; 9];
        bias[2] = 6.0;
        let weights_path = dir.path().join("weights.safetensors");
        std::fs::write(&weights_path, synthetic_weights(&plan, &bias)).unwrap();

        let outcome = reconstruct_model(&weights_path, &topology, &dir.path().join("full_model")).unwrap();
        let engine = InferenceEngine::<NdArray>::load(&outcome.artifact_path, NdArrayDevice::default()).unwrap();

        let prediction = engine.classify(&png(33, 71)).unwrap();
        assert_eq!(prediction.label, "ATB");
    }

    #[test]
    fn test_builtin_network_runs_end_to_end() {
        let device = NdArrayDevice::default();
        let topology = Topology::builtin().unwrap();
        let plan = topology.plan().unwrap();
        let model = XrayClassifier::<NdArray>::init(&plan, &device);
        let config = InferenceConfig::from_metadata(&ArtifactMetadata::new(topology, plan.num_params(), "w"));
        let engine = InferenceEngine::from_model(model, plan, config, device);

        // ゼロ初期化なので一様分布になり、先頭のクラスが選ばれる
        let prediction = engine.classify(&png(256, 256)).unwrap();
        assert_eq!(prediction.probabilities.len(), 9);
        assert_eq!(prediction.class_index, 0);
        assert_eq!(prediction.label, "PTB");
    }

    #[test]
    fn test_load_classifier_reports_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.model.artifact_path = dir.path().join("absent.tar.gz");
        assert!(load_classifier(&config).is_err());
    }
}
