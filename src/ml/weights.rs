//! 外部で学習された重みの読み込み
//!
//! 重みのみのファイルは safetensors 形式で、テンソル名はKerasの
//! `"{layer}/{param}"` に従います（`:0` 付きや `.` 区切りも受け付けます）。
//! 形状はKerasの並びのまま格納されている前提です。

use burn::tensor::backend::Backend;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::collections::HashSet;
use thiserror::Error;

use crate::ml::ml_model::{ConvUnit, DenseUnit, NormUnit, XrayClassifier};
use crate::ml::topology::{ModelPlan, ParamSpec, PlannedLayer};

/// 重み読み込みのエラー
#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("weights file is not valid safetensors: {0}")]
    Format(String),
    #[error("weights file has no tensor for '{0}'")]
    MissingTensor(String),
    #[error("tensor '{name}' has shape {found:?}, the topology expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("tensor '{name}' has unsupported dtype {dtype:?} (expected F32 or F64)")]
    UnsupportedDtype { name: String, dtype: Dtype },
}

/// 重みファイル内のテンソル群
pub struct WeightFile<'data> {
    tensors: SafeTensors<'data>,
    used: HashSet<String>,
}

impl<'data> WeightFile<'data> {
    pub fn parse(bytes: &'data [u8]) -> Result<Self, WeightsError> {
        let tensors =
            SafeTensors::deserialize(bytes).map_err(|e| WeightsError::Format(e.to_string()))?;
        Ok(Self {
            tensors,
            used: HashSet::new(),
        })
    }

    /// パラメータ定義に対応するテンソルを探し、形状を検証してf32で返す
    pub fn take(&mut self, spec: &ParamSpec) -> Result<Vec<f32>, WeightsError> {
        let candidates = [
            spec.key(),
            format!("{}:0", spec.key()),
            format!("{}.{}", spec.layer, spec.param),
        ];
        let (name, view) = candidates
            .iter()
            .find_map(|name| self.tensors.tensor(name).ok().map(|view| (name.clone(), view)))
            .ok_or_else(|| WeightsError::MissingTensor(spec.key()))?;

        if view.shape() != spec.shape.as_slice() {
            return Err(WeightsError::ShapeMismatch {
                name,
                expected: spec.shape.clone(),
                found: view.shape().to_vec(),
            });
        }

        let values = to_f32(&name, &view)?;
        self.used.insert(name);
        Ok(values)
    }

    /// まだ使われていないテンソル名（オプティマイザ状態など）
    pub fn unused(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tensors
            .names()
            .into_iter()
            .filter(|name| !self.used.contains(name.as_str()))
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, WeightsError> {
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::F64 => Ok(bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        dtype => Err(WeightsError::UnsupportedDtype {
            name: name.to_string(),
            dtype,
        }),
    }
}

/// 重みファイルを計画どおりのモデルに読み込む
pub fn load_weights<B: Backend>(
    bytes: &[u8],
    plan: &ModelPlan,
    device: &B::Device,
) -> Result<XrayClassifier<B>, WeightsError> {
    let mut file = WeightFile::parse(bytes)?;
    let mut convs = Vec::new();
    let mut norms = Vec::new();
    let mut dense = Vec::new();

    for layer in &plan.layers {
        let specs = layer.params();
        match layer {
            PlannedLayer::Conv {
                in_channels,
                filters,
                kernel,
                ..
            } => {
                let weight = file.take(&specs[0])?;
                let bias = file.take(&specs[1])?;
                convs.push(ConvUnit::from_keras(
                    &weight,
                    &bias,
                    *kernel,
                    *in_channels,
                    *filters,
                    device,
                ));
            }
            PlannedLayer::BatchNorm { .. } => {
                let gamma = file.take(&specs[0])?;
                let beta = file.take(&specs[1])?;
                let mean = file.take(&specs[2])?;
                let variance = file.take(&specs[3])?;
                norms.push(NormUnit::from_keras(&gamma, &beta, &mean, &variance, device));
            }
            PlannedLayer::Dense {
                in_features, units, ..
            } => {
                let weight = file.take(&specs[0])?;
                let bias = file.take(&specs[1])?;
                dense.push(DenseUnit::from_keras(
                    &weight,
                    &bias,
                    *in_features,
                    *units,
                    device,
                ));
            }
            PlannedLayer::Dropout { .. } | PlannedLayer::Flatten { .. } => {}
        }
    }

    let unused = file.unused();
    if !unused.is_empty() {
        tracing::warn!(
            "重みファイルに未使用のテンソルが {} 個あります: {}",
            unused.len(),
            unused.join(", ")
        );
    }

    Ok(XrayClassifier::from_units(convs, norms, dense))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::topology::tests::tiny_topology;
    use burn_ndarray::{NdArray, NdArrayDevice};

    /// 計画どおりの形状で safetensors を作る
    ///
    /// BNは恒等変換、畳み込みと全結合の重みはゼロ、出力バイアスだけ `head_bias`。
    pub(crate) fn synthetic_weights(plan: &ModelPlan, head_bias: &[f32]) -> Vec<u8> {
        let specs = plan.param_specs();
        let last_key = specs.last().map(ParamSpec::key);
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = specs
            .iter()
            .map(|spec| {
                let values: Vec<f32> = match spec.param {
                    "gamma" | "moving_variance" => vec![1.0; spec.num_elements()],
                    "bias" if Some(spec.key()) == last_key => head_bias.to_vec(),
                    _ => vec![0.0; spec.num_elements()],
                };
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (format!("{}:0", spec.key()), spec.shape.clone(), bytes)
            })
            .collect();

        let views: Vec<(String, TensorView<'_>)> = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                (
                    name.clone(),
                    TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, &None).unwrap()
    }

    #[test]
    fn test_load_synthetic_weights() {
        let device = NdArrayDevice::default();
        let plan = tiny_topology().plan().unwrap();
        let mut bias = vec![0.0; 9];
        bias[3] = 5.0;
        let bytes = synthetic_weights(&plan, &bias);

        let model = load_weights::<NdArray>(&bytes, &plan, &device).unwrap();
        let input = burn::tensor::Tensor::<NdArray, 4>::ones([1, 12, 12, 3], &device);
        let probabilities = model
            .forward(&plan, input)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(probabilities[3] > 0.9);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let device = NdArrayDevice::default();
        let plan = tiny_topology().plan().unwrap();
        let bytes = synthetic_weights(&plan, &[0.0; 9]);

        // 入力サイズを変えると全結合の入力次元が合わなくなる
        let mut other = tiny_topology();
        other.input.height = 16;
        other.input.width = 16;
        let other_plan = other.plan().unwrap();

        match load_weights::<NdArray>(&bytes, &other_plan, &device) {
            Err(WeightsError::ShapeMismatch {
                name,
                expected,
                found,
            }) => {
                assert_eq!(name, "dense/kernel:0");
                assert_eq!(expected, vec![7 * 7 * 4, 9]);
                assert_eq!(found, vec![5 * 5 * 4, 9]);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_tensor_is_reported() {
        let device = NdArrayDevice::default();
        let plan = tiny_topology().plan().unwrap();
        let bytes = synthetic_weights(&plan, &[0.0; 9]);

        let mut renamed = tiny_topology();
        if let crate::ml::topology::LayerSpec::Conv2d { name, .. } = &mut renamed.layers[0] {
            *name = "conv2d_99".to_string();
        }
        let renamed_plan = renamed.plan().unwrap();

        match load_weights::<NdArray>(&bytes, &renamed_plan, &device) {
            Err(WeightsError::MissingTensor(name)) => assert_eq!(name, "conv2d_99/kernel"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_not_safetensors() {
        assert!(matches!(
            WeightFile::parse(b"HDF\x89 not safetensors"),
            Err(WeightsError::Format(_))
        ));
    }

    #[test]
    fn test_unused_tensors_are_listed() {
        let plan = tiny_topology().plan().unwrap();
        let bytes = synthetic_weights(&plan, &[0.0; 9]);
        let mut file = WeightFile::parse(&bytes).unwrap();
        let specs = plan.param_specs();
        file.take(&specs[0]).unwrap();

        let unused = file.unused();
        assert_eq!(unused.len(), specs.len() - 1);
        assert!(!unused.contains(&"conv2d/kernel:0".to_string()));
    }
}
