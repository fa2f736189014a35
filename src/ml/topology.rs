//! 宣言的なネットワーク構成（トポロジ）
//!
//! 復元ツールと推論サーバーはどちらもこの定義からネットワークを組み立てます。
//! 組み込みの定義は `assets/topology.json` で、復元時にアーティファクトへ埋め込まれます。
//!
//! パラメータ形状はKerasの並び（畳み込みカーネル `[k, k, in, out]`、
//! 全結合カーネル `[in, units]`）で表現します。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// 組み込みトポロジ（JSON）
const BUILTIN_TOPOLOGY: &str = include_str!("../../assets/topology.json");

/// 入力画像のチャネル順
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    /// 学習時の画像読み込みはBGR順だった
    #[default]
    Bgr,
}

/// 入力テンソルの形状（バッチ次元を除く）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    #[serde(default)]
    pub channel_order: ChannelOrder,
}

impl InputShape {
    /// 単一画像バッチの形状 `[1, height, width, channels]`
    pub fn batch_shape(&self) -> [usize; 4] {
        [1, self.height, self.width, self.channels]
    }
}

/// 畳み込みのパディング方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// 活性化関数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

fn default_stride() -> usize {
    1
}

fn default_epsilon() -> f64 {
    1e-3
}

/// レイヤー定義
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        name: String,
        filters: usize,
        kernel: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
    },
    BatchNorm {
        name: String,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    Dropout {
        name: String,
        rate: f64,
    },
    Flatten {
        name: String,
    },
    Dense {
        name: String,
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        match self {
            LayerSpec::Conv2d { name, .. }
            | LayerSpec::BatchNorm { name, .. }
            | LayerSpec::Dropout { name, .. }
            | LayerSpec::Flatten { name }
            | LayerSpec::Dense { name, .. } => name,
        }
    }
}

/// トポロジの検証エラー
#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("topology has no layers")]
    Empty,
    #[error("duplicate layer name '{0}'")]
    DuplicateName(String),
    #[error("input size must be at least 1x1, found {height}x{width}")]
    EmptyInput { height: usize, width: usize },
    #[error("input must have 3 channels, found {0}")]
    UnsupportedChannels(usize),
    #[error("layer '{0}' has a zero-sized hyperparameter")]
    ZeroSized(String),
    #[error("layer '{layer}' reduces the feature map below 1x1 (input {height}x{width})")]
    FeatureMapCollapsed {
        layer: String,
        height: usize,
        width: usize,
    },
    #[error("layer '{0}' expects a spatial feature map but follows a flatten")]
    SpatialAfterFlatten(String),
    #[error("dense layer '{0}' must follow a flatten")]
    DenseBeforeFlatten(String),
    #[error("dropout layer '{layer}' has rate {rate} outside [0, 1)")]
    InvalidRate { layer: String, rate: f64 },
    #[error("the last layer must be a softmax dense layer")]
    MissingHead,
    #[error("output layer has {units} units but the label table has {labels} entries")]
    LabelCountMismatch { units: usize, labels: usize },
}

/// ネットワーク構成の全体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    pub input: InputShape,
    pub layers: Vec<LayerSpec>,
    /// 出力インデックス -> クラスラベル
    pub labels: Vec<String>,
}

impl Topology {
    /// 組み込みの結核判定CNN
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_json_str(BUILTIN_TOPOLOGY).context("Failed to parse built-in topology")
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize topology from JSON")
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology file: {:?}", path))?;
        Self::from_json_str(&json)
    }

    /// 指定があればファイルから、なければ組み込み定義を読み込む
    pub fn load_or_builtin(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_json_file(path),
            None => Self::builtin(),
        }
    }

    /// 形状推論を行い、実行計画を作成する
    pub fn plan(&self) -> Result<ModelPlan, TopologyError> {
        if self.layers.is_empty() {
            return Err(TopologyError::Empty);
        }
        if self.input.height == 0 || self.input.width == 0 {
            return Err(TopologyError::EmptyInput {
                height: self.input.height,
                width: self.input.width,
            });
        }
        if self.input.channels != 3 {
            return Err(TopologyError::UnsupportedChannels(self.input.channels));
        }

        let mut seen = HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name()) {
                return Err(TopologyError::DuplicateName(layer.name().to_string()));
            }
        }

        let mut stage = Stage::Spatial(FeatureShape {
            height: self.input.height,
            width: self.input.width,
            channels: self.input.channels,
        });
        let (mut convs, mut norms, mut denses) = (0, 0, 0);
        let mut planned = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let name = layer.name().to_string();
            let next = match (layer, stage) {
                (
                    LayerSpec::Conv2d {
                        filters,
                        kernel,
                        stride,
                        padding,
                        activation,
                        ..
                    },
                    Stage::Spatial(input),
                ) => {
                    if *filters == 0 || *kernel == 0 || *stride == 0 {
                        return Err(TopologyError::ZeroSized(name));
                    }
                    let (height, pad_top, pad_bottom) =
                        conv_output(&name, input, input.height, *kernel, *stride, *padding)?;
                    let (width, pad_left, pad_right) =
                        conv_output(&name, input, input.width, *kernel, *stride, *padding)?;
                    let output = FeatureShape {
                        height,
                        width,
                        channels: *filters,
                    };
                    planned.push(PlannedLayer::Conv {
                        name,
                        slot: convs,
                        in_channels: input.channels,
                        filters: *filters,
                        kernel: *kernel,
                        stride: *stride,
                        padding: SpatialPadding {
                            top: pad_top,
                            bottom: pad_bottom,
                            left: pad_left,
                            right: pad_right,
                        },
                        activation: *activation,
                        output,
                    });
                    convs += 1;
                    Stage::Spatial(output)
                }
                (LayerSpec::Conv2d { .. }, Stage::Flat(_)) => {
                    return Err(TopologyError::SpatialAfterFlatten(name));
                }
                (LayerSpec::BatchNorm { epsilon, .. }, stage) => {
                    let (channels, spatial) = match stage {
                        Stage::Spatial(shape) => (shape.channels, true),
                        Stage::Flat(features) => (features, false),
                    };
                    planned.push(PlannedLayer::BatchNorm {
                        name,
                        slot: norms,
                        channels,
                        epsilon: *epsilon,
                        spatial,
                    });
                    norms += 1;
                    stage
                }
                (LayerSpec::Dropout { rate, .. }, stage) => {
                    if !(0.0..1.0).contains(rate) {
                        return Err(TopologyError::InvalidRate {
                            layer: name,
                            rate: *rate,
                        });
                    }
                    planned.push(PlannedLayer::Dropout { name, rate: *rate });
                    stage
                }
                (LayerSpec::Flatten { .. }, Stage::Spatial(shape)) => {
                    let features = shape.height * shape.width * shape.channels;
                    planned.push(PlannedLayer::Flatten { name, features });
                    Stage::Flat(features)
                }
                (LayerSpec::Flatten { .. }, Stage::Flat(_)) => {
                    return Err(TopologyError::SpatialAfterFlatten(name));
                }
                (LayerSpec::Dense { units, activation, .. }, Stage::Flat(in_features)) => {
                    if *units == 0 {
                        return Err(TopologyError::ZeroSized(name));
                    }
                    planned.push(PlannedLayer::Dense {
                        name,
                        slot: denses,
                        in_features,
                        units: *units,
                        activation: *activation,
                    });
                    denses += 1;
                    Stage::Flat(*units)
                }
                (LayerSpec::Dense { .. }, Stage::Spatial(_)) => {
                    return Err(TopologyError::DenseBeforeFlatten(name));
                }
            };
            stage = next;
        }

        let num_classes = match self.layers.last() {
            Some(LayerSpec::Dense {
                units,
                activation: Activation::Softmax,
                ..
            }) => *units,
            _ => return Err(TopologyError::MissingHead),
        };
        if num_classes != self.labels.len() {
            return Err(TopologyError::LabelCountMismatch {
                units: num_classes,
                labels: self.labels.len(),
            });
        }

        Ok(ModelPlan {
            input: self.input.clone(),
            layers: planned,
            num_classes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Spatial(FeatureShape),
    Flat(usize),
}

/// 1軸分の出力サイズと (前, 後) パディングを計算する
///
/// `same` はTensorFlowと同じく不足分を後ろ側に多く割り当てる。
fn conv_output(
    layer: &str,
    input: FeatureShape,
    size: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize, usize), TopologyError> {
    let collapsed = || TopologyError::FeatureMapCollapsed {
        layer: layer.to_string(),
        height: input.height,
        width: input.width,
    };
    if size == 0 {
        return Err(collapsed());
    }

    match padding {
        Padding::Valid => {
            if size < kernel {
                return Err(collapsed());
            }
            Ok(((size - kernel) / stride + 1, 0, 0))
        }
        Padding::Same => {
            let out = size.div_ceil(stride);
            let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(size);
            Ok((out, total / 2, total - total / 2))
        }
    }
}

/// 特徴マップの形状 (H, W, C)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

/// 非対称なゼロパディング量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpatialPadding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl SpatialPadding {
    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

/// 形状が確定したレイヤー
///
/// `slot` は同種のパラメータ付きレイヤー内での通し番号。
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedLayer {
    Conv {
        name: String,
        slot: usize,
        in_channels: usize,
        filters: usize,
        kernel: usize,
        stride: usize,
        padding: SpatialPadding,
        activation: Activation,
        output: FeatureShape,
    },
    BatchNorm {
        name: String,
        slot: usize,
        channels: usize,
        epsilon: f64,
        spatial: bool,
    },
    Dropout {
        name: String,
        rate: f64,
    },
    Flatten {
        name: String,
        features: usize,
    },
    Dense {
        name: String,
        slot: usize,
        in_features: usize,
        units: usize,
        activation: Activation,
    },
}

impl PlannedLayer {
    pub fn name(&self) -> &str {
        match self {
            PlannedLayer::Conv { name, .. }
            | PlannedLayer::BatchNorm { name, .. }
            | PlannedLayer::Dropout { name, .. }
            | PlannedLayer::Flatten { name, .. }
            | PlannedLayer::Dense { name, .. } => name,
        }
    }

    /// このレイヤーが持つパラメータ（Keras形状）
    pub fn params(&self) -> Vec<ParamSpec> {
        match self {
            PlannedLayer::Conv {
                name,
                in_channels,
                filters,
                kernel,
                ..
            } => vec![
                ParamSpec::new(name, "kernel", vec![*kernel, *kernel, *in_channels, *filters]),
                ParamSpec::new(name, "bias", vec![*filters]),
            ],
            PlannedLayer::BatchNorm { name, channels, .. } => ["gamma", "beta", "moving_mean", "moving_variance"]
                .into_iter()
                .map(|param| ParamSpec::new(name, param, vec![*channels]))
                .collect(),
            PlannedLayer::Dense {
                name,
                in_features,
                units,
                ..
            } => vec![
                ParamSpec::new(name, "kernel", vec![*in_features, *units]),
                ParamSpec::new(name, "bias", vec![*units]),
            ],
            PlannedLayer::Dropout { .. } | PlannedLayer::Flatten { .. } => Vec::new(),
        }
    }
}

/// 重みテンソル1つ分の定義
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub layer: String,
    pub param: &'static str,
    pub shape: Vec<usize>,
}

impl ParamSpec {
    fn new(layer: &str, param: &'static str, shape: Vec<usize>) -> Self {
        Self {
            layer: layer.to_string(),
            param,
            shape,
        }
    }

    /// 重みファイル内のテンソル名 `layer/param`
    pub fn key(&self) -> String {
        format!("{}/{}", self.layer, self.param)
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// 形状推論済みの実行計画
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPlan {
    pub input: InputShape,
    pub layers: Vec<PlannedLayer>,
    pub num_classes: usize,
}

impl ModelPlan {
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        self.layers.iter().flat_map(PlannedLayer::params).collect()
    }

    pub fn num_params(&self) -> usize {
        self.param_specs().iter().map(ParamSpec::num_elements).sum()
    }

    /// 最後の畳み込み出力の形状
    pub fn final_feature_map(&self) -> Option<FeatureShape> {
        self.layers.iter().rev().find_map(|layer| match layer {
            PlannedLayer::Conv { output, .. } => Some(*output),
            _ => None,
        })
    }

    /// 各レイヤーの形状をログに出力
    pub fn log_layers(&self) {
        tracing::debug!(
            "[Model] 入力サイズ: {}x{}x{}",
            self.input.height,
            self.input.width,
            self.input.channels
        );
        for layer in &self.layers {
            match layer {
                PlannedLayer::Conv { name, output, .. } => tracing::debug!(
                    "[Model] {}後: {} x {}x{}",
                    name,
                    output.channels,
                    output.height,
                    output.width
                ),
                PlannedLayer::Flatten { name, features } => {
                    tracing::debug!("[Model] {}後の特徴次元 d: {}", name, features)
                }
                PlannedLayer::Dense {
                    name,
                    in_features,
                    units,
                    ..
                } => tracing::debug!("[Model] {}: {} -> {}", name, in_features, units),
                PlannedLayer::BatchNorm { .. } | PlannedLayer::Dropout { .. } => {}
            }
        }
    }
}
