//! 機械学習モデルの共通定義
//!
//! トポロジから組み立てる胸部X線分類用CNNを提供します。
//! パラメータは畳み込み・BatchNorm・全結合の各ユニットに分けて保持し、
//! レイヤーの並びは `ModelPlan` に従います。

use anyhow::{bail, Result};
use burn::{
    module::{Module, Param},
    tensor::{activation, backend::Backend, module::conv2d, ops::ConvOptions, Tensor},
};

use crate::ml::topology::{Activation, ModelPlan, PlannedLayer, SpatialPadding};

/// 畳み込みユニット
#[derive(Module, Debug)]
pub struct ConvUnit<B: Backend> {
    /// [filters, in_channels, k, k]
    weight: Param<Tensor<B, 4>>,
    /// [filters]
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConvUnit<B> {
    fn zeros(in_channels: usize, filters: usize, kernel: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::zeros([filters, in_channels, kernel, kernel], device)),
            bias: Param::from_tensor(Tensor::zeros([filters], device)),
        }
    }

    /// Keras形式のカーネル `[k, k, in, out]` から作成
    pub fn from_keras(
        kernel: &[f32],
        bias: &[f32],
        kernel_size: usize,
        in_channels: usize,
        filters: usize,
        device: &B::Device,
    ) -> Self {
        let weight = Tensor::<B, 1>::from_floats(kernel, device)
            .reshape([kernel_size, kernel_size, in_channels, filters])
            .permute([3, 2, 0, 1]);
        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(Tensor::from_floats(bias, device)),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, stride: usize, padding: &SpatialPadding) -> Tensor<B, 4> {
        let x = pad_spatial(x, padding);
        conv2d(
            x,
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new([stride, stride], [0, 0], [1, 1], 1),
        )
    }
}

/// 推論用BatchNorm（移動平均・移動分散を使用）
#[derive(Module, Debug)]
pub struct NormUnit<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    moving_mean: Param<Tensor<B, 1>>,
    moving_variance: Param<Tensor<B, 1>>,
}

impl<B: Backend> NormUnit<B> {
    fn zeros(channels: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::zeros([channels], device)),
            beta: Param::from_tensor(Tensor::zeros([channels], device)),
            moving_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            moving_variance: Param::from_tensor(Tensor::zeros([channels], device)),
        }
    }

    pub fn from_keras(
        gamma: &[f32],
        beta: &[f32],
        moving_mean: &[f32],
        moving_variance: &[f32],
        device: &B::Device,
    ) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::from_floats(gamma, device)),
            beta: Param::from_tensor(Tensor::from_floats(beta, device)),
            moving_mean: Param::from_tensor(Tensor::from_floats(moving_mean, device)),
            moving_variance: Param::from_tensor(Tensor::from_floats(moving_variance, device)),
        }
    }

    /// y = (x - mean) / sqrt(var + eps) * gamma + beta を scale/shift に畳み込む
    fn scale_shift(&self, epsilon: f64) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let scale = self
            .gamma
            .val()
            .div(self.moving_variance.val().add_scalar(epsilon).sqrt());
        let shift = self
            .beta
            .val()
            .sub(self.moving_mean.val().mul(scale.clone()));
        (scale, shift)
    }

    fn forward_spatial(&self, x: Tensor<B, 4>, epsilon: f64) -> Tensor<B, 4> {
        let (scale, shift) = self.scale_shift(epsilon);
        let [channels] = scale.dims();
        x.mul(scale.reshape([1, channels, 1, 1]))
            .add(shift.reshape([1, channels, 1, 1]))
    }

    fn forward_flat(&self, x: Tensor<B, 2>, epsilon: f64) -> Tensor<B, 2> {
        let (scale, shift) = self.scale_shift(epsilon);
        x.mul(scale.unsqueeze()).add(shift.unsqueeze())
    }
}

/// 全結合ユニット
#[derive(Module, Debug)]
pub struct DenseUnit<B: Backend> {
    /// [in_features, units]
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> DenseUnit<B> {
    fn zeros(in_features: usize, units: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::zeros([in_features, units], device)),
            bias: Param::from_tensor(Tensor::zeros([units], device)),
        }
    }

    /// Keras形式のカーネル `[in, units]` から作成
    pub fn from_keras(
        kernel: &[f32],
        bias: &[f32],
        in_features: usize,
        units: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            weight: Param::from_tensor(
                Tensor::<B, 1>::from_floats(kernel, device).reshape([in_features, units]),
            ),
            bias: Param::from_tensor(Tensor::from_floats(bias, device)),
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        x.matmul(self.weight.val()).add(self.bias.val().unsqueeze())
    }
}

/// 胸部X線分類用CNNモデル
///
/// # アーキテクチャ
/// 組み込みトポロジでは以下の構成になります（すべての畳み込みはReLU）。
/// - {Conv 3x3 + BN, Conv 3x3 + BN, Conv 5x5 stride 2 (same) + BN, Dropout} x 3段（32, 64, 128ch）
/// - Conv 4x4 (256ch) + BN
/// - Flatten（NHWC順）, Dropout
/// - Dense 9 + Softmax
///
/// Dropoutは推論時には恒等写像です。
#[derive(Module, Debug)]
pub struct XrayClassifier<B: Backend> {
    convs: Vec<ConvUnit<B>>,
    norms: Vec<NormUnit<B>>,
    dense: Vec<DenseUnit<B>>,
}

/// レイヤー間を流れる特徴量
enum Features<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

impl<B: Backend> XrayClassifier<B> {
    /// 計画に従ってゼロ初期化したモデルを作成（記録の読み込み前の器）
    pub fn init(plan: &ModelPlan, device: &B::Device) -> Self {
        let mut convs = Vec::new();
        let mut norms = Vec::new();
        let mut dense = Vec::new();

        for layer in &plan.layers {
            match layer {
                PlannedLayer::Conv {
                    in_channels,
                    filters,
                    kernel,
                    ..
                } => convs.push(ConvUnit::zeros(*in_channels, *filters, *kernel, device)),
                PlannedLayer::BatchNorm { channels, .. } => {
                    norms.push(NormUnit::zeros(*channels, device))
                }
                PlannedLayer::Dense {
                    in_features, units, ..
                } => dense.push(DenseUnit::zeros(*in_features, *units, device)),
                PlannedLayer::Dropout { .. } | PlannedLayer::Flatten { .. } => {}
            }
        }

        Self {
            convs,
            norms,
            dense,
        }
    }

    /// 読み込み済みのユニットからモデルを作成
    pub fn from_units(convs: Vec<ConvUnit<B>>, norms: Vec<NormUnit<B>>, dense: Vec<DenseUnit<B>>) -> Self {
        Self {
            convs,
            norms,
            dense,
        }
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `plan`: モデル作成に使った実行計画
    /// - `images`: バッチ画像 [batch_size, height, width, 3]（NHWC）
    ///
    /// # 戻り値
    /// - クラスごとの確率 [batch_size, num_classes]
    pub fn forward(&self, plan: &ModelPlan, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let mut x = Features::Spatial(images.permute([0, 3, 1, 2]));

        for layer in &plan.layers {
            x = match (layer, x) {
                (
                    PlannedLayer::Conv {
                        slot,
                        stride,
                        padding,
                        activation,
                        ..
                    },
                    Features::Spatial(t),
                ) => {
                    let Some(unit) = self.convs.get(*slot) else {
                        bail!("畳み込みユニット {} がありません", slot);
                    };
                    let t = unit.forward(t, *stride, padding);
                    Features::Spatial(activate_spatial(t, *activation))
                }
                (PlannedLayer::BatchNorm { slot, epsilon, .. }, x) => {
                    let Some(unit) = self.norms.get(*slot) else {
                        bail!("BatchNormユニット {} がありません", slot);
                    };
                    match x {
                        Features::Spatial(t) => Features::Spatial(unit.forward_spatial(t, *epsilon)),
                        Features::Flat(t) => Features::Flat(unit.forward_flat(t, *epsilon)),
                    }
                }
                (PlannedLayer::Dropout { .. }, x) => x,
                (PlannedLayer::Flatten { .. }, Features::Spatial(t)) => {
                    // Kerasと同じ (H, W, C) の順で平坦化する
                    let [batch_size, c, h, w] = t.dims();
                    Features::Flat(t.permute([0, 2, 3, 1]).reshape([batch_size, h * w * c]))
                }
                (
                    PlannedLayer::Dense {
                        slot, activation, ..
                    },
                    Features::Flat(t),
                ) => {
                    let Some(unit) = self.dense.get(*slot) else {
                        bail!("全結合ユニット {} がありません", slot);
                    };
                    Features::Flat(activate_flat(unit.forward(t), *activation))
                }
                (layer, _) => bail!("レイヤー '{}' の入力形状が計画と一致しません", layer.name()),
            };
        }

        match x {
            Features::Flat(t) => Ok(t),
            Features::Spatial(_) => bail!("モデル出力が平坦化されていません"),
        }
    }
}

fn activate_spatial<B: Backend>(x: Tensor<B, 4>, kind: Activation) -> Tensor<B, 4> {
    match kind {
        Activation::Linear => x,
        Activation::Relu => activation::relu(x),
        Activation::Softmax => activation::softmax(x, 1),
    }
}

fn activate_flat<B: Backend>(x: Tensor<B, 2>, kind: Activation) -> Tensor<B, 2> {
    match kind {
        Activation::Linear => x,
        Activation::Relu => activation::relu(x),
        Activation::Softmax => activation::softmax(x, 1),
    }
}

/// NCHWテンソルの高さ・幅方向にゼロを詰める（前後で量が異なってよい）
fn pad_spatial<B: Backend>(x: Tensor<B, 4>, padding: &SpatialPadding) -> Tensor<B, 4> {
    if padding.is_zero() {
        return x;
    }
    let device = x.device();
    let [n, c, h, w] = x.dims();

    let mut rows = Vec::with_capacity(3);
    if padding.top > 0 {
        rows.push(Tensor::zeros([n, c, padding.top, w], &device));
    }
    rows.push(x);
    if padding.bottom > 0 {
        rows.push(Tensor::zeros([n, c, padding.bottom, w], &device));
    }
    let x = Tensor::cat(rows, 2);
    let h = h + padding.top + padding.bottom;

    let mut cols = Vec::with_capacity(3);
    if padding.left > 0 {
        cols.push(Tensor::zeros([n, c, h, padding.left], &device));
    }
    cols.push(x);
    if padding.right > 0 {
        cols.push(Tensor::zeros([n, c, h, padding.right], &device));
    }
    Tensor::cat(cols, 3)
}
