//! 入力画像の前処理
//!
//! アップロードされた画像をデコードし、トポロジの入力サイズへリサイズ（切り抜きなし）して
//! `[1, H, W, 3]` のNHWCテンソルに並べます。画素値は 0〜255 のまま扱い、
//! 学習時に無かったスケーリングは加えません。
//!
//! リサイズは OpenCV の `INTER_LINEAR` と同じ計算です。縮小時も周囲2×2画素だけを補間し、
//! 平滑化はしません。

use image::{DynamicImage, ImageDecoder, ImageError, ImageReader, RgbImage};
use std::io::Cursor;

use crate::ml::topology::{ChannelOrder, InputShape};

/// 補間係数の固定小数点ビット数
const COEF_BITS: u32 = 11;
const COEF_SCALE: i32 = 1 << COEF_BITS;

/// モデル入力テンソル（NHWC、f32）
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Vec<f32>,
    shape: [usize; 4],
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// 画素 (y, x) のチャネル `channel` の値（チャネル順はトポロジに従う）
    pub fn value(&self, y: usize, x: usize, channel: usize) -> Option<f32> {
        let [_, height, width, channels] = self.shape;
        if y >= height || x >= width || channel >= channels {
            return None;
        }
        self.data.get((y * width + x) * channels + channel).copied()
    }
}

/// バイト列の画像をモデル入力に変換する
pub fn image_to_input(bytes: &[u8], input: &InputShape) -> Result<InputTensor, ImageError> {
    let image = decode_oriented(bytes)?;
    // アルファは捨て、グレースケールは3チャネルに展開する
    Ok(rgb_to_input(&image.to_rgb8(), input))
}

/// デコードしてEXIFの向きを適用する
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// RGB画像をモデル入力に変換する
pub fn rgb_to_input(rgb: &RgbImage, input: &InputShape) -> InputTensor {
    let (width, height) = (input.width, input.height);
    let resized = resize_linear(rgb, width, height);

    let order: [usize; 3] = match input.channel_order {
        ChannelOrder::Rgb => [0, 1, 2],
        ChannelOrder::Bgr => [2, 1, 0],
    };

    let mut data = Vec::with_capacity(height * width * 3);
    for y in 0..height {
        for x in 0..width {
            let pixel = resized.get_pixel(x as u32, y as u32);
            for channel in order {
                data.push(pixel[channel] as f32);
            }
        }
    }

    InputTensor {
        data,
        shape: [1, height, width, 3],
    }
}

/// 出力1画素分の補間元（左右または上下の2画素と固定小数点の重み）
#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearTap {
    index: [usize; 2],
    weight: [i32; 2],
}

/// 1軸分の補間表
///
/// 出力画素の中心を入力座標 `(d + 0.5) * scale - 0.5` に写し、端では最も近い画素に寄せる。
fn linear_taps(src: usize, dst: usize) -> Vec<LinearTap> {
    let scale = src as f64 / dst as f64;
    let last = src as i64 - 1;

    (0..dst)
        .map(|d| {
            let pos = ((d as f64 + 0.5) * scale - 0.5) as f32;
            let mut left = pos.floor() as i64;
            let mut frac = pos - left as f32;
            if left < 0 {
                left = 0;
                frac = 0.0;
            }
            if left >= last {
                left = last;
                frac = 0.0;
            }

            let near = ((1.0 - frac) * COEF_SCALE as f32).round_ties_even() as i32;
            let left = left as usize;
            LinearTap {
                index: [left, (left + 1).min(src - 1)],
                weight: [near, COEF_SCALE - near],
            }
        })
        .collect()
}

/// 双線形リサイズ（横方向、縦方向の順に整数演算で補間）
fn resize_linear(rgb: &RgbImage, width: usize, height: usize) -> RgbImage {
    let mut out = RgbImage::new(width as u32, height as u32);
    let (src_width, src_height) = (rgb.width() as usize, rgb.height() as usize);
    if src_width == 0 || src_height == 0 || width == 0 {
        return out;
    }

    let columns = linear_taps(src_width, width);
    let rows = linear_taps(src_height, height);
    let src = rgb.as_raw();

    // 横方向の補間結果（係数倍されたまま）
    let horizontal = |y: usize| -> Vec<i32> {
        let row = &src[y * src_width * 3..(y + 1) * src_width * 3];
        let mut line = Vec::with_capacity(width * 3);
        for tap in &columns {
            for channel in 0..3 {
                let a = row[tap.index[0] * 3 + channel] as i32;
                let b = row[tap.index[1] * 3 + channel] as i32;
                line.push(a * tap.weight[0] + b * tap.weight[1]);
            }
        }
        line
    };

    let round: i32 = 1 << (COEF_BITS * 2 - 1);
    for (tap, line) in rows.iter().zip(out.chunks_exact_mut(width * 3)) {
        let upper = horizontal(tap.index[0]);
        let lower = horizontal(tap.index[1]);
        for ((a, b), value) in upper.iter().zip(&lower).zip(line.iter_mut()) {
            let mixed = (a * tap.weight[0] + b * tap.weight[1] + round) >> (COEF_BITS * 2);
            *value = mixed.clamp(0, 255) as u8;
        }
    }
    out
}
