// 该文件是 Duanlu （断路） 项目的一部分。
// src/preprocess.rs - 图像预处理（Letterbox 缩放与归一化）
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

use crate::{
  codec::DecodedImage,
  tensor::{InputContract, Normalization, PreprocessedTensor, TensorData, TensorLayout, TensorShape},
};

/// 填充色，与常见 YOLO 预处理一致
pub const PAD_VALUE: u8 = 114;
const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("图像面积为零: {width}x{height}")]
  ZeroArea { width: u32, height: u32 },
}

/// Letterbox 变换参数，保留逆变换所需的缩放与偏移
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub source_width: u32,
  pub source_height: u32,
  pub target: TensorShape,
  /// 缩放后的图像尺寸
  pub scaled_width: u32,
  pub scaled_height: u32,
  /// 左侧与上侧的填充像素
  pub pad_x: u32,
  pub pad_y: u32,
}

impl Letterbox {
  pub fn fit(source_width: u32, source_height: u32, target: TensorShape) -> Self {
    let scale = (target.width as f32 / source_width as f32)
      .min(target.height as f32 / source_height as f32);
    let scaled_width = ((source_width as f32 * scale).round() as u32).clamp(1, target.width);
    let scaled_height = ((source_height as f32 * scale).round() as u32).clamp(1, target.height);

    Self {
      source_width,
      source_height,
      target,
      scaled_width,
      scaled_height,
      pad_x: (target.width - scaled_width) / 2,
      pad_y: (target.height - scaled_height) / 2,
    }
  }

  fn scale_x(&self) -> f32 {
    self.scaled_width as f32 / self.source_width as f32
  }

  fn scale_y(&self) -> f32 {
    self.scaled_height as f32 / self.source_height as f32
  }

  /// 将模型输入上的归一化坐标 [x_min, y_min, x_max, y_max] 映射回原图像素坐标，
  /// 结果限制在 [0, width] x [0, height] 内
  pub fn to_source(&self, bbox: &[f32; 4]) -> [f32; 4] {
    let w = self.source_width as f32;
    let h = self.source_height as f32;
    let map_x = |v: f32| {
      let x = (v * self.target.width as f32 - self.pad_x as f32) / self.scale_x();
      if x.is_finite() { x.clamp(0.0, w) } else { 0.0 }
    };
    let map_y = |v: f32| {
      let y = (v * self.target.height as f32 - self.pad_y as f32) / self.scale_y();
      if y.is_finite() { y.clamp(0.0, h) } else { 0.0 }
    };

    let (x0, x1) = (map_x(bbox[0]), map_x(bbox[2]));
    let (y0, y1) = (map_y(bbox[1]), map_y(bbox[3]));
    [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)]
  }
}

/// 将解码后的图像变换为符合模型约定的张量
pub fn transform(
  image: &DecodedImage,
  contract: &InputContract,
) -> Result<(PreprocessedTensor, Letterbox), PreprocessError> {
  let (width, height) = (image.width(), image.height());
  if width == 0 || height == 0 {
    return Err(PreprocessError::ZeroArea { width, height });
  }

  let letterbox = Letterbox::fit(width, height, contract.shape);
  let canvas = letterbox_image(image.as_rgb_image(), &letterbox);
  debug!(
    "Letterbox: {}x{} -> {}x{}, 填充 ({}, {})",
    width, height, letterbox.scaled_width, letterbox.scaled_height, letterbox.pad_x, letterbox.pad_y
  );

  let data = pack(&canvas, contract.layout, contract.normalization);
  Ok((
    PreprocessedTensor::new(contract.shape, contract.layout, data),
    letterbox,
  ))
}

fn letterbox_image(source: &RgbImage, letterbox: &Letterbox) -> RgbImage {
  let mut canvas = RgbImage::from_pixel(
    letterbox.target.width,
    letterbox.target.height,
    Rgb([PAD_VALUE; 3]),
  );
  if (letterbox.scaled_width, letterbox.scaled_height) == source.dimensions() {
    image::imageops::overlay(&mut canvas, source, letterbox.pad_x as i64, letterbox.pad_y as i64);
  } else {
    let resized = image::imageops::resize(
      source,
      letterbox.scaled_width,
      letterbox.scaled_height,
      RESIZE_FILTER,
    );
    image::imageops::overlay(&mut canvas, &resized, letterbox.pad_x as i64, letterbox.pad_y as i64);
  }
  canvas
}

fn pack(canvas: &RgbImage, layout: TensorLayout, normalization: Normalization) -> TensorData {
  match normalization {
    Normalization::Raw => TensorData::U8(reorder(canvas, layout, |_, v| v).into_boxed_slice()),
    Normalization::UnitRange => TensorData::F32(
      reorder(canvas, layout, |_, v| v as f32 / 255.0).into_boxed_slice(),
    ),
    Normalization::Standardize { mean, std } => TensorData::F32(
      reorder(canvas, layout, |c, v| (v as f32 / 255.0 - mean[c]) / std[c]).into_boxed_slice(),
    ),
  }
}

/// 按布局重排像素，`map` 接收通道索引与原始像素值
fn reorder<T: Copy + Default>(
  canvas: &RgbImage,
  layout: TensorLayout,
  map: impl Fn(usize, u8) -> T,
) -> Vec<T> {
  let (width, height) = (canvas.width() as usize, canvas.height() as usize);
  let plane = width * height;
  let raw = canvas.as_raw();

  match layout {
    TensorLayout::Nhwc => raw
      .iter()
      .enumerate()
      .map(|(i, &v)| map(i % 3, v))
      .collect(),
    TensorLayout::Nchw => {
      let mut data = vec![T::default(); plane * 3];
      for (i, pixel) in raw.chunks_exact(3).enumerate() {
        for c in 0..3 {
          data[c * plane + i] = map(c, pixel[c]);
        }
      }
      data
    }
  }
}
