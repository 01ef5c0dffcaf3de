// 该文件是 Duanlu （断路） 项目的一部分。
// src/tensor.rs - 模型输入张量定义
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

use std::{fmt, str::FromStr};

pub const RGB_CHANNELS: usize = 3;

/// 模型输入的空间尺寸，通道数固定为 RGB 三通道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
  pub width: u32,
  pub height: u32,
}

impl TensorShape {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn numel(&self) -> usize {
    RGB_CHANNELS * self.width as usize * self.height as usize
  }
}

impl fmt::Display for TensorShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

impl FromStr for TensorShape {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (w, h) = s
      .split_once(['x', 'X'])
      .ok_or_else(|| format!("形状格式应为 WxH，实际为 '{}'", s))?;
    let width: u32 = w.trim().parse().map_err(|e| format!("宽度无效: {}", e))?;
    let height: u32 = h.trim().parse().map_err(|e| format!("高度无效: {}", e))?;
    if width == 0 || height == 0 {
      return Err(format!("形状不能为零: {}", s));
    }
    Ok(Self { width, height })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nhwc,
  Nchw,
}

/// 像素值映射方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
  /// 原始 u8 像素值，用于量化模型
  Raw,
  /// 除以 255 映射到 [0, 1]
  UnitRange,
  /// 先映射到 [0, 1]，再按通道做 (x - mean) / std
  Standardize { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
  pub fn imagenet() -> Self {
    Normalization::Standardize {
      mean: [0.485, 0.456, 0.406],
      std: [0.229, 0.224, 0.225],
    }
  }
}

/// 模型声明的输入约定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputContract {
  pub shape: TensorShape,
  pub layout: TensorLayout,
  pub normalization: Normalization,
}

#[derive(Debug, Clone)]
pub enum TensorData {
  U8(Box<[u8]>),
  F32(Box<[f32]>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::U8(data) => data.len(),
      TensorData::F32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone)]
pub struct PreprocessedTensor {
  shape: TensorShape,
  layout: TensorLayout,
  data: TensorData,
}

impl PreprocessedTensor {
  pub(crate) fn new(shape: TensorShape, layout: TensorLayout, data: TensorData) -> Self {
    debug_assert_eq!(data.len(), shape.numel());
    Self {
      shape,
      layout,
      data,
    }
  }

  pub fn shape(&self) -> TensorShape {
    self.shape
  }

  pub fn layout(&self) -> TensorLayout {
    self.layout
  }

  pub fn data(&self) -> &TensorData {
    &self.data
  }

  pub fn as_u8(&self) -> Option<&[u8]> {
    match &self.data {
      TensorData::U8(data) => Some(data),
      TensorData::F32(_) => None,
    }
  }

  pub fn as_f32(&self) -> Option<&[f32]> {
    match &self.data {
      TensorData::F32(data) => Some(data),
      TensorData::U8(_) => None,
    }
  }

  /// 形状与布局是否符合约定，数据长度也一并校验
  pub fn matches(&self, contract: &InputContract) -> bool {
    self.shape == contract.shape
      && self.layout == contract.layout
      && self.data.len() == contract.shape.numel()
  }
}
