// 该文件是 Duanlu （断路） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::tensor::{InputContract, PreprocessedTensor, TensorShape};

/// 模型是否允许并发调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
  /// 推理不修改内部状态，可并行调用
  Shared,
  /// 底层运行时非线程安全，同一时刻只能有一个推理
  Exclusive,
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入张量与模型约定不符: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    expected: TensorShape,
    actual: TensorShape,
  },
  #[error("推理运行时错误: {0}")]
  Runtime(String),
  #[error("推理任务异常退出: {0}")]
  Join(String),
}

pub trait Model: Send + Sync {
  fn name(&self) -> &str;

  fn contract(&self) -> &InputContract;

  fn concurrency(&self) -> Concurrency {
    Concurrency::Shared
  }

  /// 每次调用都是无状态的，不得修改模型权重
  fn infer(&self, input: &PreprocessedTensor) -> Result<DetectResult, InferenceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，相对模型输入归一化
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 启动时传给模型后端的参数
#[derive(Debug, Clone, Copy)]
pub struct ModelOptions {
  pub input_shape: TensorShape,
  pub confidence: f32,
}

impl Default for ModelOptions {
  fn default() -> Self {
    Self {
      input_shape: TensorShape::new(640, 640),
      confidence: 0.5,
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("不支持的模型方案: {0}")]
  UnsupportedScheme(String),
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 模型加载错误: {0}")]
  Yolo26(#[from] Yolo26Error),
}

/// 根据模型 URL 的方案选择后端并加载，进程启动时调用一次
pub fn load(url: &Url, options: &ModelOptions) -> Result<Arc<dyn Model>, ModelLoadError> {
  info!("加载模型: {}", url);

  #[cfg(feature = "model_yolo26")]
  {
    use crate::{FromUrl, FromUrlWithScheme};

    if url.scheme() == Yolo26Builder::SCHEME {
      let model = Yolo26Builder::from_url(url)?
        .input_shape(options.input_shape)
        .confidence(options.confidence)
        .build()?;
      return Ok(Arc::new(model));
    }
  }

  let _ = options;
  Err(ModelLoadError::UnsupportedScheme(url.scheme().to_string()))
}

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};
