// 该文件是 Duanlu （断路） 项目的一部分。
// tests/common/models.rs - 测试用模型
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

use std::{
  sync::atomic::{AtomicUsize, Ordering},
  time::Duration,
};

use duanlu::{
  model::{Concurrency, DetectItem, DetectResult, InferenceError, Model},
  tensor::{InputContract, Normalization, PreprocessedTensor, TensorLayout, TensorShape},
};

pub fn contract(width: u32, height: u32) -> InputContract {
  InputContract {
    shape: TensorShape::new(width, height),
    layout: TensorLayout::Nhwc,
    normalization: Normalization::Raw,
  }
}

/// 返回固定的检测结果，并记录调用次数
pub struct FixedModel {
  contract: InputContract,
  items: Vec<DetectItem>,
  calls: AtomicUsize,
}

impl FixedModel {
  pub fn new(contract: InputContract, items: Vec<DetectItem>) -> Self {
    Self {
      contract,
      items,
      calls: AtomicUsize::new(0),
    }
  }

  /// 任何图像都没有检测结果
  pub fn empty(contract: InputContract) -> Self {
    Self::new(contract, Vec::new())
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Model for FixedModel {
  fn name(&self) -> &str {
    "fixed"
  }

  fn contract(&self) -> &InputContract {
    &self.contract
  }

  fn infer(&self, _input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Ok(DetectResult::from(self.items.clone()))
  }
}

/// 以中心像素的红色通道作为类别编号，结果可以对应回输入图像
pub struct ColorModel {
  contract: InputContract,
}

impl ColorModel {
  pub fn new(contract: InputContract) -> Self {
    Self { contract }
  }
}

impl Model for ColorModel {
  fn name(&self) -> &str {
    "color"
  }

  fn contract(&self) -> &InputContract {
    &self.contract
  }

  fn infer(&self, input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
    let data = input
      .as_u8()
      .ok_or_else(|| InferenceError::Runtime("需要 u8 张量".to_string()))?;
    let shape = input.shape();
    let (w, h) = (shape.width as usize, shape.height as usize);
    let center = ((h / 2) * w + w / 2) * 3;
    Ok(DetectResult::from(vec![DetectItem {
      class_id: data[center] as u32,
      score: 0.9,
      bbox: [0.25, 0.25, 0.75, 0.75],
    }]))
  }
}

/// 推理时休眠，并记录观察到的最大并发数
pub struct SlowModel {
  contract: InputContract,
  delay: Duration,
  concurrency: Concurrency,
  active: AtomicUsize,
  max_active: AtomicUsize,
}

impl SlowModel {
  pub fn new(contract: InputContract, delay: Duration, concurrency: Concurrency) -> Self {
    Self {
      contract,
      delay,
      concurrency,
      active: AtomicUsize::new(0),
      max_active: AtomicUsize::new(0),
    }
  }

  pub fn max_active(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }
}

impl Model for SlowModel {
  fn name(&self) -> &str {
    "slow"
  }

  fn contract(&self) -> &InputContract {
    &self.contract
  }

  fn concurrency(&self) -> Concurrency {
    self.concurrency
  }

  fn infer(&self, _input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(now, Ordering::SeqCst);
    std::thread::sleep(self.delay);
    self.active.fetch_sub(1, Ordering::SeqCst);
    Ok(DetectResult::default())
  }
}

/// 推理总是失败
pub struct FailingModel {
  contract: InputContract,
}

impl FailingModel {
  pub fn new(contract: InputContract) -> Self {
    Self { contract }
  }
}

impl Model for FailingModel {
  fn name(&self) -> &str {
    "failing"
  }

  fn contract(&self) -> &InputContract {
    &self.contract
  }

  fn infer(&self, _input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
    Err(InferenceError::Runtime("设备已断开".to_string()))
  }
}
