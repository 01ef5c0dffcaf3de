// 该文件是 Duanlu （断路） 项目的一部分。
// src/model/yolo26.rs - RKNN YOLO26 模型后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Mutex;

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{Concurrency, DetectItem, DetectResult, InferenceError, Model},
  tensor::{InputContract, Normalization, PreprocessedTensor, TensorLayout, TensorShape},
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_STRIDES: [u32; 3] = [8, 16, 32];

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型文件读取错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("输入尺寸 {0} 不能被最大步长 32 整除")]
  InputShapeError(TensorShape),
}

impl From<rknpu::Error> for Yolo26Error {
  fn from(err: rknpu::Error) -> Self {
    Yolo26Error::RknnError(err)
  }
}

impl Yolo26Error {
  fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

pub struct Yolo26Builder {
  model_path: String,
  flags: InitFlags,
  input_shape: TensorShape,
  confidence: f32,
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26Builder {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Yolo26Builder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      input_shape: TensorShape::new(640, 640),
      confidence: 0.5,
    })
  }
}

impl Yolo26Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn input_shape(mut self, shape: TensorShape) -> Self {
    self.input_shape = shape;
    self
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn build(self) -> Result<Yolo26, Yolo26Error> {
    let max_stride = YOLO26_STRIDES[YOLO26_STRIDES.len() - 1];
    if self.input_shape.width % max_stride != 0 || self.input_shape.height % max_stride != 0 {
      return Err(Yolo26Error::InputShapeError(self.input_shape));
    }

    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(Yolo26Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolo26Error::invalid(&msg, rknpu::Error::InvalidModel));
    }
    info!("模型加载完成");

    Ok(Yolo26 {
      context: Mutex::new(context),
      contract: InputContract {
        shape: self.input_shape,
        layout: TensorLayout::Nhwc,
        normalization: Normalization::Raw,
      },
      confidence: self.confidence,
    })
  }
}

pub struct Yolo26 {
  context: Mutex<Context>,
  contract: InputContract,
  confidence: f32,
}

impl Model for Yolo26 {
  fn name(&self) -> &str {
    "yolo26"
  }

  fn contract(&self) -> &InputContract {
    &self.contract
  }

  fn concurrency(&self) -> Concurrency {
    Concurrency::Exclusive
  }

  fn infer(&self, input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
    let data = input
      .as_u8()
      .filter(|_| input.matches(&self.contract))
      .ok_or(InferenceError::ShapeMismatch {
        expected: self.contract.shape,
        actual: input.shape(),
      })?;

    let context = self
      .context
      .lock()
      .map_err(|_| InferenceError::Runtime("RKNN 上下文锁已损坏".to_string()))?;

    debug!("设置模型输入");
    context
      .set_input(0, data, rknpu::TensorFormat::NHWC, TensorType::UInt8)
      .map_err(runtime_error)?;

    debug!("执行模型推理");
    context.run().map_err(runtime_error)?;

    let output = context.get_outputs().map_err(runtime_error)?;
    Ok(self.postprocess(&output))
  }
}

fn runtime_error(e: rknpu::Error) -> InferenceError {
  InferenceError::Runtime(e.to_string())
}

/// 根据张量大小匹配回归和分类输出
/// RKNN 的输出顺序可能与导出时不同
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl Yolo26 {
  fn postprocess(&self, output: &rknpu::Output) -> DetectResult {
    let input_w = self.contract.shape.width as f32;
    let input_h = self.contract.shape.height as f32;
    let mut items = Vec::new();

    for (head_idx, stride) in YOLO26_STRIDES.into_iter().enumerate() {
      let map_h = (self.contract.shape.height / stride) as usize;
      let map_w = (self.contract.shape.width / stride) as usize;
      let spatial = map_h * map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = YOLO26_CLASS_NUM * spatial;

      let (tensor1, tensor2) = match (
        output.get_f32(head_idx * 2),
        output.get_f32(head_idx * 2 + 1),
      ) {
        (Ok(t1), Ok(t2)) => (t1, t2),
        (Err(e), _) | (_, Err(e)) => {
          error!("检测头 {}: 获取输出失败: {}", head_idx, e);
          continue;
        }
      };

      let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected)
      else {
        error!(
          "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
          head_idx,
          tensor1.len(),
          tensor2.len(),
          reg_expected,
          cls_expected
        );
        continue;
      };

      let stride = stride as f32;
      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let (max_logit, class_id) = (0..YOLO26_CLASS_NUM)
            .map(|c| (cls[c * spatial + idx], c as u32))
            .fold((f32::MIN, 0), |best, cur| if cur.0 > best.0 { cur } else { best });
          let score = sigmoid(max_logit);
          if score <= self.confidence {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;

          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

          items.push(DetectItem {
            class_id,
            score,
            bbox: [xmin / input_w, ymin / input_h, xmax / input_w, ymax / input_h],
          });
        }
      }
    }

    debug!("检测到 {} 个物体", items.len());
    DetectResult::from(items)
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
