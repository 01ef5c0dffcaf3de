// 该文件是 Duanlu （断路） 项目的一部分。
// src/pipeline.rs - 推理请求编排
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

//! 单个上传请求的处理流程
//!
//! ```text
//! Received -> Decoded -> Preprocessed -> Inferred -> Formatted -> Completed
//!     \__________\______________\______________\___________\____> Failed(stage, cause)
//!                                            \__> Stored (异步)
//! ```
//!
//! 推理成功后即提交保存，后续阶段超时不会撤回。
//!
//! 任一阶段出错即终止请求，不做重试。解码、预处理、推理都在阻塞线程池上执行；
//! 模型声明为 [`Concurrency::Exclusive`] 时，推理经过单槽闸门串行化，
//! 同一时刻最多一个推理，吞吐量因此受限。

use std::{
  fmt,
  sync::Arc,
  time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  codec::{self, DecodeError, DecodedImage, EncodeError, ImageFormat},
  draw::Draw,
  labels::Labels,
  model::{Concurrency, DetectResult, InferenceError, Model},
  preprocess::{self, Letterbox, PreprocessError},
  storage::{StorageQueue, StoreJob},
};

pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// 一次上传请求，原始字节只被共享引用，不会被修改
#[derive(Debug, Clone)]
pub struct UploadRequest {
  pub bytes: Bytes,
  pub content_type: Option<String>,
  pub filename: Option<String>,
  pub country: Option<String>,
  pub deadline: Option<Instant>,
}

impl UploadRequest {
  pub fn new(bytes: impl Into<Bytes>) -> Self {
    Self {
      bytes: bytes.into(),
      content_type: None,
      filename: None,
      country: None,
      deadline: None,
    }
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
    self.filename = Some(filename.into());
    self
  }

  pub fn with_country(mut self, country: impl Into<String>) -> Self {
    self.country = Some(country.into());
    self
  }

  pub fn with_deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn with_timeout(self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// [x_min, y_min, x_max, y_max]，原图像素坐标
  pub bbox: [f32; 4],
  pub class_id: u32,
  pub label: String,
  pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct InferenceResult {
  pub request_id: Uuid,
  /// 按置信度降序，相同置信度保持模型原始输出顺序
  pub detections: Vec<Detection>,
  pub latency: Duration,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Decode,
  Preprocess,
  Infer,
  Format,
  Annotate,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Decode => "decode",
      Stage::Preprocess => "preprocess",
      Stage::Infer => "infer",
      Stage::Format => "format",
      Stage::Annotate => "annotate",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
  Received,
  Decoded,
  Preprocessed,
  Inferred,
  Formatted,
  Completed,
  Failed(Stage),
}

#[derive(Error, Debug)]
#[error("超过截止时间 {overrun:?}")]
pub struct TimeoutError {
  pub overrun: Duration,
}

#[derive(Error, Debug)]
pub enum FailureCause {
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Preprocess(#[from] PreprocessError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Encode(#[from] EncodeError),
  #[error(transparent)]
  Timeout(#[from] TimeoutError),
  #[error("内部任务异常退出: {0}")]
  Internal(String),
}

impl FailureCause {
  pub fn kind(&self) -> &'static str {
    match self {
      FailureCause::Decode(_) => "DecodeError",
      FailureCause::Preprocess(_) => "PreprocessError",
      FailureCause::Inference(_) => "InferenceError",
      FailureCause::Encode(_) => "EncodeError",
      FailureCause::Timeout(_) => "TimeoutError",
      FailureCause::Internal(_) => "InternalError",
    }
  }
}

#[derive(Error, Debug)]
#[error("请求在 {stage} 阶段失败: {cause}")]
pub struct OrchestratorError {
  pub stage: Stage,
  #[source]
  pub cause: FailureCause,
}

impl OrchestratorError {
  fn new(stage: Stage, cause: impl Into<FailureCause>) -> Self {
    Self {
      stage,
      cause: cause.into(),
    }
  }

  /// 上传内容本身有问题，调用方应返回客户端错误
  pub fn is_client_error(&self) -> bool {
    matches!(
      self.cause,
      FailureCause::Decode(_) | FailureCause::Preprocess(_)
    )
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self.cause, FailureCause::Timeout(_))
  }
}

enum InferenceGate {
  Open,
  Exclusive(Arc<Mutex<()>>),
}

struct Progress {
  request_id: Uuid,
  state: RequestState,
}

impl Progress {
  fn advance(&mut self, state: RequestState) {
    debug!("请求 {}: {:?} -> {:?}", self.request_id, self.state, state);
    self.state = state;
  }

  fn fail(&mut self, error: OrchestratorError) -> OrchestratorError {
    self.advance(RequestState::Failed(error.stage));
    if error.is_client_error() {
      warn!("请求 {} 被拒绝: {}", self.request_id, error);
    } else {
      error!("请求 {} 失败: {}", self.request_id, error);
    }
    error
  }
}

/// 推理流程的协调者，模型句柄在构造时注入
pub struct Orchestrator {
  model: Arc<dyn Model>,
  gate: InferenceGate,
  labels: Labels,
  storage: Option<Arc<StorageQueue>>,
}

impl Orchestrator {
  pub fn new(model: Arc<dyn Model>, labels: Labels) -> Self {
    let gate = match model.concurrency() {
      Concurrency::Shared => InferenceGate::Open,
      Concurrency::Exclusive => {
        info!("模型 {} 不支持并发推理，推理将串行执行", model.name());
        InferenceGate::Exclusive(Arc::new(Mutex::new(())))
      }
    };

    Self {
      model,
      gate,
      labels,
      storage: None,
    }
  }

  pub fn with_storage(mut self, storage: Arc<StorageQueue>) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn model(&self) -> &Arc<dyn Model> {
    &self.model
  }

  pub fn storage(&self) -> Option<&Arc<StorageQueue>> {
    self.storage.as_ref()
  }

  pub async fn handle(&self, request: UploadRequest) -> Result<InferenceResult, OrchestratorError> {
    self.run(request).await.map(|(result, _)| result)
  }

  /// 额外返回绘制了检测框的 PNG 图像
  pub async fn handle_annotated(
    &self,
    request: UploadRequest,
  ) -> Result<(InferenceResult, Vec<u8>), OrchestratorError> {
    let deadline = request.deadline;
    let (result, image) = self.run(request).await?;
    check_deadline(deadline, Stage::Annotate)?;

    let detections = result.detections.clone();
    let png = tokio::task::spawn_blocking(move || {
      let annotated = Draw::default().draw_detections(&image, &detections);
      codec::encode(&annotated, ImageFormat::Png)
    })
    .await
    .map_err(|e| OrchestratorError::new(Stage::Annotate, internal(e)))?
    .map_err(|e| OrchestratorError::new(Stage::Annotate, e))?;

    Ok((result, png))
  }

  async fn run(
    &self,
    request: UploadRequest,
  ) -> Result<(InferenceResult, DecodedImage), OrchestratorError> {
    let started = Instant::now();
    let mut progress = Progress {
      request_id: Uuid::new_v4(),
      state: RequestState::Received,
    };
    debug!(
      "请求 {}: 收到 {} 字节, 类型 {:?}",
      progress.request_id,
      request.bytes.len(),
      request.content_type
    );

    match self.run_stages(&request, &mut progress).await {
      Ok((detections, image)) => {
        let result = InferenceResult {
          request_id: progress.request_id,
          detections,
          latency: started.elapsed(),
          width: image.width(),
          height: image.height(),
        };
        progress.advance(RequestState::Completed);
        info!(
          "请求 {} 完成: {}x{}, {} 个目标, 耗时 {:.2?}",
          result.request_id,
          result.width,
          result.height,
          result.detections.len(),
          result.latency
        );
        Ok((result, image))
      }
      Err(e) => Err(progress.fail(e)),
    }
  }

  async fn run_stages(
    &self,
    request: &UploadRequest,
    progress: &mut Progress,
  ) -> Result<(Vec<Detection>, DecodedImage), OrchestratorError> {
    let deadline = request.deadline;

    check_deadline(deadline, Stage::Decode)?;
    let bytes = request.bytes.clone();
    let content_type = request.content_type.clone();
    let (image, format) =
      tokio::task::spawn_blocking(move || codec::decode_with_format(&bytes, content_type.as_deref()))
        .await
        .map_err(|e| OrchestratorError::new(Stage::Decode, internal(e)))?
        .map_err(|e| OrchestratorError::new(Stage::Decode, e))?;
    progress.advance(RequestState::Decoded);

    check_deadline(deadline, Stage::Preprocess)?;
    let contract = *self.model.contract();
    let (image, tensor, letterbox) = tokio::task::spawn_blocking(move || {
      preprocess::transform(&image, &contract).map(|(tensor, letterbox)| (image, tensor, letterbox))
    })
    .await
    .map_err(|e| OrchestratorError::new(Stage::Preprocess, internal(e)))?
    .map_err(|e| OrchestratorError::new(Stage::Preprocess, e))?;
    progress.advance(RequestState::Preprocessed);

    if !tensor.matches(&contract) {
      error!(
        "预处理输出 {} 与模型输入约定 {} 不符",
        tensor.shape(),
        contract.shape
      );
      return Err(OrchestratorError::new(
        Stage::Infer,
        InferenceError::ShapeMismatch {
          expected: contract.shape,
          actual: tensor.shape(),
        },
      ));
    }

    check_deadline(deadline, Stage::Infer)?;
    let permit = match &self.gate {
      InferenceGate::Open => None,
      InferenceGate::Exclusive(gate) => Some(acquire(gate.clone(), deadline).await?),
    };
    // 等待闸门期间可能已经超时
    check_deadline(deadline, Stage::Infer)?;

    // 闸门随阻塞任务释放，请求被取消时推理仍占用闸门直到结束
    let model = self.model.clone();
    let raw = tokio::task::spawn_blocking(move || {
      let _permit = permit;
      model.infer(&tensor)
    })
    .await
    .map_err(|e| OrchestratorError::new(Stage::Infer, InferenceError::Join(e.to_string())))?
    .map_err(|e| OrchestratorError::new(Stage::Infer, e))?;
    progress.advance(RequestState::Inferred);

    // 推理成功即保存上传，之后的超时不影响保存
    self.submit_storage(request, progress.request_id, format);

    check_deadline(deadline, Stage::Format)?;
    let detections = self.structure(raw, &letterbox);
    progress.advance(RequestState::Formatted);

    Ok((detections, image))
  }

  /// 将模型原始输出映射回原图坐标并排序
  fn structure(&self, raw: DetectResult, letterbox: &Letterbox) -> Vec<Detection> {
    let mut detections: Vec<Detection> = raw
      .items
      .iter()
      .map(|item| Detection {
        bbox: letterbox.to_source(&item.bbox),
        class_id: item.class_id,
        label: self.labels.name(item.class_id),
        confidence: if item.score.is_nan() { 0.0 } else { item.score.clamp(0.0, 1.0) },
      })
      .collect();
    // sort_by 是稳定排序，相同置信度保持原始顺序
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    detections
  }

  fn submit_storage(&self, request: &UploadRequest, request_id: Uuid, format: ImageFormat) {
    let Some(storage) = &self.storage else {
      return;
    };
    let job = StoreJob {
      request_id,
      bytes: request.bytes.clone(),
      suggested_name: request.filename.clone(),
      format,
      country: request
        .country
        .clone()
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
    };
    if let Err(e) = storage.submit(job) {
      warn!("请求 {} 的上传未保存: {}", request_id, e);
    }
  }
}

fn internal(e: JoinError) -> FailureCause {
  FailureCause::Internal(e.to_string())
}

fn check_deadline(deadline: Option<Instant>, stage: Stage) -> Result<(), OrchestratorError> {
  match deadline {
    Some(deadline) => {
      let now = Instant::now();
      if now >= deadline {
        Err(OrchestratorError::new(
          stage,
          TimeoutError {
            overrun: now - deadline,
          },
        ))
      } else {
        Ok(())
      }
    }
    None => Ok(()),
  }
}

async fn acquire(
  gate: Arc<Mutex<()>>,
  deadline: Option<Instant>,
) -> Result<tokio::sync::OwnedMutexGuard<()>, OrchestratorError> {
  match deadline {
    Some(deadline) => {
      tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), gate.lock_owned())
        .await
        .map_err(|_| {
          OrchestratorError::new(
            Stage::Infer,
            TimeoutError {
              overrun: Instant::now().saturating_duration_since(deadline),
            },
          )
        })
    }
    None => Ok(gate.lock_owned().await),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::DetectItem,
    tensor::{InputContract, Normalization, PreprocessedTensor, TensorLayout, TensorShape},
  };
  use image::{Rgb, RgbImage};

  struct Fixed {
    contract: InputContract,
    items: Vec<DetectItem>,
  }

  impl Model for Fixed {
    fn name(&self) -> &str {
      "fixed"
    }

    fn contract(&self) -> &InputContract {
      &self.contract
    }

    fn infer(&self, _input: &PreprocessedTensor) -> Result<DetectResult, InferenceError> {
      Ok(DetectResult::from(self.items.clone()))
    }
  }

  fn fixed(items: Vec<DetectItem>) -> Orchestrator {
    let model = Fixed {
      contract: InputContract {
        shape: TensorShape::new(64, 64),
        layout: TensorLayout::Nhwc,
        normalization: Normalization::Raw,
      },
      items,
    };
    Orchestrator::new(Arc::new(model), Labels::coco())
  }

  fn png(width: u32, height: u32) -> Vec<u8> {
    let image = DecodedImage::from(RgbImage::from_pixel(width, height, Rgb([40, 80, 120])));
    codec::encode(&image, ImageFormat::Png).unwrap()
  }

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      score,
      bbox,
    }
  }

  #[tokio::test]
  async fn detections_are_sorted_stably() {
    let orchestrator = fixed(vec![
      item(1, 0.4, [0.0, 0.0, 0.5, 0.5]),
      item(2, 0.9, [0.0, 0.0, 0.5, 0.5]),
      item(3, 0.4, [0.0, 0.0, 0.5, 0.5]),
      item(4, 0.7, [0.0, 0.0, 0.5, 0.5]),
    ]);
    let result = orchestrator.handle(UploadRequest::new(png(64, 32))).await.unwrap();
    let order: Vec<u32> = result.detections.iter().map(|d| d.class_id).collect();
    assert_eq!(order, vec![2, 4, 1, 3]);
    assert_eq!(result.detections[0].label, "bicycle");
  }

  #[tokio::test]
  async fn boxes_are_mapped_to_source_pixels() {
    // 64x32 的图像在 64x64 输入上下方各填充 16 像素
    let orchestrator = fixed(vec![item(0, 0.8, [0.25, 0.25, 0.75, 0.75])]);
    let result = orchestrator.handle(UploadRequest::new(png(64, 32))).await.unwrap();
    assert_eq!((result.width, result.height), (64, 32));
    let bbox = result.detections[0].bbox;
    for (got, want) in bbox.iter().zip([16.0, 0.0, 48.0, 32.0]) {
      assert!((got - want).abs() < 1e-3, "{:?}", bbox);
    }
  }

  #[tokio::test]
  async fn out_of_range_scores_are_clamped() {
    let orchestrator = fixed(vec![item(0, 1.7, [0.0, 0.0, 1.0, 1.0]), item(0, f32::NAN, [0.0; 4])]);
    let result = orchestrator.handle(UploadRequest::new(png(8, 8))).await.unwrap();
    assert_eq!(result.detections[0].confidence, 1.0);
    assert_eq!(result.detections[1].confidence, 0.0);
  }

  #[tokio::test]
  async fn decode_failure_is_tagged_with_stage() {
    let err = fixed(vec![]).handle(UploadRequest::new(Vec::new())).await.unwrap_err();
    assert_eq!(err.stage, Stage::Decode);
    assert!(err.is_client_error());
    assert_eq!(err.cause.kind(), "DecodeError");
  }

  #[tokio::test]
  async fn expired_deadline_short_circuits() {
    let request = UploadRequest::new(png(8, 8)).with_deadline(Instant::now());
    let err = fixed(vec![]).handle(request).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.stage, Stage::Decode);
    assert!(!err.is_client_error());
  }

  #[tokio::test]
  async fn annotated_output_is_png() {
    let orchestrator = fixed(vec![item(0, 0.8, [0.1, 0.1, 0.9, 0.9])]);
    let (result, png_bytes) = orchestrator
      .handle_annotated(UploadRequest::new(png(40, 30)))
      .await
      .unwrap();
    let decoded = codec::decode(&png_bytes, Some("image/png")).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (result.width, result.height));
  }
}
