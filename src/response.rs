// 该文件是 Duanlu （断路） 项目的一部分。
// src/response.rs - 推理结果的对外响应格式
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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{InferenceResult, OrchestratorError};

const CONFIDENCE_DECIMALS: i32 = 4;
const BOX_DECIMALS: i32 = 2;
const LATENCY_DECIMALS: i32 = 3;

/// 字段顺序即序列化顺序，对外保持稳定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
  pub request_id: Uuid,
  pub detections: Vec<DetectionBody>,
  pub width: u32,
  pub height: u32,
  pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBody {
  #[serde(rename = "box")]
  pub bbox: [f64; 4],
  pub label: String,
  pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub stage: Option<String>,
  pub message: String,
}

impl ErrorBody {
  pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      error: error.into(),
      stage: None,
      message: message.into(),
    }
  }
}

impl From<&OrchestratorError> for ErrorBody {
  fn from(err: &OrchestratorError) -> Self {
    Self {
      error: err.cause.kind().to_string(),
      stage: Some(err.stage.to_string()),
      message: err.cause.to_string(),
    }
  }
}

pub fn format(result: &InferenceResult) -> DetectionResponse {
  DetectionResponse {
    request_id: result.request_id,
    detections: result
      .detections
      .iter()
      .map(|d| DetectionBody {
        bbox: d.bbox.map(|v| round(v as f64, BOX_DECIMALS)),
        label: d.label.clone(),
        confidence: round(d.confidence as f64, CONFIDENCE_DECIMALS),
      })
      .collect(),
    width: result.width,
    height: result.height,
    latency_ms: round(result.latency.as_secs_f64() * 1000.0, LATENCY_DECIMALS),
  }
}

fn round(value: f64, decimals: i32) -> f64 {
  let factor = 10f64.powi(decimals);
  (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::Detection;
  use std::time::Duration;

  fn result(detections: Vec<Detection>) -> InferenceResult {
    InferenceResult {
      request_id: Uuid::nil(),
      detections,
      latency: Duration::from_micros(12_345_678),
      width: 640,
      height: 480,
    }
  }

  #[test]
  fn fields_are_rounded() {
    let response = format(&result(vec![Detection {
      bbox: [1.234_5, 2.0, 300.999, 479.996],
      class_id: 0,
      label: "person".to_string(),
      confidence: 0.876_54,
    }]));
    let d = &response.detections[0];
    assert_eq!(d.bbox, [1.23, 2.0, 301.0, 480.0]);
    assert_eq!(d.confidence, 0.8765);
    assert_eq!(response.latency_ms, 12345.678);
  }

  #[test]
  fn field_order_is_stable() {
    let json = serde_json::to_string(&format(&result(vec![Detection {
      bbox: [0.0, 0.0, 1.0, 1.0],
      class_id: 2,
      label: "car".to_string(),
      confidence: 0.5,
    }])))
    .unwrap();
    let keys = ["\"request_id\"", "\"detections\"", "\"box\"", "\"label\"", "\"confidence\"", "\"width\"", "\"height\"", "\"latency_ms\""];
    let positions: Vec<usize> = keys.iter().map(|k| json.find(k).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", json);
  }

  #[test]
  fn empty_detections_serialize_as_array() {
    let value = serde_json::to_value(format(&result(vec![]))).unwrap();
    assert_eq!(value["detections"], serde_json::json!([]));
    assert_eq!(value["width"], 640);
  }
}
