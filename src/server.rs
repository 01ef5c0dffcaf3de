// 该文件是 Duanlu （断路） 项目的一部分。
// src/server.rs - HTTP 服务接口
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

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use actix_multipart::Multipart;
use actix_web::{
  HttpRequest, HttpResponse, ResponseError,
  http::{StatusCode, header},
  web,
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  codec::{self, DecodeError, ImageFormat},
  pipeline::{Orchestrator, OrchestratorError, UNKNOWN_COUNTRY, UploadRequest},
  response::{self, ErrorBody},
  storage::{StorageError, StorageQueue, StoreJob},
};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_COUNTRY_CHARS: usize = 50;
const MAX_FORM_FIELD_BYTES: usize = 4 * 1024;
const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("上传内容超过 {limit} 字节限制")]
  PayloadTooLarge { limit: usize },
  #[error("请求体读取失败: {0}")]
  Payload(String),
  #[error("{0}")]
  Validation(String),
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Pipeline(#[from] OrchestratorError),
  #[error(transparent)]
  Storage(#[from] StorageError),
}

impl ApiError {
  fn kind(&self) -> &'static str {
    match self {
      ApiError::PayloadTooLarge { .. } => "PayloadTooLarge",
      ApiError::Payload(_) => "PayloadError",
      ApiError::Validation(_) => "ValidationError",
      ApiError::Decode(_) => "DecodeError",
      ApiError::Pipeline(e) => e.cause.kind(),
      ApiError::Storage(_) => "StorageError",
    }
  }
}

impl ResponseError for ApiError {
  fn status_code(&self) -> StatusCode {
    match self {
      ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
      ApiError::Payload(_) | ApiError::Validation(_) | ApiError::Decode(_) => StatusCode::BAD_REQUEST,
      ApiError::Pipeline(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
      ApiError::Pipeline(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
      ApiError::Pipeline(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn error_response(&self) -> HttpResponse {
    let body = match self {
      ApiError::Pipeline(e) => ErrorBody::from(e),
      other => ErrorBody::new(other.kind(), other.to_string()),
    };
    HttpResponse::build(self.status_code()).json(body)
  }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub max_upload_bytes: usize,
  pub deadline: Option<Duration>,
  pub frontend: Option<PathBuf>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
      deadline: None,
      frontend: None,
    }
  }
}

/// 所有 worker 共享的服务状态
pub struct AppState {
  orchestrator: Arc<Orchestrator>,
  storage: Arc<StorageQueue>,
  config: ServerConfig,
}

impl AppState {
  pub fn new(orchestrator: Arc<Orchestrator>, storage: Arc<StorageQueue>, config: ServerConfig) -> Self {
    Self {
      orchestrator,
      storage,
      config,
    }
  }

  async fn upload_request(&self, req: &HttpRequest, payload: web::Payload) -> Result<UploadRequest, ApiError> {
    let upload = read_upload(req, payload, self.config.max_upload_bytes).await?;
    let mut request = UploadRequest::new(upload.bytes);
    request.content_type = upload.content_type;
    request.filename = upload.filename;
    request.country = upload.country;
    if let Some(timeout) = self.config.deadline {
      request = request.with_timeout(timeout);
    }
    Ok(request)
  }
}

/// 注册全部路由，静态前端目录最后挂载在根路径
pub fn configure(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
  move |cfg| {
    let frontend = state.config.frontend.clone();
    cfg
      .app_data(state)
      .route("/detect", web::post().to(detect))
      .route("/detect/annotated", web::post().to(detect_annotated))
      .route("/upload", web::post().to(upload))
      .route("/count", web::get().to(count))
      .route("/stats", web::get().to(stats));

    if let Some(dir) = frontend {
      info!("挂载静态前端目录: {}", dir.display());
      cfg.service(actix_files::Files::new("/", dir).index_file("index.html"));
    }
  }
}

async fn detect(
  req: HttpRequest,
  payload: web::Payload,
  state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
  let request = state.upload_request(&req, payload).await?;
  let result = state.orchestrator.handle(request).await?;
  Ok(HttpResponse::Ok().json(response::format(&result)))
}

async fn detect_annotated(
  req: HttpRequest,
  payload: web::Payload,
  state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
  let request = state.upload_request(&req, payload).await?;
  let (result, png) = state.orchestrator.handle_annotated(request).await?;
  Ok(
    HttpResponse::Ok()
      .content_type(ImageFormat::Png.mime())
      .insert_header((REQUEST_ID_HEADER, result.request_id.to_string()))
      .body(png),
  )
}

/// 只保存上传内容，不做推理
async fn upload(
  req: HttpRequest,
  payload: web::Payload,
  state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
  let upload = read_upload(&req, payload, state.config.max_upload_bytes).await?;
  if upload.bytes.is_empty() {
    return Err(DecodeError::Empty.into());
  }
  let format = codec::resolve_format(&upload.bytes, upload.content_type.as_deref())?;

  let job = StoreJob {
    request_id: Uuid::new_v4(),
    bytes: upload.bytes,
    suggested_name: upload.filename,
    format,
    country: upload.country.unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
  };
  let stored = state.storage.manager().store(&job).await?;
  info!("上传 {} 已保存为 {}", job.request_id, stored.saved_filename);

  Ok(HttpResponse::Ok().json(json!({
    "request_id": job.request_id,
    "filename": stored.saved_filename,
  })))
}

async fn count(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
  let count = state.storage.manager().count().await?;
  Ok(HttpResponse::Ok().json(json!({ "count": count })))
}

async fn stats(state: web::Data<AppState>) -> HttpResponse {
  HttpResponse::Ok().json(state.storage.stats())
}

struct Upload {
  bytes: Bytes,
  content_type: Option<String>,
  filename: Option<String>,
  country: Option<String>,
}

async fn read_upload(req: &HttpRequest, payload: web::Payload, limit: usize) -> Result<Upload, ApiError> {
  let content_type = req
    .headers()
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);

  let is_multipart = content_type
    .as_deref()
    .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"));
  if is_multipart {
    return read_multipart(Multipart::new(req.headers(), payload), limit).await;
  }

  if let Some(length) = req
    .headers()
    .get(header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<usize>().ok())
  {
    if length > limit {
      return Err(ApiError::PayloadTooLarge { limit });
    }
  }

  let bytes = read_limited(payload, limit).await?;
  debug!("收到原始请求体 {} 字节", bytes.len());
  Ok(Upload {
    bytes,
    content_type,
    filename: None,
    country: None,
  })
}

async fn read_multipart(mut multipart: Multipart, limit: usize) -> Result<Upload, ApiError> {
  let mut file = None;
  let mut country = None;
  // 所有表单字段共用同一个字节预算
  let mut budget = Budget::new(limit);

  while let Some(field) = multipart.try_next().await.map_err(payload_error)? {
    let disposition = field.content_disposition();
    let name = disposition.and_then(|cd| cd.get_name()).map(str::to_string);
    let filename = disposition
      .and_then(|cd| cd.get_filename())
      .filter(|f| !f.is_empty())
      .map(str::to_string);

    match name.as_deref() {
      Some("file") => {
        if file.is_some() {
          return Err(ApiError::Validation("重复的 file 表单字段".to_string()));
        }
        let content_type = field.content_type().map(|m| m.essence_str().to_string());
        let bytes = budget.read(field, limit).await?;
        debug!("收到表单文件 {:?}, {} 字节", filename, bytes.len());
        file = Some((bytes, content_type, filename));
      }
      Some("country") => {
        let raw = budget.read(field, MAX_FORM_FIELD_BYTES).await?;
        country = Some(validate_country(&String::from_utf8_lossy(&raw))?);
      }
      other => {
        debug!("忽略表单字段 {:?}", other);
        budget.read(field, limit).await?;
      }
    }
  }

  let (bytes, content_type, filename) =
    file.ok_or_else(|| ApiError::Validation("缺少 file 表单字段".to_string()))?;
  if let Some(filename) = &filename {
    validate_extension(filename)?;
  }

  Ok(Upload {
    bytes,
    content_type,
    filename,
    country,
  })
}

struct Budget {
  limit: usize,
  remaining: usize,
}

impl Budget {
  fn new(limit: usize) -> Self {
    Self {
      limit,
      remaining: limit,
    }
  }

  /// 单个字段不超过 `field_limit`，累计不超过总限制
  async fn read<S, E>(&mut self, stream: S, field_limit: usize) -> Result<Bytes, ApiError>
  where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
  {
    let (allowed, reported) = if field_limit < self.remaining {
      (field_limit, field_limit)
    } else {
      (self.remaining, self.limit)
    };
    let bytes = read_limited(stream, allowed).await.map_err(|e| match e {
      ApiError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge { limit: reported },
      e => e,
    })?;
    self.remaining -= bytes.len();
    Ok(bytes)
  }
}

async fn read_limited<S, E>(stream: S, limit: usize) -> Result<Bytes, ApiError>
where
  S: Stream<Item = Result<Bytes, E>>,
  E: fmt::Display,
{
  let mut stream = std::pin::pin!(stream);
  let mut body = BytesMut::new();
  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(payload_error)?;
    if body.len() + chunk.len() > limit {
      warn!("上传内容超过 {} 字节限制", limit);
      return Err(ApiError::PayloadTooLarge { limit });
    }
    body.extend_from_slice(&chunk);
  }
  Ok(body.freeze())
}

fn payload_error(e: impl fmt::Display) -> ApiError {
  ApiError::Payload(e.to_string())
}

/// 国家字段最多保留 50 个字符，只允许字母、空白和连字符
pub fn validate_country(raw: &str) -> Result<String, ApiError> {
  let country: String = raw.chars().take(MAX_COUNTRY_CHARS).collect();
  let valid = country == UNKNOWN_COUNTRY
    || (!country.is_empty()
      && country
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c.is_whitespace() || c == '-'));
  if valid {
    Ok(country)
  } else {
    Err(ApiError::Validation(format!("国家字段格式无效: {:?}", country)))
  }
}

pub fn validate_extension(filename: &str) -> Result<(), ApiError> {
  let extension = std::path::Path::new(filename)
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);
  match extension {
    Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
    _ => Err(ApiError::Validation(format!(
      "文件扩展名无效: {}, 只允许 .jpg .jpeg .png .gif",
      filename
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn country_rules() {
    assert_eq!(validate_country("Unknown").unwrap(), "Unknown");
    assert_eq!(validate_country("New Zealand").unwrap(), "New Zealand");
    assert_eq!(validate_country("Guinea-Bissau").unwrap(), "Guinea-Bissau");
    assert!(validate_country("").is_err());
    assert!(validate_country("Côte d'Ivoire").is_err());
    assert!(validate_country("<script>").is_err());

    let long = "a".repeat(80);
    assert_eq!(validate_country(&long).unwrap().len(), MAX_COUNTRY_CHARS);
  }

  #[test]
  fn extension_rules() {
    assert!(validate_extension("breaker.JPG").is_ok());
    assert!(validate_extension("a.b.gif").is_ok());
    assert!(validate_extension("breaker").is_err());
    assert!(validate_extension("breaker.webp").is_err());
  }

  fn chunks(sizes: &[usize]) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    let chunks: Vec<_> = sizes.iter().map(|&n| Ok(Bytes::from(vec![0u8; n]))).collect();
    futures::stream::iter(chunks)
  }

  #[tokio::test]
  async fn form_fields_share_one_budget() {
    let mut budget = Budget::new(100);
    assert_eq!(budget.read(chunks(&[30, 30]), 100).await.unwrap().len(), 60);
    assert_eq!(budget.read(chunks(&[8]), 16).await.unwrap().len(), 8);

    // 字段限制小于剩余预算时报告字段限制
    assert!(matches!(
      budget.read(chunks(&[20]), 16).await,
      Err(ApiError::PayloadTooLarge { limit: 16 })
    ));
    // 单个字段未超限，但累计超出总限制
    assert!(matches!(
      budget.read(chunks(&[40]), 100).await,
      Err(ApiError::PayloadTooLarge { limit: 100 })
    ));
  }

  #[test]
  fn status_mapping() {
    assert_eq!(
      ApiError::PayloadTooLarge { limit: 1 }.status_code(),
      StatusCode::PAYLOAD_TOO_LARGE
    );
    assert_eq!(ApiError::Decode(DecodeError::Empty).status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
      ApiError::Storage(StorageError::QueueClosed).status_code(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
  }
}
