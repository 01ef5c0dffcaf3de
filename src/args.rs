// 该文件是 Duanlu （断路） 项目的一部分。
// src/args.rs - 服务启动参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use url::Url;

use crate::{model::ModelOptions, server::ServerConfig, storage::DEFAULT_QUEUE_CAPACITY, tensor::TensorShape};

/// Duanlu 检测服务参数配置，启动时读取一次
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型 URL，例如 yolo26:///opt/models/yolo26n.rknn
  #[arg(long, env = "DUANLU_MODEL", value_name = "MODEL")]
  pub model: Url,

  /// 上传文件保存根目录
  #[arg(long, env = "DUANLU_UPLOADS", value_name = "DIR")]
  pub uploads: PathBuf,

  /// 模型输入尺寸，格式为 WxH
  #[arg(long, env = "DUANLU_INPUT_SHAPE", default_value = "640x640", value_name = "WxH")]
  pub input_shape: TensorShape,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "DUANLU_CONFIDENCE", default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// 标签文件，每行一个类别名；缺省使用 COCO 80 类
  #[arg(long, env = "DUANLU_LABELS", value_name = "FILE")]
  pub labels: Option<PathBuf>,

  /// 监听地址
  #[arg(long, env = "DUANLU_LISTEN", default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub listen: SocketAddr,

  /// 单次上传最大字节数
  #[arg(long, env = "DUANLU_MAX_UPLOAD_BYTES", default_value_t = 10 * 1024 * 1024, value_name = "BYTES")]
  pub max_upload_bytes: usize,

  /// 单个请求的处理时限（毫秒），缺省不限制
  #[arg(long, env = "DUANLU_DEADLINE_MS", value_name = "MS")]
  pub deadline_ms: Option<u64>,

  /// HTTP worker 数量，缺省为 CPU 核数
  #[arg(long, env = "DUANLU_WORKERS", value_name = "COUNT")]
  pub workers: Option<usize>,

  /// 存储队列容量，积压超过该数量的上传不再保存
  #[arg(long, env = "DUANLU_STORAGE_QUEUE", default_value_t = DEFAULT_QUEUE_CAPACITY, value_name = "COUNT")]
  pub storage_queue: usize,

  /// 静态前端目录，挂载在根路径
  #[arg(long, env = "DUANLU_FRONTEND", value_name = "DIR")]
  pub frontend: Option<PathBuf>,
}

impl Args {
  pub fn model_options(&self) -> ModelOptions {
    ModelOptions {
      input_shape: self.input_shape,
      confidence: self.confidence,
    }
  }

  pub fn server_config(&self) -> ServerConfig {
    ServerConfig {
      max_upload_bytes: self.max_upload_bytes,
      deadline: self.deadline_ms.map(Duration::from_millis),
      frontend: self.frontend.clone(),
    }
  }
}
