// 该文件是 Duanlu （断路） 项目的一部分。
// src/bin/oneshot.rs - 单张图片推理工具
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use duanlu::{
  codec::ImageFormat,
  labels::Labels,
  model::{self, ModelOptions},
  pipeline::{Orchestrator, UploadRequest},
  response,
  tensor::TensorShape,
};

/// 对单张图片运行完整检测流程并输出 JSON 结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型 URL
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图片
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,
  /// 绘制检测框后的 PNG 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,
  /// 模型输入尺寸
  #[arg(long, default_value = "640x640", value_name = "WxH")]
  pub input_shape: TensorShape,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 标签文件
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入图片: {}", args.input.display());

  let labels = match &args.labels {
    Some(path) => Labels::from_file(path)?,
    None => Labels::coco(),
  };
  let options = ModelOptions {
    input_shape: args.input_shape,
    confidence: args.confidence,
  };
  let model = model::load(&args.model, &options)?;
  let orchestrator = Orchestrator::new(model, labels);

  let bytes = tokio::fs::read(&args.input)
    .await
    .with_context(|| format!("无法读取 {}", args.input.display()))?;
  let mut request = UploadRequest::new(bytes);
  if let Some(format) = args
    .input
    .extension()
    .and_then(|e| e.to_str())
    .and_then(ImageFormat::from_extension)
  {
    request = request.with_content_type(format.mime());
  }

  info!("开始推理...");
  let result = match &args.output {
    Some(output) => {
      let (result, png) = orchestrator.handle_annotated(request).await?;
      tokio::fs::write(output, png)
        .await
        .with_context(|| format!("无法写入 {}", output.display()))?;
      info!("标注结果已保存到 {}", output.display());
      result
    }
    None => orchestrator.handle(request).await?,
  };

  println!("{}", serde_json::to_string_pretty(&response::format(&result))?);
  Ok(())
}
