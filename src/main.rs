// 该文件是 Duanlu （断路） 项目的一部分。
// src/main.rs - 检测服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use duanlu::{
  args::Args,
  labels::Labels,
  model,
  pipeline::Orchestrator,
  server::{self, AppState},
  storage::{StorageManager, StorageQueue},
};

#[actix_web::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("Duanlu 检测服务");
  info!("模型: {}", args.model);
  info!("上传目录: {}", args.uploads.display());
  info!("模型输入尺寸: {}", args.input_shape);
  info!("置信度阈值: {}", args.confidence);
  info!("监听地址: {}", args.listen);
  info!("存储队列容量: {}", args.storage_queue);

  let labels = match &args.labels {
    Some(path) => Labels::from_file(path).context("标签文件加载失败")?,
    None => Labels::coco(),
  };

  // 模型加载失败时直接退出，不对外提供服务
  let model = model::load(&args.model, &args.model_options()).context("模型加载失败")?;
  info!("模型 {} 已就绪, 输入约定 {:?}", model.name(), model.contract());

  let manager = Arc::new(StorageManager::new(&args.uploads));
  if let Err(e) = manager.ensure_root().await {
    warn!("上传目录不可用，上传将无法保存: {}", e);
  }
  let storage = Arc::new(StorageQueue::with_capacity(manager, args.storage_queue));

  let orchestrator = Arc::new(Orchestrator::new(model, labels).with_storage(storage.clone()));
  let state = web::Data::new(AppState::new(
    orchestrator,
    storage.clone(),
    args.server_config(),
  ));

  let mut http = HttpServer::new(move || {
    App::new()
      .wrap(middleware::Logger::default())
      .configure(server::configure(state.clone()))
  });
  if let Some(workers) = args.workers {
    http = http.workers(workers);
  }

  info!("开始监听 {}", args.listen);
  http
    .bind(args.listen)
    .with_context(|| format!("无法绑定 {}", args.listen))?
    .run()
    .await?;

  info!("服务已停止，等待存储队列写完");
  storage.shutdown().await;
  info!("退出");

  Ok(())
}
