// 该文件是 Duanlu （断路） 项目的一部分。
// src/storage.rs - 上传文件存储
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

//! 原始上传的持久化
//!
//! 文件按日期分目录保存：
//!
//! ```text
//! <root>/2026/10/19/08-30-12-<uuid>_<原文件名>.jpg
//! <root>/upload_log.jsonl
//! ```
//!
//! 文件以 create-new 方式打开，已有文件不会被覆盖。写入由 [`StorageQueue`]
//! 在后台完成，失败只记录日志与计数，不影响推理响应。

use std::{
  io,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
  fs,
  io::AsyncWriteExt,
  sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
  },
  task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::ImageFormat;

pub const METADATA_LOG: &str = "upload_log.jsonl";
const MAX_STEM_LEN: usize = 64;
/// 等待写入的上传数量上限
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// 同时进行的写入数量上限
pub const MAX_CONCURRENT_WRITES: usize = 4;

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("创建目录 {path} 失败: {source}")]
  CreateDir { path: PathBuf, source: io::Error },
  #[error("写入文件 {path} 失败: {source}")]
  Write { path: PathBuf, source: io::Error },
  #[error("读取目录 {path} 失败: {source}")]
  ReadDir { path: PathBuf, source: io::Error },
  #[error("元数据日志写入失败: {0}")]
  MetadataLog(io::Error),
  #[error("元数据序列化失败: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("存储队列已关闭")]
  QueueClosed,
  #[error("存储队列已满")]
  QueueFull,
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
  pub path: PathBuf,
  pub saved_filename: String,
  pub size: usize,
  pub timestamp: DateTime<Utc>,
}

/// 一次待写入的上传
#[derive(Debug, Clone)]
pub struct StoreJob {
  pub request_id: Uuid,
  pub bytes: Bytes,
  pub suggested_name: Option<String>,
  pub format: ImageFormat,
  pub country: String,
}

#[derive(Serialize)]
struct MetadataEntry<'a> {
  timestamp: DateTime<Utc>,
  request_id: Uuid,
  original_filename: &'a str,
  saved_filename: &'a str,
  country: &'a str,
}

pub struct StorageManager {
  root: PathBuf,
  log_lock: Mutex<()>,
}

impl StorageManager {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      log_lock: Mutex::new(()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// 幂等地创建上传根目录
  pub async fn ensure_root(&self) -> Result<(), StorageError> {
    ensure_dir(&self.root).await
  }

  fn dated_dir(&self, now: &DateTime<Utc>) -> PathBuf {
    self
      .root
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
  }

  pub async fn store(&self, job: &StoreJob) -> Result<StoredUpload, StorageError> {
    let now = Utc::now();
    let directory = self.dated_dir(&now);
    ensure_dir(&directory).await?;

    let saved_filename = file_name(&now, job);
    let path = directory.join(&saved_filename);
    write_new(&path, &job.bytes).await?;
    debug!("写入 {} 字节到 {}", job.bytes.len(), path.display());

    let relative = path
      .strip_prefix(&self.root)
      .unwrap_or(&path)
      .to_string_lossy()
      .into_owned();
    self
      .append_metadata(&MetadataEntry {
        timestamp: now,
        request_id: job.request_id,
        original_filename: job.suggested_name.as_deref().unwrap_or_default(),
        saved_filename: &relative,
        country: &job.country,
      })
      .await?;

    Ok(StoredUpload {
      path,
      saved_filename,
      size: job.bytes.len(),
      timestamp: now,
    })
  }

  async fn append_metadata(&self, entry: &MetadataEntry<'_>) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let _guard = self.log_lock.lock().await;
    let mut file = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(self.root.join(METADATA_LOG))
      .await
      .map_err(StorageError::MetadataLog)?;
    file.write_all(&line).await.map_err(StorageError::MetadataLog)?;
    file.flush().await.map_err(StorageError::MetadataLog)?;
    Ok(())
  }

  /// 统计已保存的图像文件数量
  pub async fn count(&self) -> Result<usize, StorageError> {
    let mut count = 0;
    let mut pending = vec![self.root.clone()];

    while let Some(dir) = pending.pop() {
      let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
        Err(source) => return Err(StorageError::ReadDir { path: dir, source }),
      };
      loop {
        let entry = match entries.next_entry().await {
          Ok(Some(entry)) => entry,
          Ok(None) => break,
          Err(source) => return Err(StorageError::ReadDir { path: dir, source }),
        };
        let file_type = entry.file_type().await.map_err(|source| StorageError::ReadDir {
          path: entry.path(),
          source,
        })?;
        if file_type.is_dir() {
          pending.push(entry.path());
        } else if file_type.is_file() && is_image_file(&entry.path()) {
          count += 1;
        }
      }
    }

    Ok(count)
  }
}

async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
  fs::create_dir_all(path)
    .await
    .map_err(|source| StorageError::CreateDir {
      path: path.to_path_buf(),
      source,
    })
}

async fn write_new(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
  let write_error = |source| StorageError::Write {
    path: path.to_path_buf(),
    source,
  };

  let mut file = fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(path)
    .await
    .map_err(write_error)?;

  let written = async {
    file.write_all(bytes).await?;
    file.sync_all().await
  }
  .await;

  if let Err(source) = written {
    // 清理写了一半的文件
    drop(file);
    if let Err(e) = fs::remove_file(path).await {
      warn!("清理未完成的文件 {} 失败: {}", path.display(), e);
    }
    return Err(write_error(source));
  }
  Ok(())
}

fn file_name(now: &DateTime<Utc>, job: &StoreJob) -> String {
  let stem = job
    .suggested_name
    .as_deref()
    .map(sanitize_filename::sanitize)
    .and_then(|name| {
      Path::new(&name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().chars().take(MAX_STEM_LEN).collect::<String>())
    })
    .filter(|stem| !stem.is_empty());

  match stem {
    Some(stem) => format!(
      "{}-{}_{}.{}",
      now.format("%H-%M-%S"),
      Uuid::new_v4(),
      stem,
      job.format.extension()
    ),
    None => format!(
      "{}-{}.{}",
      now.format("%H-%M-%S"),
      Uuid::new_v4(),
      job.format.extension()
    ),
  }
}

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .and_then(ImageFormat::from_extension)
    .is_some()
}

/// 存储结果计数，供日志之外观测存储失败
#[derive(Debug, Default)]
pub struct StorageStats {
  stored: AtomicU64,
  failed: AtomicU64,
  pending: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageStatsSnapshot {
  pub stored: u64,
  pub failed: u64,
  pub pending: u64,
}

impl StorageStats {
  pub fn snapshot(&self) -> StorageStatsSnapshot {
    StorageStatsSnapshot {
      stored: self.stored.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      pending: self.pending.load(Ordering::Relaxed),
    }
  }
}

enum Command {
  Store(StoreJob),
  Drain,
}

/// 后台存储队列，写入不阻塞响应，关闭时等待所有写入完成
///
/// 队列有界：积压达到容量后新的上传直接计为失败，不占用内存
pub struct StorageQueue {
  manager: Arc<StorageManager>,
  tx: mpsc::Sender<Command>,
  worker: std::sync::Mutex<Option<JoinHandle<()>>>,
  stats: Arc<StorageStats>,
}

impl StorageQueue {
  /// 必须在 tokio 运行时内调用
  pub fn spawn(manager: Arc<StorageManager>) -> Self {
    Self::with_capacity(manager, DEFAULT_QUEUE_CAPACITY)
  }

  /// 必须在 tokio 运行时内调用，`capacity` 至少为 1
  pub fn with_capacity(manager: Arc<StorageManager>, capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(StorageStats::default());
    let worker = tokio::spawn(run_worker(manager.clone(), stats.clone(), rx));

    Self {
      manager,
      tx,
      worker: std::sync::Mutex::new(Some(worker)),
      stats,
    }
  }

  pub fn manager(&self) -> &Arc<StorageManager> {
    &self.manager
  }

  pub fn stats(&self) -> StorageStatsSnapshot {
    self.stats.snapshot()
  }

  pub fn submit(&self, job: StoreJob) -> Result<(), StorageError> {
    self.stats.pending.fetch_add(1, Ordering::Relaxed);
    let request_id = job.request_id;
    let err = match self.tx.try_send(Command::Store(job)) {
      Ok(()) => return Ok(()),
      Err(TrySendError::Full(_)) => {
        warn!("请求 {} 的上传被丢弃: 存储队列已满", request_id);
        StorageError::QueueFull
      }
      Err(TrySendError::Closed(_)) => {
        error!("请求 {} 的上传未能入队: 存储队列已关闭", request_id);
        StorageError::QueueClosed
      }
    };
    self.stats.pending.fetch_sub(1, Ordering::Relaxed);
    self.stats.failed.fetch_add(1, Ordering::Relaxed);
    Err(err)
  }

  /// 停止接收新任务并等待已入队的写入全部完成
  pub async fn shutdown(&self) {
    // 队列满时等待空位，保证关闭指令排在已入队任务之后
    let _ = self.tx.send(Command::Drain).await;
    let worker = self
      .worker
      .lock()
      .map(|mut worker| worker.take())
      .unwrap_or_default();
    if let Some(worker) = worker {
      info!("等待 {} 个存储任务完成", self.stats.pending.load(Ordering::Relaxed));
      if let Err(e) = worker.await {
        error!("存储队列异常退出: {}", e);
      }
      info!("存储队列已关闭");
    }
  }
}

async fn run_worker(
  manager: Arc<StorageManager>,
  stats: Arc<StorageStats>,
  mut rx: mpsc::Receiver<Command>,
) {
  let mut tasks = JoinSet::new();

  loop {
    tokio::select! {
      // 写入数达到上限时不再取任务，积压留在有界通道里
      command = rx.recv(), if tasks.len() < MAX_CONCURRENT_WRITES => match command {
        Some(Command::Store(job)) => {
          let manager = manager.clone();
          let stats = stats.clone();
          tasks.spawn(async move { store_one(&manager, &stats, job).await });
        }
        // 关闭后 recv 仍会返回已缓冲的任务，随后返回 None
        Some(Command::Drain) => rx.close(),
        None => break,
      },
      Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
        if let Err(e) = joined {
          error!("存储任务异常退出: {}", e);
        }
      }
    }
  }

  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      error!("存储任务异常退出: {}", e);
    }
  }
}

async fn store_one(manager: &StorageManager, stats: &StorageStats, job: StoreJob) {
  match manager.store(&job).await {
    Ok(stored) => {
      stats.stored.fetch_add(1, Ordering::Relaxed);
      info!(
        "已保存请求 {} 的上传: {} ({} 字节)",
        job.request_id,
        stored.path.display(),
        stored.size
      );
    }
    Err(e) => {
      stats.failed.fetch_add(1, Ordering::Relaxed);
      error!("请求 {} 的上传保存失败: {}", job.request_id, e);
    }
  }
  stats.pending.fetch_sub(1, Ordering::Relaxed);
}
