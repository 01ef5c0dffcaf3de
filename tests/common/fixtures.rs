// 该文件是 Duanlu （断路） 项目的一部分。
// tests/common/fixtures.rs - 测试图像与存储夹具
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

use std::{path::Path, sync::Arc};

use duanlu::{
  codec::{self, DecodedImage, ImageFormat},
  storage::{StorageManager, StorageQueue},
};
use image::{ImageBuffer, Rgb};

pub const BOUNDARY: &str = "duanlu-test-boundary";

/// 按给定格式编码一张纯色图像
pub fn solid_image(width: u32, height: u32, color: [u8; 3], format: ImageFormat) -> Vec<u8> {
  let img = ImageBuffer::from_pixel(width, height, Rgb(color));
  codec::encode(&DecodedImage::from(img), format).expect("测试图像编码失败")
}

pub fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
  solid_image(width, height, color, ImageFormat::Png)
}

/// 以 `root` 为根目录启动存储队列，必须在运行时内调用
pub fn storage_queue(root: impl AsRef<Path>) -> Arc<StorageQueue> {
  Arc::new(StorageQueue::spawn(Arc::new(StorageManager::new(
    root.as_ref(),
  ))))
}

/// 无法创建的存储根目录，其父路径是普通文件
pub fn broken_root(dir: &tempfile::TempDir) -> std::path::PathBuf {
  let blocker = dir.path().join("blocker");
  std::fs::write(&blocker, b"not a directory").expect("占位文件创建失败");
  blocker.join("uploads")
}

pub struct Part<'a> {
  pub name: &'a str,
  pub filename: Option<&'a str>,
  pub content_type: Option<&'a str>,
  pub data: &'a [u8],
}

impl<'a> Part<'a> {
  pub fn file(filename: &'a str, content_type: &'a str, data: &'a [u8]) -> Self {
    Self {
      name: "file",
      filename: Some(filename),
      content_type: Some(content_type),
      data,
    }
  }

  pub fn text(name: &'a str, value: &'a str) -> Self {
    Self {
      name,
      filename: None,
      content_type: None,
      data: value.as_bytes(),
    }
  }
}

/// 构造以 [`BOUNDARY`] 分隔的 `multipart/form-data` 请求体
pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
  let mut body = Vec::new();
  for part in parts {
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.name);
    if let Some(filename) = part.filename {
      disposition.push_str(&format!("; filename=\"{}\"", filename));
    }
    body.extend_from_slice(disposition.as_bytes());
    body.extend_from_slice(b"\r\n");
    if let Some(content_type) = part.content_type {
      body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(part.data);
    body.extend_from_slice(b"\r\n");
  }
  body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
  body
}

pub fn multipart_content_type() -> String {
  format!("multipart/form-data; boundary={}", BOUNDARY)
}
