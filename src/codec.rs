// 该文件是 Duanlu （断路） 项目的一部分。
// src/codec.rs - 图像编解码
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

use std::io::Cursor;

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("上传内容为空")]
  Empty,
  #[error("不支持的内容类型: {0}")]
  UnsupportedContentType(String),
  #[error("无法识别的图像容器")]
  UnrecognizedContainer,
  #[error("图像数据损坏或被截断: {0}")]
  Malformed(image::ImageError),
}

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("图像编码错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 支持的图像格式，闭集
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
  Jpeg,
  Png,
  Gif,
}

impl ImageFormat {
  pub const ALL: [ImageFormat; 3] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Gif];

  /// 根据 MIME 类型选择格式，忽略参数部分（如 `; charset=...`）
  pub fn from_content_type(content_type: &str) -> Option<Self> {
    let essence = content_type
      .split(';')
      .next()
      .unwrap_or_default()
      .trim()
      .to_ascii_lowercase();
    match essence.as_str() {
      "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
      "image/png" => Some(ImageFormat::Png),
      "image/gif" => Some(ImageFormat::Gif),
      _ => None,
    }
  }

  pub fn from_extension(extension: &str) -> Option<Self> {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
      "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
      "png" => Some(ImageFormat::Png),
      "gif" => Some(ImageFormat::Gif),
      _ => None,
    }
  }

  /// 通过文件头魔数识别格式
  pub fn sniff(bytes: &[u8]) -> Option<Self> {
    match image::guess_format(bytes).ok()? {
      image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
      image::ImageFormat::Png => Some(ImageFormat::Png),
      image::ImageFormat::Gif => Some(ImageFormat::Gif),
      _ => None,
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      ImageFormat::Jpeg => "jpg",
      ImageFormat::Png => "png",
      ImageFormat::Gif => "gif",
    }
  }

  pub fn mime(&self) -> &'static str {
    match self {
      ImageFormat::Jpeg => "image/jpeg",
      ImageFormat::Png => "image/png",
      ImageFormat::Gif => "image/gif",
    }
  }

  fn as_image_format(&self) -> image::ImageFormat {
    match self {
      ImageFormat::Jpeg => image::ImageFormat::Jpeg,
      ImageFormat::Png => image::ImageFormat::Png,
      ImageFormat::Gif => image::ImageFormat::Gif,
    }
  }
}

/// 解码后的图像，内部统一为 RGB 通道顺序
#[derive(Debug, Clone)]
pub struct DecodedImage {
  image: RgbImage,
}

impl From<RgbImage> for DecodedImage {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl DecodedImage {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// NHWC 排列的像素数据
  pub fn pixels(&self) -> &[u8] {
    self.image.as_raw()
  }

  pub fn as_rgb_image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_rgb_image(self) -> RgbImage {
    self.image
  }
}

/// 解析声明的内容类型；缺省或 `application/octet-stream` 时按文件头识别
pub fn resolve_format(bytes: &[u8], content_type: Option<&str>) -> Result<ImageFormat, DecodeError> {
  match content_type.map(str::trim).filter(|ct| !ct.is_empty()) {
    Some(ct) if !ct.starts_with("application/octet-stream") => {
      ImageFormat::from_content_type(ct).ok_or_else(|| DecodeError::UnsupportedContentType(ct.to_string()))
    }
    _ => ImageFormat::sniff(bytes).ok_or(DecodeError::UnrecognizedContainer),
  }
}

pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Result<DecodedImage, DecodeError> {
  decode_with_format(bytes, content_type).map(|(image, _)| image)
}

/// 同 [`decode`]，额外返回实际采用的容器格式
pub fn decode_with_format(
  bytes: &[u8],
  content_type: Option<&str>,
) -> Result<(DecodedImage, ImageFormat), DecodeError> {
  if bytes.is_empty() {
    return Err(DecodeError::Empty);
  }

  let format = resolve_format(bytes, content_type)?;
  let image = image::load_from_memory_with_format(bytes, format.as_image_format())
    .map_err(DecodeError::Malformed)?;
  debug!(
    "解码完成: {:?} {}x{}, 原始颜色类型 {:?}",
    format,
    image.width(),
    image.height(),
    image.color()
  );

  Ok((
    DecodedImage {
      image: image.into_rgb8(),
    },
    format,
  ))
}

pub fn encode(image: &DecodedImage, format: ImageFormat) -> Result<Vec<u8>, EncodeError> {
  let mut buffer = Cursor::new(Vec::new());
  image
    .image
    .write_to(&mut buffer, format.as_image_format())?;
  Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn gradient(width: u32, height: u32) -> DecodedImage {
    DecodedImage::from(RgbImage::from_fn(width, height, |x, y| {
      Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
  }

  #[test]
  fn round_trip_preserves_dimensions() {
    for format in ImageFormat::ALL {
      for (w, h) in [(1, 1), (17, 5), (640, 480)] {
        let bytes = encode(&gradient(w, h), format).unwrap();
        let decoded = decode(&bytes, Some(format.mime())).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (w, h), "{:?}", format);
        assert_eq!(decoded.channels(), 3);
      }
    }
  }

  #[test]
  fn png_round_trip_is_lossless() {
    let source = gradient(32, 16);
    let bytes = encode(&source, ImageFormat::Png).unwrap();
    let decoded = decode(&bytes, None).unwrap();
    assert_eq!(decoded.pixels(), source.pixels());
  }

  #[test]
  fn empty_buffer_is_rejected() {
    assert!(matches!(decode(&[], Some("image/png")), Err(DecodeError::Empty)));
    assert!(matches!(decode(&[], None), Err(DecodeError::Empty)));
  }

  #[test]
  fn truncated_data_is_malformed() {
    let bytes = encode(&gradient(64, 64), ImageFormat::Png).unwrap();
    let truncated = &bytes[..bytes.len() / 2];
    assert!(matches!(
      decode(truncated, Some("image/png")),
      Err(DecodeError::Malformed(_))
    ));
  }

  #[test]
  fn unknown_container_is_rejected() {
    let text = b"definitely not an image";
    assert!(matches!(
      decode(text, None),
      Err(DecodeError::UnrecognizedContainer)
    ));
    assert!(matches!(
      decode(text, Some("application/octet-stream")),
      Err(DecodeError::UnrecognizedContainer)
    ));
  }

  #[test]
  fn unsupported_content_type_fails_fast() {
    let bytes = encode(&gradient(4, 4), ImageFormat::Png).unwrap();
    assert!(matches!(
      decode(&bytes, Some("image/webp")),
      Err(DecodeError::UnsupportedContentType(ct)) if ct == "image/webp"
    ));
  }

  #[test]
  fn content_type_parameters_are_ignored() {
    assert_eq!(
      ImageFormat::from_content_type("IMAGE/PNG; foo=bar"),
      Some(ImageFormat::Png)
    );
    assert_eq!(ImageFormat::from_extension(".JPEG"), Some(ImageFormat::Jpeg));
    assert_eq!(ImageFormat::from_extension("bmp"), None);
  }
}
