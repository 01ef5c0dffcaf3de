// 该文件是 Duanlu （断路） 项目的一部分。
// src/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{codec::DecodedImage, pipeline::Detection};

const BOX_THICKNESS: i32 = 2;
const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

pub struct Draw {
  thickness: i32,
  color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      color: BOX_COLOR,
    }
  }
}

impl Draw {
  pub fn with_color(mut self, color: [u8; 3]) -> Self {
    self.color = color;
    self
  }

  /// 在图像副本上绘制检测框，坐标为原图像素坐标
  pub fn draw_detections(&self, image: &DecodedImage, detections: &[Detection]) -> DecodedImage {
    let mut canvas = image.as_rgb_image().clone();
    for detection in detections {
      self.draw_bbox(&mut canvas, &detection.bbox);
    }
    DecodedImage::from(canvas)
  }

  fn draw_bbox(&self, image: &mut RgbImage, bbox: &[f32; 4]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    // 加粗边框，逐层向内收缩
    for t in 0..self.thickness {
      let (left, top) = (x_min + t, y_min + t);
      let (right, bottom) = (x_max - t, y_max - t);
      if left >= right || top >= bottom {
        break;
      }
      let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
      draw_hollow_rect_mut(image, rect, Rgb(self.color));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(bbox: [f32; 4]) -> Detection {
    Detection {
      bbox,
      class_id: 0,
      label: "breaker".to_string(),
      confidence: 0.9,
    }
  }

  #[test]
  fn draws_border_only() {
    let image = DecodedImage::from(RgbImage::new(20, 20));
    let out = Draw::default().draw_detections(&image, &[detection([2.0, 2.0, 12.0, 12.0])]);
    let rgb = out.as_rgb_image();
    assert_eq!(rgb.get_pixel(2, 2), &Rgb(BOX_COLOR));
    assert_eq!(rgb.get_pixel(3, 7), &Rgb(BOX_COLOR));
    assert_eq!(rgb.get_pixel(7, 7), &Rgb([0, 0, 0]));
    // 原图不受影响
    assert_eq!(image.as_rgb_image().get_pixel(2, 2), &Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_outside_are_clamped() {
    let image = DecodedImage::from(RgbImage::new(8, 8));
    let out = Draw::default()
      .with_color([255, 0, 0])
      .draw_detections(&image, &[detection([-5.0, -5.0, 50.0, 50.0])]);
    assert_eq!(out.as_rgb_image().get_pixel(7, 7), &Rgb([255, 0, 0]));
  }
}
