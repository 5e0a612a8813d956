// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 跟踪核心数据结构定义
/// Data structures shared by trackers, runner and session store
use std::fmt;
use std::str::FromStr;

use image::Rgb;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

/// 外部分配的标注目标ID
pub type ObjectId = u64;

// ========== 边界框 ==========

/// 角点形式的整数边界框 (x1, y1) - (x2, y2), 右下角不包含
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Self> {
        let bbox = Self { x1, y1, x2, y2 };
        bbox.validate()?;
        Ok(bbox)
    }

    /// 从 (x, y, w, h) 创建
    pub fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Result<Self> {
        Self::new(x, y, x + w, y + h)
    }

    pub fn validate(&self) -> Result<()> {
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(TrackError::invalid(format!(
                "malformed box {self}: expected x1<x2 and y1<y2"
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn to_rect(&self) -> RectF {
        RectF {
            x: self.x1 as f32,
            y: self.y1 as f32,
            w: self.width() as f32,
            h: self.height() as f32,
        }
    }

    /// 跟踪器输出 → 帧内整数框; 裁剪后为空则返回 None
    pub fn from_rect(rect: &RectF, frame_width: u32, frame_height: u32) -> Option<Self> {
        if !(rect.x.is_finite() && rect.y.is_finite() && rect.w.is_finite() && rect.h.is_finite())
        {
            return None;
        }
        let x = rect.x.round() as i32;
        let y = rect.y.round() as i32;
        let unclamped = Self {
            x1: x,
            y1: y,
            x2: x + rect.w.round() as i32,
            y2: y + rect.h.round() as i32,
        };
        unclamped.clamp_to(frame_width, frame_height)
    }

    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        let (w, h) = (frame_width as i32, frame_height as i32);
        let clamped = Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        };
        clamped.validate().ok().map(|_| clamped)
    }

    pub fn fits_in(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x1 >= 0
            && self.y1 >= 0
            && self.x2 <= frame_width as i32
            && self.y2 <= frame_height as i32
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{},{})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// "x1,y1,x2,y2"
impl FromStr for BBox {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        let coords = s
            .split(',')
            .map(|v| v.trim().parse::<i32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TrackError::invalid(format!("box `{s}`: {e}")))?;
        match coords.as_slice() {
            [x1, y1, x2, y2] => Self::new(*x1, *y1, *x2, *y2),
            _ => Err(TrackError::invalid(format!(
                "box `{s}`: expected 4 coordinates"
            ))),
        }
    }
}

/// 跟踪器内部使用的浮点框 (x, y, w, h)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct RectF {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl RectF {
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

// ========== 颜色 ==========

/// 根据ID生成不同颜色
pub fn id_to_color(id: ObjectId) -> Rgb<u8> {
    let hue = ((id % 4096) as f32 * 137.508) % 360.0; // 黄金角度采样
    let (r, g, b) = hsv_to_rgb(hue, 0.8, 0.9);
    Rgb([r, g, b])
}

/// HSV转RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_validation() {
        assert!(BBox::new(100, 100, 200, 200).is_ok());
        assert!(BBox::new(200, 100, 100, 200).is_err());
        assert!(BBox::new(10, 10, 10, 20).is_err());
        assert!(matches!(
            BBox::from_xywh(0, 0, 0, 5),
            Err(TrackError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rect_to_box_clamps_to_frame() {
        let rect = RectF {
            x: -5.4,
            y: 10.6,
            w: 30.0,
            h: 500.0,
        };
        let bbox = BBox::from_rect(&rect, 64, 48).unwrap();
        assert_eq!(bbox, BBox::new(0, 11, 25, 48).unwrap());

        let outside = RectF {
            x: 100.0,
            y: 0.0,
            w: 10.0,
            h: 10.0,
        };
        assert!(BBox::from_rect(&outside, 64, 48).is_none());
    }

    #[test]
    fn test_parse_box() {
        let bbox: BBox = "100, 100,200,200".parse().unwrap();
        assert_eq!(bbox, BBox::new(100, 100, 200, 200).unwrap());
        assert!("1,2,3".parse::<BBox>().is_err());
        assert!("a,b,c,d".parse::<BBox>().is_err());
    }

    #[test]
    fn test_id_colors_are_stable() {
        assert_eq!(id_to_color(42), id_to_color(42));
        assert_ne!(id_to_color(1), id_to_color(2));
    }
}
