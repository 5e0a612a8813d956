// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 轨迹预览合成
//! Renders stored trails onto a base frame.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use super::Trajectory;
use crate::types::{id_to_color, BBox, ObjectId};

/// 预览绘制参数
#[derive(Clone, Debug)]
pub struct PreviewStyle {
    pub stride: usize,         // 每隔 stride 个点绘制一次
    pub centroid_radius: i32,  // 中心点半径
    pub focus_color: Rgb<u8>, // 焦点框颜色
}

impl Default for PreviewStyle {
    fn default() -> Self {
        Self {
            stride: 3,
            centroid_radius: 6,
            focus_color: Rgb([255, 0, 0]),
        }
    }
}

fn outline(canvas: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    let rect = Rect::at(bbox.x1, bbox.y1).of_size(bbox.width() as u32, bbox.height() as u32);
    draw_hollow_rect_mut(canvas, rect, color);
}

/// 合成预览帧
///
/// 1. 保存焦点框下的原始区域
/// 2. 按目标号升序, 每条轨迹取第 `stride-1, 2*stride-1, …` 个点, 贴回裁剪图并画框和中心点
/// 3. 焦点区域贴回原图, 用焦点颜色描框
///
/// 同样的输入总是得到同样的像素。
pub fn render_preview(
    base: &RgbImage,
    trails: &BTreeMap<ObjectId, Arc<Trajectory>>,
    focus: &BBox,
    style: &PreviewStyle,
) -> RgbImage {
    let mut canvas = base.clone();
    let focus_region = imageops::crop_imm(
        base,
        focus.x1.max(0) as u32,
        focus.y1.max(0) as u32,
        focus.width() as u32,
        focus.height() as u32,
    )
    .to_image();

    let stride = style.stride.max(1);
    // 所有目标的轨迹都绘制, 焦点目标自身的轨迹也包括在内
    for (&object_id, trajectory) in trails {
        let color = id_to_color(object_id);
        for point in trajectory.points().iter().skip(stride - 1).step_by(stride) {
            let bbox = &point.bbox;
            imageops::replace(&mut canvas, point.crop.as_ref(), bbox.x1 as i64, bbox.y1 as i64);
            outline(&mut canvas, bbox, color);
            draw_filled_circle_mut(&mut canvas, bbox.center(), style.centroid_radius, color);
        }
    }

    imageops::replace(
        &mut canvas,
        &focus_region,
        focus.x1.max(0) as i64,
        focus.y1.max(0) as i64,
    );
    outline(&mut canvas, focus, style.focus_color);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TrajectoryPoint;
    use crate::test_util::textured_frames;

    fn trail(frames: &[RgbImage], x: i32) -> Arc<Trajectory> {
        let mut t = Trajectory::new();
        for (i, frame) in frames.iter().enumerate() {
            let dx = x + 4 * i as i32;
            let bbox = BBox::new(dx, 20, dx + 16, 40).unwrap();
            t.push(TrajectoryPoint::cut(frame, bbox, i as u32 * 2).unwrap())
                .unwrap();
        }
        Arc::new(t)
    }

    #[test]
    fn test_focus_region_is_restored() {
        let frames = textured_frames(6, 120, 80, (3, 0));
        let mut trails = BTreeMap::new();
        trails.insert(1, trail(&frames, 10));
        trails.insert(2, trail(&frames, 60));

        let base = &frames[0];
        let focus = BBox::new(14, 20, 30, 40).unwrap();
        let out = render_preview(base, &trails, &focus, &PreviewStyle::default());

        assert_eq!(out.dimensions(), base.dimensions());
        // inside the focus outline the base pixels survive
        for y in 21..39 {
            for x in 15..29 {
                assert_eq!(out.get_pixel(x, y), base.get_pixel(x, y));
            }
        }
        assert_eq!(*out.get_pixel(14, 20), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_only_every_stride_point_is_drawn() {
        let frames = textured_frames(3, 120, 80, (0, 0));
        let mut trails = BTreeMap::new();
        trails.insert(5, trail(&frames, 10));
        let style = PreviewStyle {
            stride: 3,
            ..Default::default()
        };
        // focus far away from the trail
        let focus = BBox::new(100, 60, 110, 70).unwrap();
        let out = render_preview(&frames[0], &trails, &focus, &style);

        let color = id_to_color(5);
        // third point (index 2) starts at x = 18
        assert_eq!(*out.get_pixel(18, 30), color);
        // first point's left edge is untouched
        assert_eq!(out.get_pixel(10, 30), frames[0].get_pixel(10, 30));
    }
}
