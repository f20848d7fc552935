//! Overlay drawing for emitted frames.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, DetectionRecord, FaceRecord};

pub const PERSON_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const OBJECT_COLOR: Rgb<u8> = Rgb([0, 120, 255]);
pub const KNOWN_FACE_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
pub const UNKNOWN_FACE_COLOR: Rgb<u8> = Rgb([255, 40, 40]);

const THICKNESS: u32 = 2;

/// Draw detection and face outlines onto `image` in place.
pub fn draw_overlay(image: &mut RgbImage, objects: &[DetectionRecord], faces: &[FaceRecord]) {
    for det in objects {
        let color = if det.is_primary() {
            PERSON_COLOR
        } else {
            OBJECT_COLOR
        };
        outline(image, &det.bbox, color);
    }
    for face in faces {
        let color = if face.identity.is_some() {
            KNOWN_FACE_COLOR
        } else {
            UNKNOWN_FACE_COLOR
        };
        outline(image, &face.bbox.to_bbox(), color);
    }
}

fn outline(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let Some(clipped) = bbox.clip(image.width(), image.height()) else {
        return;
    };
    for inset in 0..THICKNESS {
        let x = clipped.x1.round() as i32 + inset as i32;
        let y = clipped.y1.round() as i32 + inset as i32;
        let w = (clipped.width().round() as u32).saturating_sub(2 * inset);
        let h = (clipped.height().round() as u32).saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        draw_hollow_rect_mut(image, Rect::at(x, y).of_size(w, h), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::FaceBox;

    #[test]
    fn outlines_are_drawn_and_interior_untouched() {
        let mut image = RgbImage::new(100, 100);
        let person = DetectionRecord::new("person", 0.9, BoundingBox::new(10.0, 10.0, 50.0, 90.0));
        let face = FaceRecord::new(FaceBox::new(60.0, 90.0, 80.0, 70.0));
        draw_overlay(&mut image, &[person], &[face]);

        assert_eq!(*image.get_pixel(10, 10), PERSON_COLOR);
        assert_eq!(*image.get_pixel(11, 40), PERSON_COLOR);
        assert_eq!(*image.get_pixel(30, 50), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(70, 60), UNKNOWN_FACE_COLOR);
    }

    #[test]
    fn boxes_outside_the_image_are_skipped() {
        let mut image = RgbImage::new(20, 20);
        let det = DetectionRecord::new("cup", 0.9, BoundingBox::new(30.0, 30.0, 40.0, 40.0));
        draw_overlay(&mut image, &[det], &[]);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
