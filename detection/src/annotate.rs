//! Burns detection boxes into the frame before it travels downstream.
use image::{Rgb, RgbImage};
use mcmot_messages::Detection;

const BOX_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const PREDICTED_COLOUR: Rgb<u8> = Rgb([255, 160, 0]);
const THICKNESS: u32 = 2;

pub(crate) fn annotate(image: &mut RgbImage, detections: &[Detection], predicted: bool) {
    let colour = if predicted { PREDICTED_COLOUR } else { BOX_COLOUR };
    for detection in detections {
        draw_rect(image, detection.bbox, colour);
    }
}

fn draw_rect(image: &mut RgbImage, bbox: [f32; 4], colour: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1);

    let x0 = clamp_x(bbox[0]);
    let y0 = clamp_y(bbox[1]);
    let x1 = clamp_x(bbox[0] + bbox[2]);
    let y1 = clamp_y(bbox[1] + bbox[3]);

    for t in 0..THICKNESS {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(height - 1), colour);
            image.put_pixel(x, y1.saturating_sub(t), colour);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(width - 1), y, colour);
            image.put_pixel(x1.saturating_sub(t), y, colour);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            score: 0.9,
            class_id: "car".to_owned(),
        }
    }

    #[test]
    fn box_edges_are_painted() {
        let mut image = RgbImage::new(32, 32);
        annotate(&mut image, &[detection([4.0, 4.0, 10.0, 10.0])], false);
        assert_eq!(*image.get_pixel(4, 4), BOX_COLOUR);
        assert_eq!(*image.get_pixel(14, 4), BOX_COLOUR);
        assert_eq!(*image.get_pixel(4, 14), BOX_COLOUR);
        // The interior stays untouched.
        assert_eq!(*image.get_pixel(9, 9), Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_beyond_the_border_are_clamped() {
        let mut image = RgbImage::new(16, 16);
        annotate(&mut image, &[detection([-5.0, -5.0, 100.0, 100.0])], true);
        assert_eq!(*image.get_pixel(0, 0), PREDICTED_COLOUR);
        assert_eq!(*image.get_pixel(15, 15), PREDICTED_COLOUR);
    }
}
