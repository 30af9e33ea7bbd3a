//! Detection rendering and transport encoding.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::config::AnnotationSettings;
use crate::detect::Detection;

// Label strip sizing when no font is loaded (rough per-character estimate).
const LABEL_CHAR_WIDTH: f32 = 0.55;
const LABEL_PADDING: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Burns boxes and labels into a copy of the image, then encodes it as
/// base64 JPEG.
///
/// Output is a pure function of the image, the detections and the settings.
pub struct Annotator {
    font: Option<FontArc>,
    font_scale: PxScale,
    line_thickness: u32,
    jpeg_quality: u8,
}

impl Default for Annotator {
    fn default() -> Self {
        let settings = AnnotationSettings::default();
        Self {
            font: None,
            font_scale: PxScale::from(settings.font_size),
            line_thickness: settings.line_thickness,
            jpeg_quality: settings.jpeg_quality,
        }
    }
}

impl Annotator {
    pub fn new(settings: &AnnotationSettings) -> Result<Self> {
        let font = match &settings.font_path {
            Some(path) => {
                let data = std::fs::read(path)
                    .with_context(|| format!("failed to read font {}", path.display()))?;
                let font = FontArc::try_from_vec(data)
                    .map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))?;
                Some(font)
            }
            None => None,
        };
        Ok(Self {
            font,
            font_scale: PxScale::from(settings.font_size),
            line_thickness: settings.line_thickness.max(1),
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
        })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Render, encode and wrap in standard base64.
    pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> Result<String> {
        let rendered = self.render(image, detections);
        let jpeg = self.encode_jpeg(&rendered)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    /// Draw onto a copy; `image` is left untouched.
    pub fn render(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.clone();
        for detection in detections {
            self.draw_detection(&mut canvas, detection);
        }
        canvas
    }

    pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
            .encode_image(image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        Ok(buffer)
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let (w, h) = (image.width() as i32, image.height() as i32);
        if w == 0 || h == 0 {
            return;
        }
        let color = label_color(&detection.label);

        let x_min = (detection.bbox[0].floor() as i32).clamp(0, w - 1);
        let y_min = (detection.bbox[1].floor() as i32).clamp(0, h - 1);
        let x_max = (detection.bbox[2].ceil() as i32).clamp(0, w - 1);
        let y_max = (detection.bbox[3].ceil() as i32).clamp(0, h - 1);
        if x_min >= x_max || y_min >= y_max {
            return;
        }

        for t in 0..self.line_thickness as i32 {
            let box_w = x_max - x_min + 1 - 2 * t;
            let box_h = y_max - y_min + 1 - 2 * t;
            if box_w <= 0 || box_h <= 0 {
                break;
            }
            let rect = Rect::at(x_min + t, y_min + t).of_size(box_w as u32, box_h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        let text = format!("{} {:.2}", detection.label, detection.confidence);
        let (text_w, text_h) = match &self.font {
            Some(font) => {
                let (tw, th) = text_size(self.font_scale, font, &text);
                (tw as i32, th as i32)
            }
            None => (
                (text.chars().count() as f32 * self.font_scale.x * LABEL_CHAR_WIDTH) as i32,
                self.font_scale.y as i32,
            ),
        };
        let strip_h = text_h + 2 * LABEL_PADDING;
        // Above the box when there is room, otherwise just inside its top edge.
        let strip_y = if y_min >= strip_h { y_min - strip_h } else { y_min };
        let strip_w = (text_w + 2 * LABEL_PADDING).min(w - x_min);
        if strip_w <= 0 || strip_h <= 0 {
            return;
        }
        let strip = Rect::at(x_min, strip_y).of_size(strip_w as u32, strip_h as u32);
        draw_filled_rect_mut(image, strip, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                TEXT_COLOR,
                x_min + LABEL_PADDING,
                strip_y + LABEL_PADDING,
                self.font_scale,
                font,
                &text,
            );
        }
    }
}

/// Stable per-label colour: FNV-1a hash of the label mapped onto the hue wheel.
pub fn label_color(label: &str) -> Rgb<u8> {
    let hash = label.bytes().fold(0x811c_9dc5u32, |acc, b| {
        (acc ^ b as u32).wrapping_mul(0x0100_0193)
    });
    let hue = (hash % 360) as f32;
    hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
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

    Rgb([
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
    }

    #[test]
    fn render_leaves_source_untouched() {
        let src = gray(64, 64);
        let dets = vec![Detection::new("Rice", 0.9, [10.0, 30.0, 40.0, 60.0])];
        let out = Annotator::default().render(&src, &dets);

        assert_eq!(src, gray(64, 64));
        assert_eq!(out.get_pixel(10, 45), &label_color("Rice"));
        assert_eq!(out.get_pixel(25, 45), &Rgb([128, 128, 128]));
    }

    #[test]
    fn empty_detections_still_encode_a_jpeg() {
        let encoded = Annotator::default().annotate(&gray(32, 16), &[]).unwrap();
        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn annotation_is_deterministic() {
        let dets = vec![
            Detection::new("Egg", 0.8, [1.0, 1.0, 20.0, 20.0]),
            Detection::new("Tofu", 0.6, [5.0, 25.0, 30.0, 31.0]),
        ];
        let annotator = Annotator::default();
        let a = annotator.annotate(&gray(40, 40), &dets).unwrap();
        let b = annotator.annotate(&gray(40, 40), &dets).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn boxes_at_the_border_do_not_panic() {
        let dets = vec![
            Detection::new("Egg", 0.8, [0.0, 0.0, 8.0, 8.0]),
            Detection::new("Egg", 0.8, [7.0, 7.0, 8.0, 8.0]),
        ];
        let out = Annotator::default().render(&gray(8, 8), &dets);
        assert_eq!(out.dimensions(), (8, 8));
    }

    #[test]
    fn colours_are_stable_per_label() {
        assert_eq!(label_color("Rice"), label_color("Rice"));
    }

    #[test]
    fn missing_font_file_is_an_error() {
        let settings = AnnotationSettings {
            font_path: Some("/nonexistent/font.ttf".into()),
            ..AnnotationSettings::default()
        };
        assert!(Annotator::new(&settings).is_err());
    }
}
