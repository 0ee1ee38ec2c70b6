//! Raster previews of drawn signatures.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageResult, Rgba, RgbaImage};

use crate::capture::CapturedPath;
use crate::config::EngineConfig;
use crate::geometry::Point;

const MAX_PREVIEW_SIDE: u32 = 4096;

/// Renders the strokes onto a transparent canvas and encodes it as PNG.
pub fn render_preview(path: &CapturedPath, config: &EngineConfig) -> ImageResult<Vec<u8>> {
    let scale = config.preview_scale.max(0.1);
    let width = ((path.width * scale).ceil() as u32).clamp(1, MAX_PREVIEW_SIDE);
    let height = ((path.height * scale).ceil() as u32).clamp(1, MAX_PREVIEW_SIDE);
    let sx = width as f64 / path.width.max(f64::EPSILON);
    let sy = height as f64 / path.height.max(f64::EPSILON);

    let [r, g, b] = config.stroke_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    let ink = Rgba([r, g, b, 255]);
    let radius = (config.stroke_width * sx.min(sy) / 2.0).max(0.5);

    let mut canvas = RgbaImage::new(width, height);
    for stroke in &path.local_paths {
        let scaled: Vec<Point> = stroke.iter().map(|p| Point::new(p.x * sx, p.y * sy)).collect();
        match scaled.as_slice() {
            [] => {}
            [only] => stamp(&mut canvas, *only, radius, ink),
            points => {
                for pair in points.windows(2) {
                    draw_segment(&mut canvas, pair[0], pair[1], radius, ink);
                }
            }
        }
    }

    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Decodes a preview supplied as PNG or JPEG, guessing anything else.
pub fn decode_preview(data: &[u8]) -> ImageResult<RgbaImage> {
    let image = image::load(Cursor::new(data), ImageFormat::Png)
        .or_else(|_| image::load(Cursor::new(data), ImageFormat::Jpeg))
        .or_else(|_| image::load_from_memory(data))?;
    Ok(image.into_rgba8())
}

/// Splits RGBA pixels into an RGB plane and an alpha plane.
pub fn split_alpha(image: &RgbaImage) -> (Vec<u8>, Vec<u8>) {
    let pixels = (image.width() * image.height()) as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    let mut alpha = Vec::with_capacity(pixels);
    for pixel in image.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel[3]);
    }
    (rgb, alpha)
}

fn draw_segment(canvas: &mut RgbaImage, from: Point, to: Point, radius: f64, ink: Rgba<u8>) {
    let length = from.distance(to);
    let steps = (length / 0.5).ceil().max(1.0) as usize;
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let p = Point::new(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t);
        stamp(canvas, p, radius, ink);
    }
}

fn stamp(canvas: &mut RgbaImage, center: Point, radius: f64, ink: Rgba<u8>) {
    let (w, h) = canvas.dimensions();
    let x0 = (center.x - radius).floor().max(0.0) as u32;
    let y0 = (center.y - radius).floor().max(0.0) as u32;
    let x1 = ((center.x + radius).ceil().max(0.0) as u32).min(w.saturating_sub(1));
    let y1 = ((center.y + radius).ceil().max(0.0) as u32).min(h.saturating_sub(1));
    let r2 = radius * radius;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f64 + 0.5 - center.x;
            let dy = y as f64 + 0.5 - center.y;
            if dx * dx + dy * dy <= r2 {
                canvas.put_pixel(x, y, ink);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zigzag() -> CapturedPath {
        CapturedPath {
            local_paths: vec![vec![
                Point::new(10.0, 10.0),
                Point::new(40.0, 30.0),
                Point::new(60.0, 10.0),
            ]],
            width: 70.0,
            height: 40.0,
        }
    }

    #[test]
    fn preview_matches_capture_box() {
        let config = EngineConfig::default();
        let png = render_preview(&zigzag(), &config).unwrap();
        let image = decode_preview(&png).unwrap();
        assert_eq!(image.dimensions(), (140, 80));
        assert_eq!(image.get_pixel(20, 20)[3], 255);
        assert_eq!(image.get_pixel(0, 79)[3], 0);
    }

    #[test]
    fn split_alpha_separates_planes() {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([1, 2, 3, 4]));
        image.put_pixel(1, 0, Rgba([5, 6, 7, 8]));
        let (rgb, alpha) = split_alpha(&image);
        assert_eq!(rgb, vec![1, 2, 3, 5, 6, 7]);
        assert_eq!(alpha, vec![4, 8]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_preview(b"definitely not an image").is_err());
    }
}
