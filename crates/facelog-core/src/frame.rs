//! Frame type and image processing — color conversion, annotation, encoding.

use crate::types::BoundingBox;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const BOX_THICKNESS: u32 = 2;
const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Pixel layout of a captured frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed RGB, 3 bytes/pixel.
    Rgb,
    /// Packed BGR, 3 bytes/pixel (OpenCV-style producers).
    Bgr,
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion-JPEG: each buffer is a complete JPEG image.
    Mjpeg,
}

/// A raw captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sequence: u32,
}

impl Frame {
    /// Convert to the RGB color space the analyzer expects.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let rgb = match self.format {
            PixelFormat::Rgb => {
                let expected = (self.width * self.height * 3) as usize;
                check_len(&self.data, expected)?;
                self.data[..expected].to_vec()
            }
            PixelFormat::Bgr => bgr_to_rgb(&self.data, self.width, self.height)?,
            PixelFormat::Yuyv => yuyv_to_rgb(&self.data, self.width, self.height)?,
            PixelFormat::Mjpeg => {
                return image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)
                    .map(|img| img.to_rgb8())
                    .map_err(FrameError::Decode);
            }
        };
        let actual = rgb.len();
        RgbImage::from_raw(self.width, self.height, rgb).ok_or(FrameError::InvalidLength {
            expected: (self.width * self.height * 3) as usize,
            actual,
        })
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Swap the R and B channels of a packed BGR buffer.
pub fn bgr_to_rgb(bgr: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 3) as usize;
    check_len(bgr, expected)?;
    Ok(bgr[..expected]
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 integer coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Check if an RGB image is dark: more than `threshold_pct` of pixels have
/// all channels below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| p.0.iter().all(|&c| c < 32)).count();
    (dark as f32 / total as f32) > threshold_pct
}

/// One face as presented to the frame sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    /// `None` marks an enrollment candidate.
    pub name: Option<String>,
    pub distance: Option<f64>,
}

/// An annotated frame handed to the sink.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub faces: Vec<FaceAnnotation>,
    pub sequence: u32,
}

/// Draw a box per face: green for recognized, red for enrollment candidates.
pub fn annotate(image: &mut RgbImage, faces: &[FaceAnnotation]) {
    for face in faces {
        let color = if face.name.is_some() {
            KNOWN_COLOR
        } else {
            UNKNOWN_COLOR
        };
        draw_box(image, &face.bbox, color);
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || bbox.x >= w || bbox.y >= h {
        return;
    }
    let x0 = bbox.x;
    let y0 = bbox.y;
    let x1 = (bbox.x + bbox.width).min(w - 1);
    let y1 = (bbox.y + bbox.height).min(h - 1);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            if y0 + t <= y1 {
                image.put_pixel(x, y0 + t, color);
            }
            if y1 >= y0 + t {
                image.put_pixel(x, y1 - t, color);
            }
        }
        for y in y0..=y1 {
            if x0 + t <= x1 {
                image.put_pixel(x0 + t, y, color);
            }
            if x1 >= x0 + t {
                image.put_pixel(x1 - t, y, color);
            }
        }
    }
}

/// Encode an image as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(FrameError::Encode)?;
    Ok(buf.into_inner())
}

/// Encode an image as a `data:image/jpeg;base64,` URI for remote display.
pub fn encode_data_uri(image: &RgbImage) -> Result<String, FrameError> {
    let jpeg = encode_jpeg(image)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(jpeg);
    Ok(format!("{JPEG_DATA_URI_PREFIX}{b64}"))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to decode frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=126, U=128, Y1=235, V=128]
        let rgb = yuyv_to_rgb(&[126, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![128, 128, 128, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_black_level() {
        let rgb = yuyv_to_rgb(&[16, 128, 16, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![0; 6]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let result = yuyv_to_rgb(&[100, 128], 2, 1);
        assert!(matches!(result, Err(FrameError::InvalidLength { expected: 4, actual: 2 })));
    }

    #[test]
    fn test_bgr_to_rgb_swaps_channels() {
        let rgb = bgr_to_rgb(&[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_frame_to_rgb_dimensions() {
        let frame = Frame {
            data: vec![128; 4 * 2 * 2],
            width: 4,
            height: 2,
            format: PixelFormat::Yuyv,
            sequence: 0,
        };
        let img = frame.to_rgb().unwrap();
        assert_eq!(img.dimensions(), (4, 2));
    }

    #[test]
    fn test_frame_short_rgb_buffer() {
        let frame = Frame {
            data: vec![0; 5],
            width: 2,
            height: 1,
            format: PixelFormat::Rgb,
            sequence: 0,
        };
        assert!(frame.to_rgb().is_err());
    }

    #[test]
    fn test_mjpeg_frame_decodes() {
        let src = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let frame = Frame {
            data: encode_jpeg(&src).unwrap(),
            width: 8,
            height: 8,
            format: PixelFormat::Mjpeg,
            sequence: 3,
        };
        assert_eq!(frame.to_rgb().unwrap().dimensions(), (8, 8));
    }

    #[test]
    fn test_dark_frame() {
        assert!(is_dark_frame(&RgbImage::new(10, 10), 0.95));
        assert!(!is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
    }

    #[test]
    fn test_annotate_colors() {
        let mut img = RgbImage::new(20, 20);
        let faces = vec![
            FaceAnnotation {
                bbox: BoundingBox { x: 0, y: 0, width: 5, height: 5 },
                name: Some("Alice".into()),
                distance: Some(0.1),
            },
            FaceAnnotation {
                bbox: BoundingBox { x: 10, y: 10, width: 5, height: 5 },
                name: None,
                distance: None,
            },
        ];
        annotate(&mut img, &faces);
        assert_eq!(*img.get_pixel(0, 0), KNOWN_COLOR);
        assert_eq!(*img.get_pixel(10, 10), UNKNOWN_COLOR);
        // Interior untouched
        assert_eq!(*img.get_pixel(12, 12), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_clips_to_image() {
        let mut img = RgbImage::new(10, 10);
        let faces = vec![FaceAnnotation {
            bbox: BoundingBox { x: 6, y: 6, width: 50, height: 50 },
            name: None,
            distance: None,
        }];
        annotate(&mut img, &faces);
        assert_eq!(*img.get_pixel(9, 9), UNKNOWN_COLOR);
    }

    #[test]
    fn test_data_uri_prefix() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let uri = encode_data_uri(&img).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,/9j/"));
    }
}
