//! Frame preprocessing helpers

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, GrayImage, ImageResult};
use ndarray::Array2;

use crate::detection::Frame;

/// Quality used for preview frames
pub const PREVIEW_JPEG_QUALITY: u8 = 75;

/// Resize to `width`, keeping the aspect ratio
pub fn resize_to_width(img: &DynamicImage, width: u32) -> DynamicImage {
    if img.width() == width || img.width() == 0 {
        return img.clone();
    }
    let height = ((img.height() as u64 * width as u64) / img.width() as u64).max(1) as u32;
    img.resize_exact(width, height, FilterType::Triangle)
}

/// Canonical width, single channel
pub fn preprocess(img: &DynamicImage, width: u32) -> GrayImage {
    resize_to_width(img, width).to_luma8()
}

pub fn encode_jpeg(gray: &GrayImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        gray.as_raw(),
        gray.width(),
        gray.height(),
        ColorType::L8,
    )?;
    Ok(buf)
}

/// Gaussian blur sized by an odd kernel width, sigma derived the usual way
/// (`0.3 * ((k - 1) * 0.5 - 1) + 0.8`)
pub fn gaussian_blur(gray: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 {
        return gray.clone();
    }
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    imageops::blur(gray, sigma)
}

pub fn to_frame(gray: &GrayImage) -> Frame {
    let (width, height) = gray.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
        f32::from(gray.get_pixel(col as u32, row as u32)[0])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, RgbImage};

    #[test]
    fn test_resize_preserves_aspect() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(1280, 720));
        let gray = preprocess(&img, 640);
        assert_eq!(gray.dimensions(), (640, 360));
    }

    #[test]
    fn test_frame_layout_is_rows_by_columns() {
        let mut gray = GrayImage::new(4, 2);
        gray.put_pixel(3, 1, Luma([200]));
        let frame = to_frame(&gray);
        assert_eq!(frame.dim(), (2, 4));
        assert_eq!(frame[[1, 3]], 200.0);
    }

    #[test]
    fn test_preview_is_jpeg() {
        let gray = GrayImage::from_pixel(32, 16, Luma([128]));
        let bytes = encode_jpeg(&gray, PREVIEW_JPEG_QUALITY).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn test_blur_keeps_flat_image() {
        let gray = GrayImage::from_pixel(20, 20, Luma([90]));
        let blurred = gaussian_blur(&gray, 5);
        let centre = blurred.get_pixel(10, 10)[0];
        assert!((89..=91).contains(&centre), "got {centre}");
    }
}
