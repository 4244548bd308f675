//! Frame type and normalisation: YUYV conversion, digital zoom, placeholders.

use image::imageops::{self, FilterType};
use image::GrayImage;
use std::time::Instant;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: GrayImage, sequence: u32) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Black frame shown in place of a camera that produced nothing.
    pub fn placeholder(width: u32, height: u32) -> Self {
        Self::new(GrayImage::new(width, height), 0)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Center-crop by `zoom` (values below 1.0 are treated as 1.0) and rescale
    /// to `width` x `height`.
    pub fn normalized(&self, zoom: f32, width: u32, height: u32) -> GrayImage {
        let zoom = zoom.max(1.0);
        let (src_w, src_h) = self.image.dimensions();
        let crop_w = ((src_w as f32 / zoom).round() as u32).clamp(1, src_w.max(1));
        let crop_h = ((src_h as f32 / zoom).round() as u32).clamp(1, src_h.max(1));
        let x = (src_w - crop_w.min(src_w)) / 2;
        let y = (src_h - crop_h.min(src_h)) / 2;

        let cropped = imageops::crop_imm(&self.image, x, y, crop_w, crop_h).to_image();
        if cropped.dimensions() == (width, height) {
            return cropped;
        }
        imageops::resize(&cropped, width, height, FilterType::Triangle)
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True when more than `threshold_pct` of the pixels are near black. Cameras
/// often deliver a few such frames right after streaming starts.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
