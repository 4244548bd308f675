//! Composes the operator view from the latest camera frames.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use rollcall_core::{BoundingBox, GridLayout, ViewState};
use std::sync::Arc;

const RECOGNIZED: Luma<u8> = Luma([255]);
const UNKNOWN: Luma<u8> = Luma([128]);

/// A face box to outline on its camera's tile.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub recognized: bool,
}

/// Render the grid (every camera in its cell) or a single focused camera
/// filling the canvas. `frames` and `overlays` are indexed by camera.
pub fn compose(
    view: ViewState,
    layout: &GridLayout,
    frames: &[Arc<GrayImage>],
    overlays: &[Vec<Overlay>],
) -> GrayImage {
    let mut canvas = GrayImage::new(layout.width, layout.height);

    match view {
        ViewState::Focused(index) if index < frames.len() => {
            place(&mut canvas, &frames[index], overlays.get(index), (0, 0), (layout.width, layout.height));
        }
        _ => {
            let cell = layout.cell_size();
            for (index, frame) in frames.iter().enumerate() {
                place(&mut canvas, frame, overlays.get(index), layout.cell_origin(index), cell);
            }
        }
    }
    canvas
}

fn place(
    canvas: &mut GrayImage,
    frame: &GrayImage,
    overlays: Option<&Vec<Overlay>>,
    origin: (u32, u32),
    size: (u32, u32),
) {
    let (fw, fh) = frame.dimensions();
    if fw == 0 || fh == 0 {
        return;
    }
    let mut tile = if frame.dimensions() == size {
        frame.clone()
    } else {
        imageops::resize(frame, size.0, size.1, FilterType::Triangle)
    };

    let sx = size.0 as f32 / fw as f32;
    let sy = size.1 as f32 / fh as f32;
    for overlay in overlays.into_iter().flatten() {
        let b = &overlay.bbox;
        let rect = (b.x * sx, b.y * sy, b.width * sx, b.height * sy);
        let color = if overlay.recognized { RECOGNIZED } else { UNKNOWN };
        draw_outline(&mut tile, rect, color);
    }

    imageops::replace(canvas, &tile, origin.0 as i64, origin.1 as i64);
}

/// Draw a one-pixel rectangle outline, clipped to the image.
pub fn draw_outline(image: &mut GrayImage, (x, y, w, h): (f32, f32, f32, f32), color: Luma<u8>) {
    let (iw, ih) = image.dimensions();
    if iw == 0 || ih == 0 || w <= 0.0 || h <= 0.0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(iw - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(ih - 1);
    let (x0, y0) = (clamp_x(x), clamp_y(y));
    let (x1, y1) = (clamp_x(x + w - 1.0), clamp_y(y + h - 1.0));

    for px in x0..=x1 {
        image.put_pixel(px, y0, color);
        image.put_pixel(px, y1, color);
    }
    for py in y0..=y1 {
        image.put_pixel(x0, py, color);
        image.put_pixel(x1, py, color);
    }
}
