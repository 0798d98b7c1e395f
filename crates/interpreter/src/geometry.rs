//! Coordinate transforms between the grounding model, screenshots and the
//! page viewport

use serde::{Deserialize, Serialize};

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Point with both axes in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f64,
    pub y: f64,
}

impl NormalizedPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(0.0, 1.0),
            y: self.y.clamp(0.0, 1.0),
        }
    }
}

/// Integer CSS-pixel point inside the viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportPoint {
    pub x: i64,
    pub y: i64,
}

/// Size of `image` after scaling it to fit inside `canvas` with its aspect
/// ratio kept. Each axis is floor(side * ratio), computed in integers.
pub fn letterbox_size(image: Size, canvas: Size) -> Size {
    let (iw, ih) = (image.width as u64, image.height as u64);
    let (cw, ch) = (canvas.width as u64, canvas.height as u64);
    if iw == 0 || ih == 0 {
        return Size::new(0, 0);
    }
    // ratio = min(cw / iw, ch / ih)
    if cw * ih <= ch * iw {
        Size::new(canvas.width, (ih * cw / iw) as u32)
    } else {
        Size::new((iw * ch / ih) as u32, canvas.height)
    }
}

/// Map a point the model reported on the letterboxed canvas back onto the
/// original image. The image sits at the canvas origin, so each axis scales
/// by `canvas / resized` on the side that was padded.
pub fn encoder_to_input(point: NormalizedPoint, image: Size, canvas: Size) -> NormalizedPoint {
    let resized = letterbox_size(image, canvas);
    let mut mapped = point;
    if resized.width > 0 && resized.width < canvas.width {
        mapped.x = point.x * (canvas.width as f64 / resized.width as f64);
    }
    if resized.height > 0 && resized.height < canvas.height {
        mapped.y = point.y * (canvas.height as f64 / resized.height as f64);
    }
    mapped
}

/// Scale a normalized point to viewport pixels
pub fn normalized_to_viewport(point: NormalizedPoint, viewport: Size) -> ViewportPoint {
    ViewportPoint {
        x: (point.x * viewport.width as f64).round() as i64,
        y: (point.y * viewport.height as f64).round() as i64,
    }
}

/// Pixel on the image a normalized point falls on
pub fn normalized_to_pixel(point: NormalizedPoint, image: Size) -> (u32, u32) {
    let point = point.clamped();
    let x = (point.x * image.width as f64).floor() as u32;
    let y = (point.y * image.height as f64).floor() as u32;
    (
        x.min(image.width.saturating_sub(1)),
        y.min(image.height.saturating_sub(1)),
    )
}
