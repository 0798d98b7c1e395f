//! UI grounding: find the on-screen element a referring expression names
//!
//! The remote model receives a PNG screenshot and a short expression and
//! answers with a normalized click point plus, optionally, an annotated copy
//! of the image. Screenshots may be letterboxed onto a fixed canvas first, in
//! which case the point is mapped back onto the original image.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{imageops, DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::time::Duration;
use storycheck_common::{CanvasSize, GroundingConfig, Result, StoryError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::geometry::{self, NormalizedPoint, Size};

/// Where the model says the element is
#[derive(Debug, Clone)]
pub struct Grounding {
    pub point: NormalizedPoint,
    /// Model-drawn annotation of the image, when it sends one
    pub annotated: Option<DynamicImage>,
}

/// Locates UI elements on screenshots
#[async_trait]
pub trait UiGrounding: Send + Sync {
    async fn locate(&self, image: &DynamicImage, expression: &str) -> Result<Grounding>;
}

/// HTTP client for a hosted grounding model
pub struct RemoteGrounding {
    endpoint: String,
    revision: String,
    canvas: Option<CanvasSize>,
    max_expression_chars: usize,
    client: reqwest::Client,
}

impl RemoteGrounding {
    pub fn new(config: &GroundingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        info!("UI grounding client ready for {}", config.endpoint);
        Ok(Self {
            endpoint: config.endpoint.clone(),
            revision: config.revision.clone(),
            canvas: config.encoder_canvas,
            max_expression_chars: config.max_expression_chars,
            client,
        })
    }

    /// Expression as sent to the model
    pub fn prepare_expression(&self, expression: &str) -> String {
        expression
            .trim()
            .chars()
            .take(self.max_expression_chars)
            .collect::<String>()
            .to_lowercase()
    }

    /// Request body for one prediction
    pub fn request_body(&self, image_png: &[u8], expression: &str) -> Value {
        json!({
            "data": [
                format!("data:image/png;base64,{}", BASE64.encode(image_png)),
                self.prepare_expression(expression),
                self.revision,
                true,
            ]
        })
    }
}

#[async_trait]
impl UiGrounding for RemoteGrounding {
    async fn locate(&self, image: &DynamicImage, expression: &str) -> Result<Grounding> {
        let original = Size::new(image.width(), image.height());
        let payload = match self.canvas {
            Some(canvas) => letterbox(image, Size::new(canvas.width, canvas.height)),
            None => image.clone(),
        };
        let body = self.request_body(&encode_png(&payload)?, expression);

        debug!("Grounding '{}' via {}", self.prepare_expression(expression), self.endpoint);
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(StoryError::Grounding(format!(
                "model endpoint returned {}",
                resp.status()
            )));
        }
        let answer: Value = resp.json().await?;

        let mut point = parse_point(&answer)?;
        if let Some(canvas) = self.canvas {
            point = geometry::encoder_to_input(point, original, Size::new(canvas.width, canvas.height));
        }
        debug!("Grounded '{}' at ({:.4}, {:.4})", expression, point.x, point.y);

        Ok(Grounding {
            point: point.clamped(),
            annotated: parse_annotation(&answer),
        })
    }
}

/// Builds a [`RemoteGrounding`] on first use and shares it afterwards
pub struct LazyGrounding {
    config: GroundingConfig,
    client: OnceCell<RemoteGrounding>,
}

impl LazyGrounding {
    pub fn new(config: GroundingConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }
}

#[async_trait]
impl UiGrounding for LazyGrounding {
    async fn locate(&self, image: &DynamicImage, expression: &str) -> Result<Grounding> {
        let client = self
            .client
            .get_or_try_init(|| async { RemoteGrounding::new(&self.config) })
            .await?;
        client.locate(image, expression).await
    }
}

/// `data[1]` holds `{x, y}` as numbers or numeric strings
fn parse_point(answer: &Value) -> Result<NormalizedPoint> {
    let point = answer
        .get("data")
        .and_then(|data| data.get(1))
        .ok_or_else(|| StoryError::Grounding("response has no point".into()))?;

    let axis = |name: &str| -> Result<f64> {
        let value = point
            .get(name)
            .ok_or_else(|| StoryError::Grounding(format!("point has no {}", name)))?;
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| StoryError::Grounding(format!("point {} is not a number: {}", name, value)))
    };

    Ok(NormalizedPoint::new(axis("x")?, axis("y")?))
}

/// `data[0]` may be a PNG data URL of the annotated screenshot
fn parse_annotation(answer: &Value) -> Option<DynamicImage> {
    let url = answer.get("data")?.get(0)?.as_str()?;
    let encoded = url.split_once("base64,").map(|(_, b)| b).unwrap_or(url);
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    match image::load_from_memory(&bytes) {
        Ok(image) => Some(image),
        Err(e) => {
            debug!("Ignoring undecodable grounding annotation: {}", e);
            None
        }
    }
}

/// Fit `image` inside `canvas` keeping aspect ratio, anchored top-left,
/// padding with black
pub fn letterbox(image: &DynamicImage, canvas: Size) -> DynamicImage {
    let resized = geometry::letterbox_size(Size::new(image.width(), image.height()), canvas);
    let scaled = image.resize_exact(resized.width, resized.height, imageops::FilterType::Triangle);
    let mut padded = RgbaImage::from_pixel(canvas.width, canvas.height, Rgba([0, 0, 0, 255]));
    imageops::overlay(&mut padded, &scaled.to_rgba8(), 0, 0);
    DynamicImage::ImageRgba8(padded)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Draw a ring around the click target
pub fn annotate_click(image: &DynamicImage, point: NormalizedPoint) -> DynamicImage {
    let mut canvas = image.to_rgba8();
    let (cx, cy) = geometry::normalized_to_pixel(point, Size::new(canvas.width(), canvas.height()));
    let radius = (canvas.width().min(canvas.height()) as f64 / 40.0).max(6.0);
    let thickness = (radius / 4.0).max(2.0);
    let color = Rgba([255, 0, 0, 255]);

    let reach = (radius + thickness).ceil() as i64;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let distance = ((dx * dx + dy * dy) as f64).sqrt();
            if (distance - radius).abs() > thickness / 2.0 {
                continue;
            }
            let (x, y) = (cx as i64 + dx, cy as i64 + dy);
            if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
                canvas.put_pixel(x as u32, y as u32, color);
            }
        }
    }

    DynamicImage::ImageRgba8(canvas)
}
