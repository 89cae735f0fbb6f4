//! Template compositor: resolve a template against a mapping into a display
//! list plus its HTML serialization.
//!
//! Composition is pure. The same template and mapping always produce the same
//! [`RenderDocument`], byte for byte.

pub mod data;
mod markup;
pub mod shape;

use thiserror::Error;

use crate::domain::template::{ImageLayer, Layer, Mapping, ShapeLayer, Template, TextLayer};

pub use shape::{CIRCLE_RADIUS_TOLERANCE_PX, ShapeClass, classify_shape};

pub const DEFAULT_FONT_SIZE: f64 = 16.0;
/// 32 Mi pixels, about 128 MiB of RGBA.
pub const DEFAULT_MAX_CANVAS_PIXELS: u64 = 33_554_432;
pub const DEFAULT_TEXT_COLOR: &str = "#000000";
pub const TEXT_PADDING_PX: f64 = 4.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
}

/// Bounds applied before any engine work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeLimits {
    pub max_canvas_pixels: u64,
}

impl Default for ComposeLimits {
    fn default() -> Self {
        Self {
            max_canvas_pixels: DEFAULT_MAX_CANVAS_PIXELS,
        }
    }
}

/// Absolute box of a layer, in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    /// Degrees, clockwise, around the box centre.
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneLayer {
    Text {
        placement: Placement,
        text: String,
        font_size: f64,
        color: String,
        font_family: Option<String>,
    },
    Image {
        placement: Placement,
        /// `None` renders an empty region.
        source: Option<String>,
        mask: ShapeClass,
    },
    Fill {
        placement: Placement,
        color: Option<String>,
    },
}

/// Markup and display list for one render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderDocument {
    pub width: u32,
    pub height: u32,
    pub background: Option<String>,
    pub layers: Vec<SceneLayer>,
    pub html: String,
}

pub fn compose(template: &Template, mapping: &Mapping) -> Result<RenderDocument, ComposeError> {
    compose_within(template, mapping, ComposeLimits::default())
}

/// [`compose`] with an explicit canvas budget.
pub fn compose_within(
    template: &Template,
    mapping: &Mapping,
    limits: ComposeLimits,
) -> Result<RenderDocument, ComposeError> {
    let size = template
        .size
        .ok_or_else(|| ComposeError::InvalidTemplate("template has no size".to_string()))?;

    let width = canvas_dimension(size.w, "width")?;
    let height = canvas_dimension(size.h, "height")?;
    let pixels = u64::from(width) * u64::from(height);
    if pixels > limits.max_canvas_pixels {
        return Err(ComposeError::InvalidTemplate(format!(
            "canvas {width}x{height} has {pixels} pixels, above the limit of {}",
            limits.max_canvas_pixels
        )));
    }

    let background = template
        .background_image
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let layers: Vec<SceneLayer> = template
        .layers
        .iter()
        .filter_map(|layer| resolve_layer(layer, mapping))
        .collect();

    let html = markup::document_html(width, height, background.as_deref(), &layers);

    Ok(RenderDocument {
        width,
        height,
        background,
        layers,
        html,
    })
}

fn canvas_dimension(value: f64, label: &str) -> Result<u32, ComposeError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ComposeError::InvalidTemplate(format!(
            "size {label} must be positive, got {value}"
        )));
    }
    let rounded = value.round();
    if rounded < 1.0 || rounded > f64::from(u32::MAX) {
        return Err(ComposeError::InvalidTemplate(format!(
            "size {label} {value} is outside the supported range"
        )));
    }
    Ok(rounded as u32)
}

fn resolve_layer(layer: &Layer, mapping: &Mapping) -> Option<SceneLayer> {
    match layer {
        Layer::Text(text) => Some(resolve_text(text, mapping)),
        Layer::Image(image) => Some(resolve_image(image, mapping)),
        Layer::Rect(shape) | Layer::Line(shape) => Some(resolve_fill(shape)),
        Layer::Unknown => None,
    }
}

fn placement(frame: &crate::domain::template::Frame) -> Placement {
    let finite = |value: f64| if value.is_finite() { value } else { 0.0 };
    Placement {
        x: finite(frame.x),
        y: finite(frame.y),
        w: finite(frame.w).max(0.0),
        h: finite(frame.h).max(0.0),
        rotation: frame.rotation.map(finite).unwrap_or(0.0),
    }
}

fn resolve_text(layer: &TextLayer, mapping: &Mapping) -> SceneLayer {
    // A mapped empty string still wins over the literal text.
    let text = layer
        .binding_key()
        .and_then(|key| mapping.get(&key).cloned())
        .or_else(|| layer.original_text.clone())
        .unwrap_or_default();

    let font = layer.font.as_ref();
    let font_size = font
        .and_then(|font| font.size)
        .filter(|size| size.is_finite() && *size > 0.0)
        .unwrap_or(DEFAULT_FONT_SIZE);
    let color = font
        .and_then(|font| font.color.clone())
        .filter(|color| !color.is_empty())
        .unwrap_or_else(|| DEFAULT_TEXT_COLOR.to_string());

    SceneLayer::Text {
        placement: placement(&layer.frame),
        text,
        font_size,
        color,
        font_family: font.and_then(|font| font.family.clone()),
    }
}

fn resolve_image(layer: &ImageLayer, mapping: &Mapping) -> SceneLayer {
    let source = layer
        .key
        .as_deref()
        .and_then(|key| mapping.get(key))
        .filter(|value| !value.is_empty())
        .or_else(|| layer.data_uri.as_ref().filter(|value| !value.is_empty()))
        .cloned();

    SceneLayer::Image {
        placement: placement(&layer.frame),
        source,
        mask: classify_shape(layer),
    }
}

fn resolve_fill(layer: &ShapeLayer) -> SceneLayer {
    SceneLayer::Fill {
        placement: placement(&layer.frame),
        color: layer.color.clone().filter(|color| !color.is_empty()),
    }
}
