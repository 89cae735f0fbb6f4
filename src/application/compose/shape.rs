//! Decide how an image layer is masked.

use crate::domain::template::{CornerRadii, ImageLayer, ImageShape};

/// Radii this close to half the short side are treated as a full circle.
pub const CIRCLE_RADIUS_TOLERANCE_PX: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShapeClass {
    Rect,
    Rounded(CornerRadii),
    Circle,
}

pub fn classify_shape(layer: &ImageLayer) -> ShapeClass {
    if layer.shape == Some(ImageShape::Circle) || layer.is_ellipse == Some(true) {
        return ShapeClass::Circle;
    }

    let half_short_side = layer.frame.w.min(layer.frame.h) / 2.0;
    let is_half = |radius: f64| {
        half_short_side > 0.0 && (radius - half_short_side).abs() <= CIRCLE_RADIUS_TOLERANCE_PX
    };

    if let Some(radii) = layer.corner_radii.filter(|radii| !radii.is_zero()) {
        if radii.values().into_iter().all(is_half) {
            return ShapeClass::Circle;
        }
        return ShapeClass::Rounded(radii);
    }

    match layer.corner_radius {
        Some(radius) if is_half(radius) => ShapeClass::Circle,
        Some(radius) if radius > 0.0 => ShapeClass::Rounded(CornerRadii::uniform(radius)),
        _ => ShapeClass::Rect,
    }
}
