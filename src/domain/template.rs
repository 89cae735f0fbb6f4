//! Declarative templates exported from the design tool.
//!
//! Field names follow the exporter's camelCase JSON. Everything except the
//! layer `type` tag is optional at parse time so that a malformed template is
//! still accepted into the queue and rejected by the compositor with a precise
//! reason.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Placeholder token -> value (plain text or a `data:` URI).
pub type Mapping = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// The plugin writes `template_id`; hand-written templates use `templateId`.
    #[serde(default, alias = "template_id", skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
    #[serde(default)]
    pub fonts: Vec<FontSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FontSpec {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub size: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Layer {
    Text(TextLayer),
    Image(ImageLayer),
    Rect(ShapeLayer),
    Line(ShapeLayer),
    /// Layer kinds this renderer does not draw.
    #[serde(other)]
    Unknown,
}

/// Absolute geometry shared by every layer kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub h: f64,
    #[serde(default)]
    pub rotation: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextLayer {
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub font: Option<Font>,
}

impl TextLayer {
    /// The explicit binding key, or the `{{TOKEN}}` found in the literal text.
    pub fn binding_key(&self) -> Option<String> {
        self.key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| self.original_text.as_deref().and_then(placeholder_key))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Font {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub letter_spacing: Option<f64>,
    #[serde(default)]
    pub line_height: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageShape {
    Rect,
    Circle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CornerRadii {
    #[serde(default)]
    pub top_left: Option<f64>,
    #[serde(default)]
    pub top_right: Option<f64>,
    #[serde(default)]
    pub bottom_right: Option<f64>,
    #[serde(default)]
    pub bottom_left: Option<f64>,
}

impl CornerRadii {
    pub fn uniform(radius: f64) -> Self {
        Self {
            top_left: Some(radius),
            top_right: Some(radius),
            bottom_right: Some(radius),
            bottom_left: Some(radius),
        }
    }

    /// Radii in `[top_left, top_right, bottom_right, bottom_left]` order, missing corners as 0.
    pub fn values(&self) -> [f64; 4] {
        [
            self.top_left.unwrap_or(0.0),
            self.top_right.unwrap_or(0.0),
            self.bottom_right.unwrap_or(0.0),
            self.bottom_left.unwrap_or(0.0),
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.values().iter().all(|radius| *radius <= 0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayer {
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub shape: Option<ImageShape>,
    #[serde(default)]
    pub is_ellipse: Option<bool>,
    #[serde(default)]
    pub corner_radius: Option<f64>,
    #[serde(default)]
    pub corner_radii: Option<CornerRadii>,
    #[serde(default)]
    pub data_uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeLayer {
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(default)]
    pub color: Option<String>,
}

/// Extract `TOKEN` from the first `{{ TOKEN }}` in `text`.
///
/// Tokens are ASCII letters, digits and underscores, matching what the
/// exporter recognises.
pub fn placeholder_key(text: &str) -> Option<String> {
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return None;
        };
        let token = after[..end].trim();
        if !token.is_empty()
            && token
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Some(token.to_string());
        }
        rest = &after[end + 2..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exported_template() {
        let json = serde_json::json!({
            "template_id": "player-card",
            "version": 1,
            "size": { "w": 1080, "h": 1350 },
            "fonts": [{ "family": "Inter", "style": "Bold", "size": 48 }],
            "layers": [
                {
                    "type": "text", "name": "Name", "key": "NAME",
                    "x": 10, "y": 20.5, "w": 300, "h": 60, "rotation": 0,
                    "originalText": "{{NAME}}",
                    "font": { "family": "Inter", "style": "Bold", "size": 48, "color": "#FFFFFF", "letterSpacing": null }
                },
                {
                    "type": "image", "name": "IMG_PHOTO", "key": "PHOTO",
                    "x": 0, "y": 0, "w": 200, "h": 200,
                    "shape": "circle", "isEllipse": true
                },
                { "type": "line", "x": 0, "y": 100, "w": 1080, "h": 2, "color": "#FF0000" },
                { "type": "vector", "x": 0, "y": 0, "w": 1, "h": 1 }
            ]
        });

        let template: Template = serde_json::from_value(json).expect("template parses");
        assert_eq!(template.template_id.as_deref(), Some("player-card"));
        assert_eq!(template.size, Some(Size { w: 1080.0, h: 1350.0 }));
        assert_eq!(template.layers.len(), 4);
        match &template.layers[0] {
            Layer::Text(text) => {
                assert_eq!(text.frame.y, 20.5);
                assert_eq!(text.font.as_ref().and_then(|f| f.size), Some(48.0));
            }
            other => panic!("expected text layer, got {other:?}"),
        }
        match &template.layers[1] {
            Layer::Image(image) => assert_eq!(image.shape, Some(ImageShape::Circle)),
            other => panic!("expected image layer, got {other:?}"),
        }
        assert!(matches!(template.layers[2], Layer::Line(_)));
        assert!(matches!(template.layers[3], Layer::Unknown));
    }

    #[test]
    fn camel_case_template_id_is_accepted() {
        let template: Template =
            serde_json::from_value(serde_json::json!({ "templateId": "card", "layers": [] }))
                .expect("parses");
        assert_eq!(template.template_id.as_deref(), Some("card"));
        let written = serde_json::to_value(&template).expect("serializes");
        assert_eq!(written["templateId"], "card");
    }

    #[test]
    fn template_without_size_still_parses() {
        let template: Template =
            serde_json::from_value(serde_json::json!({ "layers": [] })).expect("parses");
        assert!(template.size.is_none());
    }

    #[test]
    fn placeholder_key_extracts_first_valid_token() {
        assert_eq!(placeholder_key("Hello {{ NAME }}!"), Some("NAME".to_string()));
        assert_eq!(placeholder_key("{{not valid}} {{OK_1}}"), Some("OK_1".to_string()));
        assert_eq!(placeholder_key("no tokens"), None);
        assert_eq!(placeholder_key("{{UNCLOSED"), None);
    }

    #[test]
    fn binding_key_prefers_explicit_key() {
        let layer = TextLayer {
            key: Some("EXPLICIT".to_string()),
            original_text: Some("{{OTHER}}".to_string()),
            ..TextLayer::default()
        };
        assert_eq!(layer.binding_key().as_deref(), Some("EXPLICIT"));

        let derived = TextLayer {
            original_text: Some("{{OTHER}}".to_string()),
            ..TextLayer::default()
        };
        assert_eq!(derived.binding_key().as_deref(), Some("OTHER"));
    }
}
