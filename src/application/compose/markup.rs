//! HTML serialization of a resolved scene, for engines that lay out markup.

use std::fmt::Write as _;

use super::{Placement, SceneLayer, ShapeClass, TEXT_PADDING_PX};

pub(super) fn document_html(
    width: u32,
    height: u32,
    background: Option<&str>,
    layers: &[SceneLayer],
) -> String {
    let mut body = Vec::with_capacity(layers.len() + 1);
    if let Some(background) = background {
        body.push(format!(
            "<img class=\"background\" src=\"{}\" style=\"position:absolute;left:0;top:0;width:100%;height:100%;object-fit:cover;object-position:center;\" />",
            escape(background)
        ));
    }
    body.extend(layers.iter().map(layer_html));

    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><style>html,body{{margin:0;padding:0}}#render-root{{position:relative;overflow:hidden;width:{width}px;height:{height}px}}</style></head><body><div id=\"render-root\">{}</div></body></html>",
        body.join("\n")
    )
}

fn layer_html(layer: &SceneLayer) -> String {
    match layer {
        SceneLayer::Text {
            placement,
            text,
            font_size,
            color,
            font_family,
        } => {
            let mut style = base_style(placement);
            let _ = write!(style, "font-size:{font_size}px;color:{};", escape(color));
            if let Some(family) = font_family.as_deref().map(font_family_name) {
                if !family.is_empty() {
                    let _ = write!(style, "font-family:'{family}';");
                }
            }
            let _ = write!(
                style,
                "display:flex;align-items:center;justify-content:flex-start;padding:{TEXT_PADDING_PX}px;white-space:pre-wrap;"
            );
            format!("<div style=\"{style}\">{}</div>", escape(text))
        }
        SceneLayer::Image {
            placement,
            source,
            mask,
        } => {
            let mut style = base_style(placement);
            match mask {
                ShapeClass::Circle => style.push_str("border-radius:50%;"),
                ShapeClass::Rounded(radii) => {
                    let [tl, tr, br, bl] = radii.values();
                    let _ = write!(style, "border-radius:{tl}px {tr}px {br}px {bl}px;");
                }
                ShapeClass::Rect => {}
            }
            let inner = source
                .as_deref()
                .map(|src| {
                    format!(
                        "<img src=\"{}\" style=\"display:block;width:100%;height:100%;object-fit:cover;\" />",
                        escape(src)
                    )
                })
                .unwrap_or_default();
            format!("<div style=\"{style}\">{inner}</div>")
        }
        SceneLayer::Fill { placement, color } => {
            let mut style = base_style(placement);
            let _ = write!(
                style,
                "background:{};",
                escape(color.as_deref().unwrap_or("transparent"))
            );
            format!("<div style=\"{style}\"></div>")
        }
    }
}

fn base_style(placement: &Placement) -> String {
    format!(
        "position:absolute;left:{}px;top:{}px;width:{}px;height:{}px;transform:rotate({}deg);overflow:hidden;box-sizing:border-box;",
        placement.x, placement.y, placement.w, placement.h, placement.rotation
    )
}

/// Keep only characters that cannot terminate a quoted CSS family name.
fn font_family_name(family: &str) -> String {
    family
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

pub(super) fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
