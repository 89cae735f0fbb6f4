//! In-process software rasterizer for composed documents.
//!
//! Paints the display list of a [`RenderDocument`] onto an RGBA canvas: fills,
//! masked images decoded from `data:` URIs, and text set in the Spleen bitmap
//! font scaled to the requested size. Remote image URLs are not fetched; their
//! regions stay empty.

use std::{collections::HashMap, io::Cursor, sync::Arc};

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage, imageops::FilterType};
use spleen_font::{FONT_12X24, PSF2Font};
use tracing::debug;

use super::color::{WHITE, blend, parse_color};
use crate::application::{
    compose::{Placement, RenderDocument, SceneLayer, ShapeClass, TEXT_PADDING_PX},
    render::{Clip, Engine, EngineError, EngineLauncher, EngineSession, Viewport},
};

const GLYPH_WIDTH: usize = 12;
const GLYPH_HEIGHT: usize = 24;

#[derive(Debug, Default, Clone, Copy)]
pub struct RasterLauncher;

#[async_trait]
impl EngineLauncher for RasterLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        // Fail at launch rather than mid-render if the embedded font is unusable.
        PSF2Font::new(FONT_12X24)
            .map_err(|_| EngineError::unavailable("embedded bitmap font failed to load"))?;
        Ok(Arc::new(RasterEngine))
    }
}

pub struct RasterEngine;

#[async_trait]
impl Engine for RasterEngine {
    async fn open_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        Ok(Box::new(RasterSession::default()))
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct RasterSession {
    viewport: Option<Viewport>,
    canvas: Option<RgbaImage>,
}

#[async_trait]
impl EngineSession for RasterSession {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(EngineError::session("viewport must be at least 1x1"));
        }
        self.viewport = Some(viewport);
        self.canvas = None;
        Ok(())
    }

    async fn load(&mut self, document: &RenderDocument) -> Result<(), EngineError> {
        let viewport = self
            .viewport
            .ok_or_else(|| EngineError::session("viewport not set before load"))?;
        let document = document.clone();
        let canvas = tokio::task::spawn_blocking(move || paint_document(viewport, &document))
            .await
            .map_err(|err| EngineError::session(format!("paint task failed: {err}")))??;
        self.canvas = Some(canvas);
        Ok(())
    }

    async fn capture(&mut self, clip: Clip) -> Result<Bytes, EngineError> {
        let canvas = self
            .canvas
            .as_ref()
            .ok_or_else(|| EngineError::session("nothing loaded to capture"))?;
        if clip.width == 0
            || clip.height == 0
            || clip.x.saturating_add(clip.width) > canvas.width()
            || clip.y.saturating_add(clip.height) > canvas.height()
        {
            return Err(EngineError::session(format!(
                "clip {clip:?} exceeds canvas {}x{}",
                canvas.width(),
                canvas.height()
            )));
        }

        let region = image::imageops::crop_imm(canvas, clip.x, clip.y, clip.width, clip.height)
            .to_image();
        let mut png = Vec::new();
        region
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| EngineError::session(format!("PNG encoding failed: {err}")))?;
        Ok(Bytes::from(png))
    }

    async fn close(&mut self) {
        self.canvas = None;
        self.viewport = None;
    }
}

fn paint_document(viewport: Viewport, document: &RenderDocument) -> Result<RgbaImage, EngineError> {
    let mut canvas = RgbaImage::from_pixel(viewport.width, viewport.height, WHITE);

    if let Some(background) = document.background.as_deref() {
        let full = Placement {
            x: 0.0,
            y: 0.0,
            w: f64::from(viewport.width),
            h: f64::from(viewport.height),
            rotation: 0.0,
        };
        paint_image(&mut canvas, full, background, ShapeClass::Rect);
    }

    let glyphs = glyph_bitmaps(document.layers.iter().flat_map(|layer| match layer {
        SceneLayer::Text { text, .. } => text.chars().collect::<Vec<_>>(),
        _ => Vec::new(),
    }))?;

    for layer in &document.layers {
        match layer {
            SceneLayer::Fill { placement, color } => {
                if let Some(color) = color.as_deref().and_then(parse_color) {
                    paint_box(&mut canvas, *placement, |_, _| Some((color, 1.0)));
                }
            }
            SceneLayer::Image {
                placement,
                source,
                mask,
            } => {
                if let Some(source) = source.as_deref() {
                    paint_image(&mut canvas, *placement, source, *mask);
                }
            }
            SceneLayer::Text {
                placement,
                text,
                font_size,
                color,
                ..
            } => {
                let color = parse_color(color).unwrap_or(Rgba([0, 0, 0, 255]));
                paint_text(&mut canvas, *placement, text, *font_size, color, &glyphs);
            }
        }
    }

    Ok(canvas)
}

/// Run `shade` for every canvas pixel covered by the (possibly rotated) box.
/// `shade` receives box-local coordinates and returns a colour and coverage.
fn paint_box<F>(canvas: &mut RgbaImage, placement: Placement, mut shade: F)
where
    F: FnMut(f64, f64) -> Option<(Rgba<u8>, f64)>,
{
    if placement.w <= 0.0 || placement.h <= 0.0 {
        return;
    }

    let (sin, cos) = placement.rotation.to_radians().sin_cos();
    let cx = placement.x + placement.w / 2.0;
    let cy = placement.y + placement.h / 2.0;
    let half_w = placement.w / 2.0;
    let half_h = placement.h / 2.0;
    let extent_x = half_w * cos.abs() + half_h * sin.abs();
    let extent_y = half_w * sin.abs() + half_h * cos.abs();

    let min_x = (cx - extent_x).floor().max(0.0) as u32;
    let min_y = (cy - extent_y).floor().max(0.0) as u32;
    let max_x = (cx + extent_x).ceil().min(f64::from(canvas.width())) as u32;
    let max_y = (cy + extent_y).ceil().min(f64::from(canvas.height())) as u32;

    for py in min_y..max_y {
        for px in min_x..max_x {
            let dx = f64::from(px) + 0.5 - cx;
            let dy = f64::from(py) + 0.5 - cy;
            let local_x = dx * cos + dy * sin + half_w;
            let local_y = -dx * sin + dy * cos + half_h;
            if local_x < 0.0 || local_y < 0.0 || local_x >= placement.w || local_y >= placement.h
            {
                continue;
            }
            if let Some((color, coverage)) = shade(local_x, local_y) {
                blend(canvas.get_pixel_mut(px, py), color, coverage);
            }
        }
    }
}

fn paint_image(canvas: &mut RgbaImage, placement: Placement, source: &str, mask: ShapeClass) {
    let Some(bytes) = decode_data_uri(source) else {
        debug!(
            target = "cardsmith::engine::raster",
            "Skipping image that is not an inline data URI"
        );
        return;
    };
    let decoded = match image::load_from_memory(&bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(
                target = "cardsmith::engine::raster",
                error = %err,
                "Skipping undecodable image"
            );
            return;
        }
    };

    let Some(fit) = CoverFit::new(&decoded, placement.w, placement.h) else {
        return;
    };

    paint_box(canvas, placement, |x, y| {
        if !inside_mask(mask, placement.w, placement.h, x, y) {
            return None;
        }
        Some((fit.sample(x, y), 1.0))
    });
}

/// Cover-fit of an image into a `w x h` box, sampled lazily per visible pixel.
///
/// The box is never materialised: only the source (downscaled when the box is
/// smaller than it) is held, so memory is bounded by the decoded image rather
/// than by the layer size.
struct CoverFit {
    pixels: RgbaImage,
    offset_x: f64,
    offset_y: f64,
    step_x: f64,
    step_y: f64,
}

impl CoverFit {
    fn new(source: &DynamicImage, w: f64, h: f64) -> Option<Self> {
        let (iw, ih) = (f64::from(source.width()), f64::from(source.height()));
        if iw == 0.0 || ih == 0.0 || w <= 0.0 || h <= 0.0 {
            return None;
        }
        let scale = (w / iw).max(h / ih);
        let (shown_w, shown_h) = (iw * scale, ih * scale);

        let pixels = if scale < 1.0 {
            source
                .resize_exact(
                    shown_w.round().max(1.0) as u32,
                    shown_h.round().max(1.0) as u32,
                    FilterType::Triangle,
                )
                .to_rgba8()
        } else {
            source.to_rgba8()
        };

        Some(Self {
            offset_x: (w - shown_w) / 2.0,
            offset_y: (h - shown_h) / 2.0,
            step_x: shown_w / f64::from(pixels.width()),
            step_y: shown_h / f64::from(pixels.height()),
            pixels,
        })
    }

    fn sample(&self, x: f64, y: f64) -> Rgba<u8> {
        let sx = ((x - self.offset_x) / self.step_x).max(0.0) as u32;
        let sy = ((y - self.offset_y) / self.step_y).max(0.0) as u32;
        *self.pixels.get_pixel(
            sx.min(self.pixels.width() - 1),
            sy.min(self.pixels.height() - 1),
        )
    }
}

fn inside_mask(mask: ShapeClass, w: f64, h: f64, x: f64, y: f64) -> bool {
    match mask {
        ShapeClass::Rect => true,
        ShapeClass::Circle => {
            let nx = (x - w / 2.0) / (w / 2.0);
            let ny = (y - h / 2.0) / (h / 2.0);
            nx * nx + ny * ny <= 1.0
        }
        ShapeClass::Rounded(radii) => {
            let limit = w.min(h) / 2.0;
            let [top_left, top_right, bottom_right, bottom_left] =
                radii.values().map(|radius| radius.clamp(0.0, limit));
            let corner = |radius: f64, cx: f64, cy: f64| {
                let dx = x - cx;
                let dy = y - cy;
                dx * dx + dy * dy <= radius * radius
            };

            if x < top_left && y < top_left {
                corner(top_left, top_left, top_left)
            } else if x > w - top_right && y < top_right {
                corner(top_right, w - top_right, top_right)
            } else if x > w - bottom_right && y > h - bottom_right {
                corner(bottom_right, w - bottom_right, h - bottom_right)
            } else if x < bottom_left && y > h - bottom_left {
                corner(bottom_left, bottom_left, h - bottom_left)
            } else {
                true
            }
        }
    }
}

fn decode_data_uri(source: &str) -> Option<Vec<u8>> {
    let rest = source.trim().strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if meta.ends_with(";base64") {
        let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .ok()
    } else {
        Some(payload.as_bytes().to_vec())
    }
}

type GlyphMap = HashMap<char, Vec<bool>>;

/// 12x24 row-major bitmaps for every character in `chars`. Characters missing
/// from the font use the `?` glyph.
fn glyph_bitmaps(chars: impl Iterator<Item = char>) -> Result<GlyphMap, EngineError> {
    let mut font = PSF2Font::new(FONT_12X24)
        .map_err(|_| EngineError::session("embedded bitmap font failed to load"))?;
    let mut rasterize = |ch: char| -> Option<Vec<bool>> {
        let encoded = ch.to_string();
        let glyph = font.glyph_for_utf8(encoded.as_bytes())?;
        let mut bitmap = vec![false; GLYPH_WIDTH * GLYPH_HEIGHT];
        for (row_y, row) in glyph.enumerate() {
            for (col_x, on) in row.enumerate() {
                if row_y < GLYPH_HEIGHT && col_x < GLYPH_WIDTH {
                    bitmap[row_y * GLYPH_WIDTH + col_x] = on;
                }
            }
        }
        Some(bitmap)
    };

    let fallback = rasterize('?').unwrap_or_else(|| vec![false; GLYPH_WIDTH * GLYPH_HEIGHT]);
    let mut glyphs = GlyphMap::new();
    for ch in chars {
        if !glyphs.contains_key(&ch) {
            let bitmap = rasterize(ch).unwrap_or_else(|| fallback.clone());
            glyphs.insert(ch, bitmap);
        }
    }
    Ok(glyphs)
}

/// Break `text` into lines of at most `max_chars`, keeping explicit newlines.
fn wrap_lines(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split(' ') {
            let line_len = line.chars().count();
            let word_len = word.chars().count();
            if line_len > 0 && line_len + 1 + word_len > max_chars {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);

            while line.chars().count() > max_chars {
                let head: String = line.chars().take(max_chars).collect();
                let tail: String = line.chars().skip(max_chars).collect();
                lines.push(head);
                line = tail;
            }
        }
        lines.push(line);
    }

    lines
}

fn paint_text(
    canvas: &mut RgbaImage,
    placement: Placement,
    text: &str,
    font_size: f64,
    color: Rgba<u8>,
    glyphs: &GlyphMap,
) {
    if text.is_empty() || font_size <= 0.0 {
        return;
    }

    let scale = font_size / GLYPH_HEIGHT as f64;
    let advance = GLYPH_WIDTH as f64 * scale;
    let line_height = GLYPH_HEIGHT as f64 * scale;
    let inner_w = (placement.w - 2.0 * TEXT_PADDING_PX).max(advance);
    let inner_h = placement.h - 2.0 * TEXT_PADDING_PX;
    let max_chars = (inner_w / advance).floor().max(1.0) as usize;

    let lines: Vec<Vec<char>> = wrap_lines(text, max_chars)
        .into_iter()
        .map(|line| line.chars().collect())
        .collect();
    let block_h = line_height * lines.len() as f64;
    let top = TEXT_PADDING_PX + (inner_h - block_h) / 2.0;

    paint_box(canvas, placement, |x, y| {
        let line_y = y - top;
        if line_y < 0.0 {
            return None;
        }
        let line = lines.get((line_y / line_height) as usize)?;
        let glyph_x = x - TEXT_PADDING_PX;
        if glyph_x < 0.0 {
            return None;
        }
        let ch = line.get((glyph_x / advance) as usize)?;
        let bitmap = glyphs.get(ch)?;

        let gx = ((glyph_x % advance) / scale) as usize;
        let gy = ((line_y % line_height) / scale) as usize;
        let on = bitmap
            .get(gy.min(GLYPH_HEIGHT - 1) * GLYPH_WIDTH + gx.min(GLYPH_WIDTH - 1))
            .copied()
            .unwrap_or(false);
        on.then_some((color, 1.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::template::CornerRadii;

    fn red_square_uri() -> String {
        let tile = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        let mut png = Vec::new();
        tile.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .expect("encode");
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        )
    }

    fn placement(x: f64, y: f64, w: f64, h: f64) -> Placement {
        Placement {
            x,
            y,
            w,
            h,
            rotation: 0.0,
        }
    }

    async fn render(document: RenderDocument) -> RgbaImage {
        let mut session = RasterSession::default();
        let viewport = Viewport {
            width: document.width,
            height: document.height,
        };
        session.set_viewport(viewport).await.expect("viewport");
        session.load(&document).await.expect("load");
        let png = session.capture(Clip::full(viewport)).await.expect("capture");
        image::load_from_memory(&png).expect("decodes").to_rgba8()
    }

    fn document(width: u32, height: u32, layers: Vec<SceneLayer>) -> RenderDocument {
        RenderDocument {
            width,
            height,
            background: None,
            layers,
            html: String::new(),
        }
    }

    #[tokio::test]
    async fn capture_matches_declared_size() {
        let image = render(document(
            37,
            21,
            vec![SceneLayer::Fill {
                placement: placement(-10.0, -10.0, 500.0, 500.0),
                color: Some("#00ff00".into()),
            }],
        ))
        .await;
        assert_eq!(image.dimensions(), (37, 21));
        assert_eq!(*image.get_pixel(36, 20), Rgba([0, 255, 0, 255]));
    }

    #[tokio::test]
    async fn circle_mask_leaves_corners_blank() {
        let image = render(document(
            20,
            20,
            vec![SceneLayer::Image {
                placement: placement(0.0, 0.0, 20.0, 20.0),
                source: Some(red_square_uri()),
                mask: ShapeClass::Circle,
            }],
        ))
        .await;
        assert_eq!(*image.get_pixel(10, 10), Rgba([255, 0, 0, 255]));
        assert_eq!(*image.get_pixel(0, 0), WHITE);
    }

    #[tokio::test]
    async fn rounded_mask_clips_only_the_rounded_corner() {
        let radii = CornerRadii {
            top_left: Some(8.0),
            ..CornerRadii::default()
        };
        let image = render(document(
            20,
            20,
            vec![SceneLayer::Image {
                placement: placement(0.0, 0.0, 20.0, 20.0),
                source: Some(red_square_uri()),
                mask: ShapeClass::Rounded(radii),
            }],
        ))
        .await;
        assert_eq!(*image.get_pixel(0, 0), WHITE);
        assert_eq!(*image.get_pixel(19, 0), Rgba([255, 0, 0, 255]));
    }

    #[tokio::test]
    async fn cover_crops_the_overflowing_axis_around_the_centre() {
        let mut wide = RgbaImage::from_pixel(8, 4, Rgba([255, 0, 0, 255]));
        for y in 0..4 {
            for x in 4..8 {
                wide.put_pixel(x, y, Rgba([0, 0, 255, 255]));
            }
        }
        let mut png = Vec::new();
        wide.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .expect("encode");
        let uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        );

        let image = render(document(
            4,
            4,
            vec![SceneLayer::Image {
                placement: placement(0.0, 0.0, 4.0, 4.0),
                source: Some(uri),
                mask: ShapeClass::Rect,
            }],
        ))
        .await;
        assert_eq!(*image.get_pixel(0, 2), Rgba([255, 0, 0, 255]));
        assert_eq!(*image.get_pixel(3, 2), Rgba([0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn huge_image_box_only_paints_the_visible_canvas() {
        let image = render(document(
            10,
            10,
            vec![
                SceneLayer::Image {
                    placement: placement(-500_000.0, -500_000.0, 1_000_000.0, 1_000_000.0),
                    source: Some(red_square_uri()),
                    mask: ShapeClass::Rect,
                },
                SceneLayer::Image {
                    placement: placement(2_000_000.0, 0.0, 3_000_000.0, 3_000_000.0),
                    source: Some(red_square_uri()),
                    mask: ShapeClass::Circle,
                },
            ],
        ))
        .await;
        assert!(image.pixels().all(|pixel| *pixel == Rgba([255, 0, 0, 255])));
    }

    #[tokio::test]
    async fn remote_sources_render_as_empty_regions() {
        let image = render(document(
            8,
            8,
            vec![SceneLayer::Image {
                placement: placement(0.0, 0.0, 8.0, 8.0),
                source: Some("https://example.test/photo.png".into()),
                mask: ShapeClass::Rect,
            }],
        ))
        .await;
        assert!(image.pixels().all(|pixel| *pixel == WHITE));
    }

    #[tokio::test]
    async fn text_puts_ink_inside_its_box_only() {
        let image = render(document(
            120,
            40,
            vec![SceneLayer::Text {
                placement: placement(0.0, 0.0, 60.0, 40.0),
                text: "HELLO".into(),
                font_size: 24.0,
                color: "#000000".into(),
                font_family: None,
            }],
        ))
        .await;
        let inked = |x0: u32, x1: u32| {
            (x0..x1).any(|x| (0..40).any(|y| image.get_pixel(x, y)[0] < 128))
        };
        assert!(inked(0, 60));
        assert!(!inked(60, 120));
    }

    #[test]
    fn wrap_keeps_words_and_newlines() {
        assert_eq!(
            wrap_lines("ada lovelace\nbyron", 5),
            vec!["ada", "lovel", "ace", "byron"]
        );
        assert_eq!(wrap_lines("", 4), vec![""]);
    }

    #[test]
    fn data_uri_decoding() {
        assert_eq!(decode_data_uri("data:text/plain,abc"), Some(b"abc".to_vec()));
        assert_eq!(
            decode_data_uri("data:text/plain;base64,YWJj"),
            Some(b"abc".to_vec())
        );
        assert!(decode_data_uri("https://example.test/a.png").is_none());
    }
}
