use std::time::{Duration, Instant};

use metrics::histogram;
use tracing::{debug, warn};

use super::{
    pool::{EnginePool, PooledSession},
    types::{Clip, EngineError, RenderError, RenderedImage, Viewport},
};
use crate::application::compose::{
    ComposeLimits, DEFAULT_MAX_CANVAS_PIXELS, RenderDocument, compose_within,
};
use crate::domain::template::{Mapping, Template};

const METRIC_RENDER_MS: &str = "cardsmith_render_ms";

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Pause between load and capture so late resources can paint.
    pub settle_delay: Duration,
    pub load_timeout: Duration,
    pub capture_timeout: Duration,
    /// Templates whose canvas exceeds this are rejected as invalid.
    pub max_canvas_pixels: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(150),
            load_timeout: Duration::from_secs(15),
            capture_timeout: Duration::from_secs(15),
            max_canvas_pixels: DEFAULT_MAX_CANVAS_PIXELS,
        }
    }
}

/// Drives one template through compose, a pooled session, and capture.
#[derive(Clone)]
pub struct RenderExecutor {
    pool: EnginePool,
    config: ExecutorConfig,
}

impl RenderExecutor {
    pub fn new(pool: EnginePool, config: ExecutorConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub async fn render(
        &self,
        template: &Template,
        mapping: &Mapping,
    ) -> Result<RenderedImage, RenderError> {
        let started = Instant::now();
        let limits = ComposeLimits {
            max_canvas_pixels: self.config.max_canvas_pixels,
        };
        let document = compose_within(template, mapping, limits)?;

        let mut session = self.pool.acquire().await.map_err(unavailable)?;

        let outcome = self.drive(&mut session, &document).await;
        session.release().await;

        let png = outcome?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_RENDER_MS).record(elapsed_ms);
        debug!(
            target = "cardsmith::render::executor",
            width = document.width,
            height = document.height,
            bytes = png.len(),
            elapsed_ms,
            "Rendered document"
        );

        Ok(RenderedImage {
            png,
            width: document.width,
            height: document.height,
        })
    }

    async fn drive(
        &self,
        session: &mut PooledSession,
        document: &RenderDocument,
    ) -> Result<bytes::Bytes, RenderError> {
        let viewport = Viewport {
            width: document.width,
            height: document.height,
        };

        session
            .set_viewport(viewport)
            .await
            .map_err(|err| RenderError::RenderFailed(err.to_string()))?;

        match tokio::time::timeout(self.config.load_timeout, session.load(document)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(RenderError::RenderFailed(err.to_string())),
            Err(_) => {
                return Err(RenderError::RenderFailed(format!(
                    "document load exceeded {:?}",
                    self.config.load_timeout
                )));
            }
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let png = match tokio::time::timeout(
            self.config.capture_timeout,
            session.capture(Clip::full(viewport)),
        )
        .await
        {
            Ok(Ok(png)) => png,
            Ok(Err(err)) => return Err(RenderError::RenderFailed(err.to_string())),
            Err(_) => {
                return Err(RenderError::RenderFailed(format!(
                    "capture exceeded {:?}",
                    self.config.capture_timeout
                )));
            }
        };

        if png.is_empty() {
            warn!(
                target = "cardsmith::render::executor",
                "Engine returned an empty capture"
            );
            return Err(RenderError::RenderFailed(
                "engine returned an empty image".to_string(),
            ));
        }

        Ok(png)
    }
}

/// Keep only the engine's own message; `RenderError` adds its own prefix.
fn unavailable(error: EngineError) -> RenderError {
    match error {
        EngineError::Unavailable(message) => RenderError::EngineUnavailable(message),
        other => RenderError::EngineUnavailable(other.to_string()),
    }
}
