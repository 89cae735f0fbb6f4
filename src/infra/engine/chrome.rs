//! Headless Chrome engine driven over the DevTools protocol.
//!
//! `headless_chrome` is blocking, so every browser call runs on the blocking pool.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use headless_chrome::{
    Browser, LaunchOptions, Tab, protocol::cdp::Page, types::Bounds,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::{
    compose::RenderDocument,
    render::{Clip, Engine, EngineError, EngineLauncher, EngineSession, Viewport},
};

#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    pub chrome_path: Option<PathBuf>,
    pub load_timeout: Duration,
}

async fn blocking<T, F>(task: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| EngineError::session(format!("browser task failed: {err}")))?
}

#[async_trait]
impl EngineLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        let chrome_path = self.chrome_path.clone();
        let idle = self.load_timeout.max(Duration::from_secs(30)) * 4;
        let browser = blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(true)
                .path(chrome_path)
                .idle_browser_timeout(idle)
                .build()
                .map_err(|err| {
                    EngineError::unavailable(format!("invalid browser launch options: {err}"))
                })?;
            Browser::new(options)
                .map_err(|err| EngineError::unavailable(format!("failed to launch browser: {err}")))
        })
        .await?;

        info!(target = "cardsmith::engine::chrome", "Launched headless browser");
        Ok(Arc::new(ChromeEngine {
            browser: Mutex::new(Some(browser)),
            load_timeout: self.load_timeout,
        }))
    }
}

pub struct ChromeEngine {
    browser: Mutex<Option<Browser>>,
    load_timeout: Duration,
}

#[async_trait]
impl Engine for ChromeEngine {
    async fn open_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| EngineError::unavailable("browser already closed"))?
            .clone();
        drop(guard);

        let load_timeout = self.load_timeout;
        let tab = blocking(move || {
            let tab = browser
                .new_tab()
                .map_err(|err| EngineError::unavailable(format!("failed to open tab: {err}")))?;
            tab.set_default_timeout(load_timeout);
            Ok(tab)
        })
        .await?;

        Ok(Box::new(ChromeSession { tab }))
    }

    async fn close(&self) {
        if let Some(browser) = self.browser.lock().await.take() {
            // Dropping the last handle terminates the browser process.
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
            info!(target = "cardsmith::engine::chrome", "Closed headless browser");
        }
    }
}

pub struct ChromeSession {
    tab: Arc<Tab>,
}

#[async_trait]
impl EngineSession for ChromeSession {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            tab.set_bounds(Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(f64::from(viewport.width)),
                height: Some(f64::from(viewport.height)),
            })
            .map(|_| ())
            .map_err(|err| EngineError::session(format!("failed to size viewport: {err}")))
        })
        .await
    }

    async fn load(&mut self, document: &RenderDocument) -> Result<(), EngineError> {
        let url = format!(
            "data:text/html;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(document.html.as_bytes())
        );
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|err| EngineError::session(format!("document load failed: {err}")))
        })
        .await
    }

    async fn capture(&mut self, clip: Clip) -> Result<Bytes, EngineError> {
        let tab = Arc::clone(&self.tab);
        blocking(move || {
            let region = Page::Viewport {
                x: f64::from(clip.x),
                y: f64::from(clip.y),
                width: f64::from(clip.width),
                height: f64::from(clip.height),
                scale: 1.0,
            };
            tab.capture_screenshot(
                Page::CaptureScreenshotFormatOption::Png,
                None,
                Some(region),
                true,
            )
            .map(Bytes::from)
            .map_err(|err| EngineError::session(format!("screenshot failed: {err}")))
        })
        .await
    }

    async fn close(&mut self) {
        let tab = Arc::clone(&self.tab);
        let closed = blocking(move || {
            tab.close(false)
                .map(|_| ())
                .map_err(|err| EngineError::session(err.to_string()))
        })
        .await;
        if let Err(err) = closed {
            warn!(
                target = "cardsmith::engine::chrome",
                error = %err,
                "Failed to close browser tab"
            );
        }
    }
}
