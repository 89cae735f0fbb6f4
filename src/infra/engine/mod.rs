//! Rendering engine backends and the pool wiring built from settings.

#[cfg(feature = "chrome")]
mod chrome;
mod color;
mod raster;

use std::sync::Arc;

#[cfg(feature = "chrome")]
pub use chrome::{ChromeEngine, ChromeLauncher, ChromeSession};
pub use raster::{RasterEngine, RasterLauncher, RasterSession};

use crate::{
    application::render::{EngineLauncher, EnginePool, ExecutorConfig, PoolConfig, RenderExecutor},
    config::{EngineKind, EngineSettings},
    infra::error::InfraError,
};

pub fn launcher_for(settings: &EngineSettings) -> Result<Arc<dyn EngineLauncher>, InfraError> {
    match settings.kind {
        EngineKind::Raster => Ok(Arc::new(RasterLauncher)),
        #[cfg(feature = "chrome")]
        EngineKind::Chrome => Ok(Arc::new(ChromeLauncher {
            chrome_path: settings.chrome_path.clone(),
            load_timeout: settings.load_timeout,
        })),
        #[cfg(not(feature = "chrome"))]
        EngineKind::Chrome => Err(InfraError::configuration(
            "engine.kind = \"chrome\" requires building with the `chrome` feature",
        )),
    }
}

/// Build the pooled executor described by `settings`. The engine itself is launched lazily.
pub fn build_executor(settings: &EngineSettings) -> Result<RenderExecutor, InfraError> {
    let launcher = launcher_for(settings)?;
    let pool = EnginePool::new(
        launcher,
        PoolConfig {
            max_sessions: settings.max_sessions.get() as usize,
            acquire_timeout: settings.acquire_timeout,
        },
    );
    Ok(RenderExecutor::new(
        pool,
        ExecutorConfig {
            settle_delay: settings.settle_delay,
            load_timeout: settings.load_timeout,
            capture_timeout: settings.capture_timeout,
            max_canvas_pixels: settings.max_canvas_pixels.get(),
        },
    ))
}
