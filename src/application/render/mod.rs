//! Rendering: a bounded pool of engine sessions and the executor that drives
//! one composed document through a session to PNG bytes.

mod executor;
mod pool;
mod types;

pub use executor::{ExecutorConfig, RenderExecutor};
pub use pool::{EnginePool, PoolConfig, PoolStats, PooledSession};
pub use types::{
    Clip, Engine, EngineError, EngineLauncher, EngineSession, RenderError, RenderedImage, Viewport,
};
