use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::application::compose::{ComposeError, RenderDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Capture rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Clip {
    pub fn full(viewport: Viewport) -> Self {
        Self {
            x: 0,
            y: 0,
            width: viewport.width,
            height: viewport.height,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("rendering engine unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?} waiting for a rendering session")]
    AcquireTimeout(Duration),
    #[error("rendering session failed: {0}")]
    Session(String),
}

impl EngineError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }
}

/// Starts the shared engine process. Called at most once per successful launch.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn EngineSession>, EngineError>;

    async fn close(&self);
}

/// One isolated rendering surface. Used by a single render at a time.
#[async_trait]
pub trait EngineSession: Send {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError>;

    async fn load(&mut self, document: &RenderDocument) -> Result<(), EngineError>;

    /// Encoded PNG of the clipped region.
    async fn capture(&mut self, clip: Clip) -> Result<Bytes, EngineError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub png: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("rendering engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("render failed: {0}")]
    RenderFailed(String),
}

impl From<ComposeError> for RenderError {
    fn from(error: ComposeError) -> Self {
        match error {
            ComposeError::InvalidTemplate(message) => Self::InvalidTemplate(message),
        }
    }
}
