//! Application services: composition, rendering and the render-job lifecycle.

pub mod artifacts;
pub mod compose;
pub mod error;
pub mod jobs;
pub mod render;
pub mod repos;
