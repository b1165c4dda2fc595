//! HTTP rasterization gateway
//!
//! Renders pages of remote PDF documents on demand behind a multi-tier
//! fetch/cache pipeline: signed URLs at the boundary, a single-flight LRU
//! file cache over pluggable origin downloaders, an LRU of long-lived
//! rasterizer handles coupled to the file cache's eviction, and an optional
//! encrypted artifact cache that short-circuits rendering entirely.

pub mod annotations;
pub mod artifact;
pub mod config;
pub mod error;
pub mod fetch;
pub mod raster;
pub mod routes;
pub mod signing;
pub mod state;
