//! darkroom - HTTP image-processing gateway
//!
//! URLs encode a source image plus a transformation pipeline in the
//! thumbor convention. The gateway verifies the URL signature, coalesces
//! concurrent identical requests, loads sources through a pluggable
//! loader chain, runs the raster pipeline, writes derivatives back
//! through a storage fan-out, and serves the result with cache headers.
//!
//! ## Components
//!
//! - **Gateway**: request orchestration with staged timeouts
//! - **Single-flight**: per-key coalescing with deadlock-safe reentrancy
//! - **Loaders/Storages**: HTTP origin, filesystem write-back cache
//! - **Raster**: the image pipeline over decode hints and filters

pub mod blob;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod loader;
pub mod raster;
pub mod server;
pub mod singleflight;
pub mod storage;
pub mod urlpath;

pub use blob::{Blob, Meta};
pub use context::Cx;
pub use error::{Error, Result};
pub use gateway::{Fetch, Gateway, Loader, Processed, Processor, Served, Storage};
