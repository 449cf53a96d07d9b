//! Configuration
//!
//! CLI arguments and environment variable handling using clap. `Args` is
//! also the assembly point: `build_gateway` wires loaders, storages and the
//! raster processor according to the flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::gateway::Gateway;
use crate::loader::HttpLoader;
use crate::raster::{RasterOptions, RasterProcessor};
use crate::storage::FileStore;

/// darkroom - HTTP image-processing gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "darkroom")]
#[command(about = "HTTP image-processing gateway with thumbor-compatible URLs")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Serve unsigned /unsafe/ URLs (development only)
    #[arg(long = "unsafe", env = "UNSAFE", default_value = "false")]
    pub unsafe_mode: bool,

    /// HMAC secret for URL signatures
    #[arg(long, env = "SECRET", default_value = "")]
    pub secret: String,

    /// Whole-request budget in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Budget for one pass through a loader chain
    #[arg(long, env = "LOAD_TIMEOUT_MS", default_value = "20000")]
    pub load_timeout_ms: u64,

    /// Budget for one storage fan-out
    #[arg(long, env = "SAVE_TIMEOUT_MS", default_value = "20000")]
    pub save_timeout_ms: u64,

    /// Budget for processor execution
    #[arg(long, env = "PROCESS_TIMEOUT_MS", default_value = "20000")]
    pub process_timeout_ms: u64,

    /// TTL for Cache-Control/Expires headers in seconds; 0 disables
    /// shared caching
    #[arg(long, env = "CACHE_HEADER_TTL_SECS", default_value = "86400")]
    pub cache_header_ttl_secs: u64,

    /// Hosts the HTTP loader may fetch from (exact or *.wildcard);
    /// empty allows any
    #[arg(long, env = "HTTP_ALLOWED_SOURCES", value_delimiter = ',')]
    pub http_allowed_sources: Vec<String>,

    /// Maximum upstream response size in bytes; 0 means unlimited
    #[arg(long, env = "HTTP_MAX_BODY_BYTES", default_value = "0")]
    pub http_max_body_bytes: usize,

    /// Directory served by a load-only file loader
    #[arg(long, env = "FILE_LOADER_DIR")]
    pub file_loader_dir: Option<PathBuf>,

    /// Directory for source write-back caching (loader and storage)
    #[arg(long, env = "FILE_STORAGE_DIR")]
    pub file_storage_dir: Option<PathBuf>,

    /// Directory for derivative caching (result loader and storage)
    #[arg(long, env = "RESULT_STORAGE_DIR")]
    pub result_storage_dir: Option<PathBuf>,

    /// Fallback width when a dimension is missing
    #[arg(long, env = "MAX_WIDTH", default_value = "9999")]
    pub max_width: u32,

    /// Fallback height when a dimension is missing
    #[arg(long, env = "MAX_HEIGHT", default_value = "9999")]
    pub max_height: u32,

    /// Filter operations allowed per request; 0 means unlimited
    #[arg(long, env = "MAX_FILTER_OPS", default_value = "10")]
    pub max_filter_ops: usize,

    /// Animation frames decoded per request; -1 means unbounded
    #[arg(long, env = "MAX_ANIMATION_FRAMES", default_value = "-1", allow_hyphen_values = true)]
    pub max_animation_frames: i32,

    /// Concurrent raster pipelines; 0 means unlimited
    #[arg(long, env = "CONCURRENCY", default_value = "0")]
    pub concurrency: usize,

    /// Filter names to remove from the registry
    #[arg(long, env = "DISABLE_FILTERS", value_delimiter = ',')]
    pub disable_filters: Vec<String>,

    /// Remove blur and sharpen from the registry
    #[arg(long, env = "DISABLE_BLUR", default_value = "false")]
    pub disable_blur: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Verbose pipeline logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if !self.unsafe_mode && self.secret.is_empty() {
            return Err("--secret is required unless --unsafe is set".into());
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err("--max-width and --max-height must be positive".into());
        }
        Ok(())
    }

    /// Assemble the gateway from the configured components. Loader order:
    /// file loader, file storage (write-back cache), then the HTTP origin.
    pub fn build_gateway(&self) -> Arc<Gateway> {
        let mut builder = Gateway::builder()
            .unsafe_mode(self.unsafe_mode)
            .secret(self.secret.clone())
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .load_timeout(Duration::from_millis(self.load_timeout_ms))
            .save_timeout(Duration::from_millis(self.save_timeout_ms))
            .process_timeout(Duration::from_millis(self.process_timeout_ms))
            .cache_header_ttl(Duration::from_secs(self.cache_header_ttl_secs));

        if let Some(dir) = &self.file_loader_dir {
            builder = builder.loader(Arc::new(FileStore::new(dir.clone())));
        }
        if let Some(dir) = &self.file_storage_dir {
            builder = builder.store(Arc::new(FileStore::new(dir.clone())));
        }
        builder = builder.loader(Arc::new(HttpLoader::new(
            self.http_allowed_sources.clone(),
            self.http_max_body_bytes,
        )));
        if let Some(dir) = &self.result_storage_dir {
            builder = builder.result_store(Arc::new(FileStore::new(dir.clone())));
        }

        let processor = RasterProcessor::new(RasterOptions {
            max_width: self.max_width,
            max_height: self.max_height,
            max_filter_ops: self.max_filter_ops,
            max_animation_frames: self.max_animation_frames,
            concurrency: self.concurrency,
            disable_blur: self.disable_blur,
            disable_filters: self.disable_filters.clone(),
        });
        Arc::new(builder.processor(Arc::new(processor)).build())
    }
}
