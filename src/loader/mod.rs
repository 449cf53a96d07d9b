//! Origin loaders

pub mod http;

pub use http::HttpLoader;
