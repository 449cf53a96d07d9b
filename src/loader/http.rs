//! HTTP(S) origin loader
//!
//! Treats the image key as a remote URL. Keys that are not http(s) URLs
//! yield `Pass` so the chain can hand them to another loader. Hosts can be
//! restricted with an allow-list; entries match exactly or with a leading
//! `*.` wildcard.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::blob::Blob;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::gateway::Loader;

pub struct HttpLoader {
    client: reqwest::Client,
    allowed_sources: Vec<String>,
    max_body_bytes: usize,
}

impl HttpLoader {
    /// `allowed_sources` empty means any host; `max_body_bytes` zero means
    /// unlimited
    pub fn new(allowed_sources: Vec<String>, max_body_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("darkroom/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("default reqwest client");
        Self {
            client,
            allowed_sources,
            max_body_bytes,
        }
    }

    fn source_url(&self, key: &str) -> Option<reqwest::Url> {
        let candidate = if key.starts_with("http://") || key.starts_with("https://") {
            key.to_string()
        } else if let Some(rest) = key.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            return None;
        };
        reqwest::Url::parse(&candidate).ok()
    }

    fn host_allowed(&self, url: &reqwest::Url) -> bool {
        if self.allowed_sources.is_empty() {
            return true;
        }
        let host = match url.host_str() {
            Some(h) => h,
            None => return false,
        };
        self.allowed_sources.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        })
    }
}

#[async_trait]
impl Loader for HttpLoader {
    async fn load(&self, cx: &Cx, key: &str) -> Result<Blob> {
        let url = match self.source_url(key) {
            Some(url) => url,
            None => return Err(Error::Pass),
        };
        if !self.host_allowed(&url) {
            return Err(Error::Pass);
        }
        let response = cx
            .fence(async {
                self.client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| Error::custom(format!("fetch failed: {e}"), 502))
            })
            .await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => return Err(Error::NotFound),
            status if status.is_client_error() => {
                return Err(Error::custom(
                    format!("unexpected response status: {status}"),
                    status.as_u16(),
                ))
            }
            status => {
                return Err(Error::custom(
                    format!("unexpected response status: {status}"),
                    502,
                ))
            }
        }
        if self.max_body_bytes > 0 {
            if let Some(length) = response.content_length() {
                if length as usize > self.max_body_bytes {
                    return Err(Error::custom("response body too large", 400));
                }
            }
        }
        let bytes = cx
            .fence(async {
                response
                    .bytes()
                    .await
                    .map_err(|e| Error::custom(format!("read failed: {e}"), 502))
            })
            .await?;
        if self.max_body_bytes > 0 && bytes.len() > self.max_body_bytes {
            return Err(Error::custom("response body too large", 400));
        }
        Ok(Blob::new(bytes))
    }
}
