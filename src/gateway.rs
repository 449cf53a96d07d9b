//! Request orchestrator
//!
//! Wires signature verification, the two-tier single-flight pipeline,
//! loader chains, storage fan-out and the processor chain under staged
//! timeouts. One request flows:
//!
//! ```text
//! verify signature
//!   └─ flight "res:<result-key>"
//!        ├─ result loaders (cached derivative)
//!        └─ flight "img:<image-key>"
//!             ├─ source loaders
//!             └─ write-back to source storages (origin skipped)
//!        ├─ processor chain (process timeout)
//!        └─ write-back to result storages
//! ```
//!
//! Loaders, storages and processors are fixed at build time through
//! [`GatewayBuilder`]; there is no dynamic discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::blob::Blob;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::singleflight::Group;
use crate::urlpath::{self, Params};

/// Loads image bytes for a key. `Pass` means "not applicable, try the
/// next loader"; `NotFound` means definitively absent.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, cx: &Cx, key: &str) -> Result<Blob>;
}

/// Persists image bytes under a key
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, cx: &Cx, key: &str, blob: Blob) -> Result<()>;
}

/// Outcome of one processor attempt
#[derive(Debug)]
pub enum Processed {
    /// Final output; the chain stops here
    Done(Blob),
    /// Not applicable; optionally hand a pass-through blob to the next
    /// processor
    Pass(Option<Blob>),
}

/// Transforms a source blob according to the request parameters.
/// `startup`/`shutdown` run once per process lifetime.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn startup(&self, cx: &Cx) -> Result<()>;
    async fn process(
        &self,
        cx: &Cx,
        blob: Blob,
        params: &Params,
        fetch: &dyn Fetch,
    ) -> Result<Processed>;
    async fn shutdown(&self, cx: &Cx) -> Result<()>;
}

/// Fetches a secondary image (e.g. a watermark) through the gateway's
/// loader chain and single-flight group, so recursive loads coalesce with
/// and never deadlock against the outer request.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Blob>;
}

/// Result of one request: possibly a blob, possibly an error, possibly
/// both (a fallback body shipped with an error status)
#[derive(Debug, Clone, Default)]
pub struct Served {
    pub blob: Option<Blob>,
    pub err: Option<Error>,
}

impl Served {
    fn ok(blob: Blob) -> Self {
        Self {
            blob: Some(blob),
            err: None,
        }
    }

    pub fn fail(err: Error) -> Self {
        Self {
            blob: None,
            err: Some(err),
        }
    }
}

/// Outcome of walking a loader chain
struct Loaded {
    blob: Option<Blob>,
    origin: Option<Arc<dyn Loader>>,
    err: Option<Error>,
}

/// The gateway core. Construct via [`Gateway::builder`], share behind `Arc`.
pub struct Gateway {
    unsafe_mode: bool,
    secret: String,
    loaders: Vec<Arc<dyn Loader>>,
    storages: Vec<Arc<dyn Storage>>,
    result_loaders: Vec<Arc<dyn Loader>>,
    result_storages: Vec<Arc<dyn Storage>>,
    processors: Vec<Arc<dyn Processor>>,
    request_timeout: Option<Duration>,
    load_timeout: Option<Duration>,
    save_timeout: Option<Duration>,
    process_timeout: Option<Duration>,
    cache_header_ttl: Duration,
    flights: Group<Served>,
}

pub struct GatewayBuilder {
    gateway: Gateway,
}

impl GatewayBuilder {
    pub fn unsafe_mode(mut self, enabled: bool) -> Self {
        self.gateway.unsafe_mode = enabled;
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.gateway.secret = secret.into();
        self
    }

    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.gateway.loaders.push(loader);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.gateway.storages.push(storage);
        self
    }

    /// Register one component as both loader and storage. Write-back skips
    /// it when it produced the bytes itself.
    pub fn store<S: Loader + Storage + 'static>(mut self, store: Arc<S>) -> Self {
        self.gateway.loaders.push(store.clone());
        self.gateway.storages.push(store);
        self
    }

    pub fn result_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.gateway.result_loaders.push(loader);
        self
    }

    pub fn result_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.gateway.result_storages.push(storage);
        self
    }

    pub fn result_store<S: Loader + Storage + 'static>(mut self, store: Arc<S>) -> Self {
        self.gateway.result_loaders.push(store.clone());
        self.gateway.result_storages.push(store);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.gateway.processors.push(processor);
        self
    }

    /// Zero disables the stage timeout
    pub fn request_timeout(mut self, t: Duration) -> Self {
        self.gateway.request_timeout = some_nonzero(t);
        self
    }

    pub fn load_timeout(mut self, t: Duration) -> Self {
        self.gateway.load_timeout = some_nonzero(t);
        self
    }

    pub fn save_timeout(mut self, t: Duration) -> Self {
        self.gateway.save_timeout = some_nonzero(t);
        self
    }

    pub fn process_timeout(mut self, t: Duration) -> Self {
        self.gateway.process_timeout = some_nonzero(t);
        self
    }

    pub fn cache_header_ttl(mut self, t: Duration) -> Self {
        self.gateway.cache_header_ttl = t;
        self
    }

    pub fn build(self) -> Gateway {
        self.gateway
    }
}

fn some_nonzero(t: Duration) -> Option<Duration> {
    if t.is_zero() {
        None
    } else {
        Some(t)
    }
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder {
            gateway: Gateway {
                unsafe_mode: false,
                secret: String::new(),
                loaders: Vec::new(),
                storages: Vec::new(),
                result_loaders: Vec::new(),
                result_storages: Vec::new(),
                processors: Vec::new(),
                request_timeout: Some(Duration::from_secs(30)),
                load_timeout: Some(Duration::from_secs(20)),
                save_timeout: Some(Duration::from_secs(20)),
                process_timeout: Some(Duration::from_secs(20)),
                cache_header_ttl: Duration::from_secs(24 * 60 * 60),
                flights: Group::new(),
            },
        }
    }

    pub fn cache_header_ttl(&self) -> Duration {
        self.cache_header_ttl
    }

    /// Processor startup hooks, once per process lifetime
    pub async fn startup(&self, cx: &Cx) -> Result<()> {
        for processor in &self.processors {
            processor.startup(cx).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self, cx: &Cx) -> Result<()> {
        for processor in &self.processors {
            processor.shutdown(cx).await?;
        }
        Ok(())
    }

    /// Execute one parsed request end to end
    pub async fn execute(self: &Arc<Self>, cx: &Cx, params: Params) -> Served {
        let cx = cx.with_timeout(self.request_timeout);
        if !(self.unsafe_mode && params.unsafe_)
            && urlpath::sign(&params.path, &self.secret) != params.hash
        {
            debug!(path = %params.path, "signature mismatch");
            return Served::fail(Error::SignatureMismatch);
        }
        // meta/ and bare derivatives share one computation
        let result_key = params
            .path
            .strip_prefix("meta/")
            .unwrap_or(&params.path)
            .to_string();
        let flight_key = format!("res:{result_key}");
        let app = Arc::clone(self);
        match self
            .flights
            .acquire(&cx, &flight_key, move |cx| async move {
                app.produce(cx, result_key, params).await
            })
            .await
        {
            Ok(served) => served,
            Err(err) => Served::fail(err),
        }
    }

    /// Body of the result flight: result cache, source load, process, store
    async fn produce(self: Arc<Self>, cx: Cx, result_key: String, params: Params) -> Served {
        if !self.result_loaders.is_empty() {
            let cached = self.load_chain(&cx, &self.result_loaders, &result_key).await;
            if cached.err.is_none() {
                if let Some(blob) = cached.blob {
                    if !blob.is_empty() {
                        debug!(key = %result_key, "result cache hit");
                        return Served::ok(blob);
                    }
                }
            }
        }

        let source = match self.load_store(&cx, &params.image).await {
            Ok(blob) => blob,
            Err(err) => {
                debug!(image = %params.image, error = %err, "load");
                return Served::fail(err);
            }
        };
        if source.is_empty() {
            return Served::fail(Error::NotFound);
        }

        let cx = cx.with_timeout(self.process_timeout);
        let fetch = GatewayFetch {
            app: Arc::clone(&self),
            cx: cx.clone(),
        };
        let mut file = source;
        let mut err: Option<Error> = None;
        for processor in &self.processors {
            match cx
                .fence(processor.process(&cx, file.clone(), &params, &fetch))
                .await
            {
                Ok(Processed::Done(f)) => {
                    file = f;
                    err = None;
                    debug!(image = %params.image, "processed");
                    break;
                }
                Ok(Processed::Pass(partial)) => {
                    // hand a pass-through blob to the next processor
                    if let Some(f) = partial {
                        if !f.is_empty() {
                            file = f;
                        }
                    }
                    debug!(image = %params.image, "process pass");
                }
                Err(e) => {
                    warn!(image = %params.image, error = %e, "process");
                    let fatal = e.is_timeout();
                    err = Some(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        if err.is_none() && !self.result_storages.is_empty() {
            self.save_all(&cx, None, &self.result_storages, &result_key, file.clone())
                .await;
        }
        Served {
            blob: Some(file),
            err,
        }
    }

    /// Load a source image under the `img:` flight, writing back to the
    /// configured source storages on success
    async fn load_store(self: &Arc<Self>, cx: &Cx, key: &str) -> Result<Blob> {
        let flight_key = format!("img:{key}");
        let app = Arc::clone(self);
        let owned_key = key.to_string();
        let served = self
            .flights
            .acquire(cx, &flight_key, move |cx| async move {
                let loaded = app.load_chain(&cx, &app.loaders, &owned_key).await;
                if let Some(blob) = &loaded.blob {
                    if !app.storages.is_empty() {
                        app.save_all(
                            &cx,
                            loaded.origin.as_ref(),
                            &app.storages,
                            &owned_key,
                            blob.clone(),
                        )
                        .await;
                    }
                }
                Served {
                    blob: loaded.blob,
                    err: loaded.err,
                }
            })
            .await?;
        match served.err {
            None => Ok(served.blob.unwrap_or_default()),
            Some(err) => Err(err),
        }
    }

    /// Try loaders in order under the load timeout. The first success wins
    /// and reports the producing loader so write-back can skip it. Expected
    /// misses stay at debug; the final error is logged once, with a
    /// trailing `Pass` rewritten to `NotFound`.
    async fn load_chain(&self, cx: &Cx, loaders: &[Arc<dyn Loader>], key: &str) -> Loaded {
        let cx = cx.with_timeout(self.load_timeout);
        let walked = cx
            .fence(async {
                let mut blob: Option<Blob> = None;
                let mut origin: Option<Arc<dyn Loader>> = None;
                let mut err: Option<Error> = None;
                for loader in loaders {
                    match loader.load(&cx, key).await {
                        Ok(f) => {
                            if !f.is_empty() {
                                blob = Some(f);
                            }
                            origin = Some(Arc::clone(loader));
                            err = None;
                            break;
                        }
                        Err(e) => {
                            // not the end of the chain yet, keep quiet about
                            // expected misses
                            if e.is_soft() {
                                debug!(key, error = %e, "load attempt");
                            } else {
                                warn!(key, error = %e, "load attempt");
                            }
                            err = Some(e);
                        }
                    }
                }
                Ok((blob, origin, err))
            })
            .await;

        let (blob, origin, err) = match walked {
            Ok(out) => out,
            Err(e) => (None, None, Some(e)),
        };
        let err = match err {
            Some(Error::Pass) => Some(Error::NotFound),
            other => other,
        };
        match &err {
            None => debug!(key, "loaded"),
            Some(e) => warn!(key, error = %e, "load"),
        }
        Loaded { blob, origin, err }
    }

    /// Write one blob to every sink in parallel, skipping the origin
    /// loader. Sink failures are logged, never surfaced. Awaits all writes
    /// before returning.
    async fn save_all(
        &self,
        cx: &Cx,
        origin: Option<&Arc<dyn Loader>>,
        storages: &[Arc<dyn Storage>],
        key: &str,
        blob: Blob,
    ) {
        if blob.is_empty() {
            return;
        }
        let cx = cx.with_timeout(self.save_timeout);
        let mut writes = Vec::new();
        for storage in storages {
            if let Some(origin) = origin {
                if same_component(origin, storage) {
                    debug!(key, "skip save to origin");
                    continue;
                }
            }
            let cx = cx.clone();
            let storage = Arc::clone(storage);
            let key = key.to_string();
            let blob = blob.clone();
            writes.push(tokio::spawn(async move {
                match cx.fence(storage.save(&cx, &key, blob)).await {
                    Ok(()) => debug!(key = %key, "saved"),
                    Err(e) => warn!(key = %key, error = %e, "save"),
                }
            }));
        }
        join_all(writes).await;
    }
}

/// Identity comparison across trait objects: true when both `Arc`s point
/// at the same allocation (one component registered as loader and storage)
fn same_component(loader: &Arc<dyn Loader>, storage: &Arc<dyn Storage>) -> bool {
    Arc::as_ptr(loader) as *const () == Arc::as_ptr(storage) as *const ()
}

struct GatewayFetch {
    app: Arc<Gateway>,
    cx: Cx,
}

#[async_trait]
impl Fetch for GatewayFetch {
    async fn fetch(&self, key: &str) -> Result<Blob> {
        self.app.load_store(&self.cx, key).await
    }
}
