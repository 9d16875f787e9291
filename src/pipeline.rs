use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use url::Url;

use crate::admission::{AdmissionGuard, Decision, RejectionReason, SizeProbe, SourceDescriptor};
use crate::cache::{ConversionCache, EntryStatus, Failure, FailureKind, Outcome};
use crate::clock::Clock;
use crate::codec::Codec;
use crate::config::Settings;
use crate::error::ConversionError;
use crate::fetch::{FetchError, Fetcher};
use crate::rate_limit::RateLimiter;
use crate::request_context::{Fingerprint, RequestContext};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversionResult {
    Payload(Bytes),
    Rejected(RejectionReason),
    Error(ConversionError),
}

/// Rate limit, fingerprint, then serve from the cache or run one
/// fetch/admit/decode/encode job per fingerprint.
pub struct ConversionPipeline {
    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn Codec>,
    guard: Arc<AdmissionGuard>,
    cache: ConversionCache,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    images_dir: PathBuf,
}

impl ConversionPipeline {
    pub fn new(
        settings: &Settings,
        fetcher: Arc<dyn Fetcher>,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ConversionPipeline {
            fetcher,
            codec,
            guard: Arc::new(AdmissionGuard::new(settings.limits.clone())),
            cache: ConversionCache::new(settings.cache_capacity, settings.failure_ttl, clock.clone()),
            limiter: RateLimiter::new(settings.rate_limit_count, settings.rate_limit_window),
            clock,
            cache_ttl: settings.cache_ttl,
            images_dir: settings.images_dir.clone(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub async fn convert(&self, request: &RequestContext) -> ConversionResult {
        if let Err(e) = self.acquire(&request.client_id) {
            return ConversionResult::Error(e);
        }
        let url = match request.source_url() {
            Ok(url) => url,
            Err(e) => return ConversionResult::Error(e),
        };
        self.run(request.fingerprint(), url).await
    }

    /// Converts `<images_dir>/<name>.avif`.
    pub async fn convert_local(&self, client_id: &str, name: &str) -> ConversionResult {
        if let Err(e) = self.acquire(client_id) {
            return ConversionResult::Error(e);
        }
        let not_found = || ConversionResult::Error(ConversionError::NotFound("Image not found".into()));

        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return not_found();
        }
        let path = match tokio::fs::canonicalize(self.images_dir.join(format!("{name}.avif"))).await {
            Ok(path) => path,
            Err(_) => return not_found(),
        };
        let url = match Url::from_file_path(&path) {
            Ok(url) => url,
            Err(_) => return not_found(),
        };
        self.run(Fingerprint::from_pairs([("local", name)]), url).await
    }

    fn acquire(&self, client_id: &str) -> Result<(), ConversionError> {
        if self.limiter.try_acquire(client_id, self.clock.now()) {
            Ok(())
        } else {
            warn!(client = client_id, "rate limit exceeded");
            Err(ConversionError::RateLimited)
        }
    }

    async fn run(&self, fingerprint: Fingerprint, url: Url) -> ConversionResult {
        let job = ConversionJob {
            fetcher: self.fetcher.clone(),
            codec: self.codec.clone(),
            guard: self.guard.clone(),
            url,
        };
        let entry = self
            .cache
            .get_or_compute(&fingerprint, self.cache_ttl, move || job.run())
            .await;
        debug!(
            fingerprint = %entry.fingerprint,
            age = ?self.clock.now().saturating_duration_since(entry.created_at),
            "conversion entry resolved"
        );

        match &entry.status {
            EntryStatus::Success(payload) => ConversionResult::Payload(payload.clone()),
            EntryStatus::Rejected(reason) => ConversionResult::Rejected(*reason),
            EntryStatus::Failed(failure) => ConversionResult::Error(failure.clone().into()),
            EntryStatus::Pending => ConversionResult::Error(ConversionError::Internal(
                "conversion did not complete".into(),
            )),
        }
    }
}

struct ConversionJob {
    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn Codec>,
    guard: Arc<AdmissionGuard>,
    url: Url,
}

impl ConversionJob {
    async fn run(self) -> Outcome {
        let outcome = self.convert().await;
        match &outcome {
            Outcome::Converted(payload) => {
                info!(url = %self.url, bytes = payload.len(), "conversion generated")
            }
            Outcome::Rejected(reason) => info!(url = %self.url, ?reason, "source rejected"),
            Outcome::Failed(failure) => {
                warn!(url = %self.url, kind = ?failure.kind, detail = %failure.detail, "conversion failed")
            }
        }
        outcome
    }

    async fn convert(&self) -> Outcome {
        let mut descriptor = SourceDescriptor::new(self.url.clone());
        if let Decision::Reject(reason) = self.guard.check(&descriptor) {
            return Outcome::Rejected(reason);
        }

        descriptor.content_length = match self.fetcher.head_size(&self.url).await {
            Ok(Some(length)) => SizeProbe::Known(length),
            Ok(None) => SizeProbe::Unknown,
            Err(e) => return upstream_failure(e),
        };
        if let Decision::Reject(reason) = self.guard.check(&descriptor) {
            return Outcome::Rejected(reason);
        }

        let size_limit = self.guard.limits().size_limit;
        let body = match self.fetcher.fetch(&self.url, size_limit).await {
            Ok(body) => body,
            Err(e) => return upstream_failure(e),
        };

        let codec = self.codec.clone();
        let image = match tokio::task::spawn_blocking(move || codec.decode(&body)).await {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => return Outcome::Failed(Failure::new(FailureKind::Decode, e.to_string())),
            Err(e) => return Outcome::Failed(Failure::new(FailureKind::Internal, e.to_string())),
        };

        descriptor.dimensions = Some((image.width(), image.height()));
        if let Decision::Reject(reason) = self.guard.check(&descriptor) {
            return Outcome::Rejected(reason);
        }

        let codec = self.codec.clone();
        match tokio::task::spawn_blocking(move || codec.encode_webp(&image)).await {
            Ok(Ok(webp)) => Outcome::Converted(Bytes::from(webp)),
            Ok(Err(e)) => Outcome::Failed(Failure::new(FailureKind::Internal, e.to_string())),
            Err(e) => Outcome::Failed(Failure::new(FailureKind::Internal, e.to_string())),
        }
    }
}

fn upstream_failure(error: FetchError) -> Outcome {
    match error {
        // the body outgrew its declared length
        FetchError::TooLarge(_) => Outcome::Rejected(RejectionReason::SizeExceeded),
        other => Outcome::Failed(Failure::new(FailureKind::UpstreamFetch, other.to_string())),
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use image::DynamicImage;
    use url::Url;

    use crate::codec::{Codec, CodecError};
    use crate::fetch::{FetchError, Fetcher};

    pub struct FakeSource {
        pub declared: Option<u64>,
        /// `None` makes the body fetch fail.
        pub body: Option<Bytes>,
    }

    /// Serves canned sources keyed by URL and counts calls.
    #[derive(Default)]
    pub struct FakeFetcher {
        pub sources: HashMap<String, FakeSource>,
        pub head_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
    }

    impl FakeFetcher {
        /// Adds a source whose body is `"<width>x<height>"`, understood by [`FakeCodec`].
        pub fn with_image(mut self, url: &str, declared: Option<u64>, width: u32, height: u32) -> Self {
            self.sources.insert(
                url.to_string(),
                FakeSource {
                    declared,
                    body: Some(Bytes::from(format!("{width}x{height}"))),
                },
            );
            self
        }

        pub fn with_source(mut self, url: &str, source: FakeSource) -> Self {
            self.sources.insert(url.to_string(), source);
            self
        }

        pub fn fetches(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        pub fn heads(&self) -> usize {
            self.head_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn head_size(&self, url: &Url) -> Result<Option<u64>, FetchError> {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            let source = self.sources.get(url.as_str()).ok_or(FetchError::Status(404))?;
            Ok(source.declared)
        }

        async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<Bytes, FetchError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            // give concurrent callers a chance to pile up
            tokio::task::yield_now().await;
            let source = self.sources.get(url.as_str()).ok_or(FetchError::Status(404))?;
            let body = source.body.clone().ok_or(FetchError::Status(502))?;
            if body.len() as u64 > max_bytes {
                return Err(FetchError::TooLarge(max_bytes));
            }
            Ok(body)
        }
    }

    /// Decodes `"<width>x<height>"` bodies into blank images.
    #[derive(Default)]
    pub struct FakeCodec {
        pub decode_calls: AtomicUsize,
        pub encode_calls: AtomicUsize,
    }

    impl FakeCodec {
        pub fn decodes(&self) -> usize {
            self.decode_calls.load(Ordering::SeqCst)
        }
    }

    impl Codec for FakeCodec {
        fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
            self.decode_calls.fetch_add(1, Ordering::SeqCst);
            let text = std::str::from_utf8(bytes).map_err(|_| CodecError::UnknownFormat)?;
            let (width, height) = text
                .split_once('x')
                .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
                .ok_or_else(|| CodecError::Decode(format!("malformed source: {text}")))?;
            Ok(DynamicImage::new_luma8(width, height))
        }

        fn encode_webp(&self, image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("RIFF-WEBP-{}x{}", image.width(), image.height()).into_bytes())
        }
    }
}
