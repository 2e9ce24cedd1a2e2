use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote source unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The remote sequence repository: raw record bytes for an id, or a
/// transient failure.
pub trait RemoteSource {
    fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, FetchError>;
}

/// Unbounded append-only cache of raw payloads, one gzip file per id.
/// Purely a performance layer; every entry can be refetched from the
/// remote source.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json.gz"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry_path(id).is_file()
    }

    /// A corrupt or truncated entry is treated as absent and refetched.
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(id);
        let file = File::open(&path).ok()?;
        let mut decoder = GzDecoder::new(file);
        let mut payload = Vec::new();
        match decoder.read_to_end(&mut payload) {
            Ok(_) => Some(payload),
            Err(err) => {
                warn!(id, error = %err, "discarding unreadable cache entry");
                None
            }
        }
    }

    pub fn put(&self, id: &str, payload: &[u8]) -> Result<(), FetchError> {
        let file = File::create(self.entry_path(id))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn fetched_at(&self, id: &str) -> Option<SystemTime> {
        fs::metadata(self.entry_path(id))
            .and_then(|meta| meta.modified())
            .ok()
    }
}

/// HTTP client for the public sequence repository's JSON search endpoint.
pub struct OeisClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl OeisClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl RemoteSource for OeisClient {
    fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}/search?fmt=json&q=id:{id}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Cache-first record access: hits never touch the network, misses are
/// retried with linear backoff and written through to the cache.
pub struct Fetcher<S: RemoteSource> {
    source: S,
    cache: CacheStore,
    policy: FetchPolicy,
}

impl<S: RemoteSource> Fetcher<S> {
    pub fn new(source: S, cache: CacheStore, policy: FetchPolicy) -> Self {
        Self {
            source,
            cache,
            policy,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn fetch(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(payload) = self.cache.get(id) {
            debug!(id, "cache hit");
            return Ok(payload);
        }

        let attempts = self.policy.retries.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.source.fetch_raw(id) {
                Ok(payload) => {
                    if let Err(err) = self.cache.put(id, &payload) {
                        warn!(id, error = %err, "fetched record could not be cached");
                    }
                    return Ok(payload);
                }
                Err(err) => {
                    warn!(id, attempt, error = %err, "remote fetch failed");
                    last = err.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.policy.backoff * attempt);
                    }
                }
            }
        }
        Err(FetchError::Unavailable { attempts, last })
    }
}
