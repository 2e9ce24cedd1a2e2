use std::path::PathBuf;
use std::time::Duration;

use seqmine_fetch::FetchPolicy;

pub const DEFAULT_BASE_URL: &str = "https://oeis.org";
pub const DEFAULT_DB_PATH: &str = "data/seqmine.db";
pub const DEFAULT_CACHE_DIR: &str = "data/cache";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub base_url: String,
    pub engine_cmd: Option<String>,
    pub request_timeout: Duration,
    pub fetch_policy: FetchPolicy,
}

impl RuntimeConfig {
    /// Flags win over environment variables, which win over defaults.
    pub fn resolve(
        db: Option<PathBuf>,
        cache_dir: Option<PathBuf>,
        base_url: Option<String>,
        engine_cmd: Option<String>,
    ) -> Self {
        let db_path = db
            .or_else(|| std::env::var("SEQMINE_DB").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let cache_dir = cache_dir
            .or_else(|| std::env::var("SEQMINE_CACHE_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        let base_url = base_url
            .or_else(|| std::env::var("SEQMINE_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let engine_cmd = engine_cmd
            .or_else(|| std::env::var("SEQMINE_ENGINE_CMD").ok())
            .filter(|cmd| !cmd.trim().is_empty());

        Self {
            db_path,
            cache_dir,
            base_url,
            engine_cmd,
            request_timeout: Duration::from_secs(30),
            fetch_policy: FetchPolicy::default(),
        }
    }
}
