use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use seqmine_core::raw;
use seqmine_core::stats::MiningStats;
use seqmine_core::{format_id, GuessOutcome, KeywordRules};
use seqmine_fetch::{Fetcher, RemoteSource};
use seqmine_guess::{Dispatcher, GuessEngine};
use seqmine_storage::{Blacklist, MinerStore};

#[derive(Debug, Clone, Copy)]
pub struct MineConfig {
    pub batch_limit: u32,
    pub max_consecutive_failures: u32,
    pub report_every: u64,
}

impl Default for MineConfig {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            max_consecutive_failures: 10,
            report_every: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub stats: MiningStats,
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadSummary {
    pub fetched: u64,
    pub already_cached: u64,
    pub failed: u64,
    pub stopped: bool,
}

/// The main mining loop: select unvisited ids in ascending order, fetch,
/// guess, record. Individual fetch failures leave the record unvisited for
/// a later run; a solid run of consecutive failures aborts the whole run.
pub fn run_mine<S: RemoteSource, E: GuessEngine>(
    store: &MinerStore,
    fetcher: &Fetcher<S>,
    dispatcher: &Dispatcher<E>,
    blacklist: &mut Blacklist,
    rules: &KeywordRules,
    config: &MineConfig,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let mut stats = MiningStats::default();
    let mut consecutive_failures = 0u32;

    loop {
        let batch = store.next_unvisited_batch(config.batch_limit)?;
        if batch.is_empty() {
            info!("no unvisited records remain");
            break;
        }

        for id in batch {
            if stop.load(Ordering::Relaxed) {
                return Ok(RunSummary {
                    stats,
                    stopped: true,
                });
            }

            let payload = match fetcher.fetch(&id) {
                Ok(payload) => {
                    consecutive_failures = 0;
                    payload
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(%id, error = %err, "fetch failed, leaving record for a later run");
                    if consecutive_failures >= config.max_consecutive_failures {
                        bail!(
                            "aborting run after {consecutive_failures} consecutive fetch failures"
                        );
                    }
                    continue;
                }
            };

            let outcome = match raw::parse_payload(&payload) {
                Ok(parsed) => {
                    store.upsert_raw(&parsed, rules.derive(&parsed.keywords))?;
                    let record = match store.record(&id)? {
                        Some(record) => record,
                        None => bail!("record {id} disappeared after upsert"),
                    };
                    dispatcher.attempt(&record, store, blacklist)?
                }
                Err(err) => {
                    warn!(%id, error = %err, "unusable payload, marking record visited");
                    GuessOutcome::NotFound
                }
            };

            store.mark_visited(&id, &outcome)?;
            stats.record(&outcome);

            if let GuessOutcome::Found(found) = &outcome {
                info!(
                    %id,
                    formula = %found.formula,
                    algo = %found.algo,
                    verified = found.verified,
                    is_new = found.is_new,
                    "closed form discovered"
                );
            }
            if stats.processed % config.report_every == 0 {
                info!(
                    processed = stats.processed,
                    found = stats.found,
                    new_found = stats.new_found,
                    found_ratio = stats.found_ratio(),
                    new_ratio = stats.new_ratio(),
                    "progress"
                );
            }
        }
    }

    Ok(RunSummary {
        stats,
        stopped: false,
    })
}

/// Cache pre-warm over an inclusive id range; no analysis, no record store.
pub fn run_download<S: RemoteSource>(
    fetcher: &Fetcher<S>,
    start: u32,
    end: u32,
    max_consecutive_failures: u32,
    stop: &AtomicBool,
) -> Result<DownloadSummary> {
    if start == 0 || end < start {
        bail!("invalid id range [{start}, {end}]");
    }

    let mut summary = DownloadSummary::default();
    let mut consecutive_failures = 0u32;

    for number in start..=end {
        if stop.load(Ordering::Relaxed) {
            summary.stopped = true;
            return Ok(summary);
        }

        let id = format_id(number);
        if fetcher.cache().contains(&id) {
            summary.already_cached += 1;
            continue;
        }
        match fetcher.fetch(&id) {
            Ok(_) => {
                summary.fetched += 1;
                consecutive_failures = 0;
            }
            Err(err) => {
                summary.failed += 1;
                consecutive_failures += 1;
                warn!(%id, error = %err, "download failed");
                if consecutive_failures >= max_consecutive_failures {
                    bail!("aborting download after {consecutive_failures} consecutive failures");
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    use seqmine_core::parse_id;
    use seqmine_fetch::{CacheStore, FetchError, FetchPolicy};
    use seqmine_guess::{DispatchConfig, EngineError, GuessEngine};
    use seqmine_storage::MinerStore;

    struct StubSource {
        data: &'static str,
        fail: bool,
        calls: Cell<u32>,
    }

    impl StubSource {
        fn serving(data: &'static str) -> Self {
            Self {
                data,
                fail: false,
                calls: Cell::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                data: "",
                fail: true,
                calls: Cell::new(0),
            }
        }
    }

    impl RemoteSource for &StubSource {
        fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(FetchError::Status(503));
            }
            let number = parse_id(id).expect("test id");
            Ok(serde_json::json!({
                "count": 1,
                "results": [{
                    "number": number,
                    "name": format!("test sequence {number}"),
                    "data": self.data,
                    "keyword": "nonn",
                    "formula": []
                }]
            })
            .to_string()
            .into_bytes())
        }
    }

    struct FixedEngine {
        formula: Option<&'static str>,
        eval_terms: Vec<i64>,
    }

    impl GuessEngine for &FixedEngine {
        fn guess(
            &self,
            _terms: &[i64],
            _timeout: Duration,
        ) -> Result<Option<String>, EngineError> {
            Ok(self.formula.map(str::to_string))
        }

        fn eval(
            &self,
            _formula: &str,
            _count: usize,
            _timeout: Duration,
        ) -> Result<Vec<i64>, EngineError> {
            Ok(self.eval_terms.clone())
        }

        fn simplify(
            &self,
            _formula: &str,
            _timeout: Duration,
        ) -> Result<Option<String>, EngineError> {
            Ok(None)
        }

        fn equivalence(
            &self,
            _lhs: &str,
            _rhs: &str,
            _timeout: Duration,
        ) -> Result<Option<seqmine_core::XrefRelation>, EngineError> {
            Ok(None)
        }
    }

    fn fetcher_in<'a>(dir: &tempfile::TempDir, source: &'a StubSource) -> Fetcher<&'a StubSource> {
        let cache = CacheStore::open(dir.path().join("cache")).expect("open cache");
        Fetcher::new(
            source,
            cache,
            FetchPolicy {
                retries: 1,
                backoff: Duration::from_millis(1),
            },
        )
    }

    fn dispatcher(engine: &FixedEngine) -> Dispatcher<&FixedEngine> {
        Dispatcher::new(
            engine,
            DispatchConfig {
                prefix_len: 4,
                min_terms: 4,
                timeout: Duration::from_millis(10),
                full_fallback: true,
            },
        )
    }

    #[test]
    fn run_processes_every_seeded_record_then_stops() {
        let store = MinerStore::open_in_memory().expect("open db");
        store.seed_ids(2).expect("seed");
        let mut blacklist = Blacklist::load(&store).expect("load");

        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::serving("1,2,3,4,5,6");
        let fetcher = fetcher_in(&dir, &source);
        let engine = FixedEngine {
            formula: Some("n+1"),
            eval_terms: vec![1, 2, 3, 4, 5, 6],
        };
        let dispatcher = dispatcher(&engine);
        let stop = AtomicBool::new(false);

        let summary = run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &KeywordRules::default(),
            &MineConfig::default(),
            &stop,
        )
        .expect("run");

        assert!(!summary.stopped);
        assert_eq!(summary.stats.processed, 2);
        assert_eq!(summary.stats.found, 2);
        assert_eq!(source.calls.get(), 2);
        assert_eq!(store.recompute_stats().expect("recompute"), summary.stats);

        let record = store.record("A000001").expect("query").expect("exists");
        assert!(record.visited);
        assert_eq!(record.closed_form.as_deref(), Some("n+1"));
        assert!(record.check_cf);
    }

    #[test]
    fn second_run_finds_nothing_left_and_never_refetches() {
        let store = MinerStore::open_in_memory().expect("open db");
        store.seed_ids(2).expect("seed");
        let mut blacklist = Blacklist::load(&store).expect("load");

        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::serving("1,1,1,1,1");
        let fetcher = fetcher_in(&dir, &source);
        let engine = FixedEngine {
            formula: None,
            eval_terms: Vec::new(),
        };
        let dispatcher = dispatcher(&engine);
        let stop = AtomicBool::new(false);

        let first = run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &KeywordRules::default(),
            &MineConfig::default(),
            &stop,
        )
        .expect("first run");
        assert_eq!(first.stats.processed, 2);
        let calls_after_first = source.calls.get();

        let second = run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &KeywordRules::default(),
            &MineConfig::default(),
            &stop,
        )
        .expect("second run");
        assert_eq!(second.stats.processed, 0);
        assert_eq!(source.calls.get(), calls_after_first);
    }

    #[test]
    fn consecutive_fetch_failures_abort_the_run() {
        let store = MinerStore::open_in_memory().expect("open db");
        store.seed_ids(5).expect("seed");
        let mut blacklist = Blacklist::load(&store).expect("load");

        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::failing();
        let fetcher = fetcher_in(&dir, &source);
        let engine = FixedEngine {
            formula: None,
            eval_terms: Vec::new(),
        };
        let dispatcher = dispatcher(&engine);

        let result = run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &KeywordRules::default(),
            &MineConfig {
                max_consecutive_failures: 3,
                ..Default::default()
            },
            &AtomicBool::new(false),
        );

        assert!(result.is_err());
        // Nothing was marked visited, so a later run can retry everything.
        assert_eq!(store.recompute_stats().expect("recompute").processed, 0);
    }

    #[test]
    fn stop_flag_halts_before_the_next_record() {
        let store = MinerStore::open_in_memory().expect("open db");
        store.seed_ids(3).expect("seed");
        let mut blacklist = Blacklist::load(&store).expect("load");

        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::serving("1,2,3,4");
        let fetcher = fetcher_in(&dir, &source);
        let engine = FixedEngine {
            formula: None,
            eval_terms: Vec::new(),
        };
        let dispatcher = dispatcher(&engine);

        let summary = run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &KeywordRules::default(),
            &MineConfig::default(),
            &AtomicBool::new(true),
        )
        .expect("run");

        assert!(summary.stopped);
        assert_eq!(summary.stats.processed, 0);
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn download_prewarms_the_cache_and_skips_existing_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::serving("1,2,3");
        let fetcher = fetcher_in(&dir, &source);
        let stop = AtomicBool::new(false);

        let first = run_download(&fetcher, 1, 3, 5, &stop).expect("download");
        assert_eq!(first.fetched, 3);
        assert_eq!(first.already_cached, 0);

        let second = run_download(&fetcher, 1, 3, 5, &stop).expect("redownload");
        assert_eq!(second.fetched, 0);
        assert_eq!(second.already_cached, 3);
        assert_eq!(source.calls.get(), 3);
    }

    #[test]
    fn download_rejects_a_backwards_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = StubSource::serving("1");
        let fetcher = fetcher_in(&dir, &source);
        assert!(run_download(&fetcher, 5, 2, 3, &AtomicBool::new(false)).is_err());
    }
}
