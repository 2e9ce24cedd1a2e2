use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use seqmine_storage::{Blacklist, MinerStore, StorageError};

use crate::engine::GuessEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XrefReport {
    pub pairs: u64,
    pub compared: u64,
    pub matched: u64,
    pub skipped: u64,
}

/// Blacklist key for a pair of ids; the pass is keyed by pairs, not single
/// ids, so a hang on one comparison never suppresses the rest.
pub fn pair_key(id_a: &str, id_b: &str) -> String {
    format!("{id_a}|{id_b}")
}

/// Pairwise symbolic-equivalence pass over all discovered closed forms.
/// Quadratic in the number of discoveries, which stays orders of magnitude
/// below the corpus size. Already-recorded and blacklisted pairs are
/// skipped, so re-running is idempotent.
pub struct XrefMatcher<E: GuessEngine> {
    engine: E,
    timeout: Duration,
}

impl<E: GuessEngine> XrefMatcher<E> {
    pub fn new(engine: E, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn run(
        &self,
        store: &MinerStore,
        blacklist: &mut Blacklist,
        stop: &AtomicBool,
    ) -> Result<XrefReport, StorageError> {
        let forms = store.closed_forms()?;
        let mut report = XrefReport::default();

        for (i, (id_a, cf_a)) in forms.iter().enumerate() {
            for (id_b, cf_b) in forms.iter().skip(i + 1) {
                if stop.load(Ordering::Relaxed) {
                    info!(?report, "cross-reference pass stopped early");
                    return Ok(report);
                }
                report.pairs += 1;

                let key = pair_key(id_a, id_b);
                if blacklist.contains(&key) || store.xref_exists(id_a, id_b)? {
                    report.skipped += 1;
                    continue;
                }

                report.compared += 1;
                match self.engine.equivalence(cf_a, cf_b, self.timeout) {
                    Ok(Some(relation)) => {
                        store.insert_xref(id_a, id_b, relation)?;
                        report.matched += 1;
                        info!(%id_a, %id_b, relation = %relation, "closed forms match");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let reason = format!("equivalence: {err}");
                        warn!(%id_a, %id_b, %reason, "engine failure, blacklisting pair");
                        blacklist.add(store, &key, &reason)?;
                    }
                }
            }
        }

        Ok(report)
    }
}
