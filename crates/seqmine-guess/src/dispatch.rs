use std::time::Duration;
use tracing::{debug, warn};

use seqmine_core::{
    is_newly_discovered, FoundFormula, GuessAlgo, GuessOutcome, SequenceRecord,
};
use seqmine_storage::{Blacklist, MinerStore, StorageError};

use crate::engine::{EngineError, GuessEngine};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Terms handed to the cheap first-phase guess.
    pub prefix_len: usize,
    /// Below this many published terms a guess is not attempted at all.
    pub min_terms: usize,
    /// Wall-clock budget for each engine invocation.
    pub timeout: Duration,
    /// Retry the full term list when the prefix phase proposes nothing.
    pub full_fallback: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prefix_len: 10,
            min_terms: 8,
            timeout: Duration::from_secs(30),
            full_fallback: true,
        }
    }
}

/// Two-phase guess protocol: a cheap prefix guess filters out the bulk of
/// sequences without a closed form, full-term verification weeds out
/// formulas that only coincidentally match the prefix. Engine timeouts and
/// crashes quarantine the id in the blacklist instead of failing the run.
pub struct Dispatcher<E: GuessEngine> {
    engine: E,
    config: DispatchConfig,
}

impl<E: GuessEngine> Dispatcher<E> {
    pub fn new(engine: E, config: DispatchConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn attempt(
        &self,
        record: &SequenceRecord,
        store: &MinerStore,
        blacklist: &mut Blacklist,
    ) -> Result<GuessOutcome, StorageError> {
        if blacklist.contains(&record.id) {
            debug!(id = %record.id, "blacklisted, skipping guess");
            return Ok(GuessOutcome::skipped("blacklisted"));
        }
        if record.terms.len() < self.config.min_terms {
            debug!(
                id = %record.id,
                terms = record.terms.len(),
                "too few terms for a meaningful guess"
            );
            return Ok(GuessOutcome::NotFound);
        }

        let timeout = self.config.timeout;
        let prefix_len = self.config.prefix_len.min(record.terms.len());
        let prefix = &record.terms[..prefix_len];

        let (formula, algo) = match self.engine.guess(prefix, timeout) {
            Ok(Some(formula)) => (formula, GuessAlgo::Prefix),
            Ok(None) => {
                if !self.config.full_fallback || record.terms.len() == prefix_len {
                    return Ok(GuessOutcome::NotFound);
                }
                match self.engine.guess(&record.terms, timeout) {
                    Ok(Some(formula)) => (formula, GuessAlgo::Full),
                    Ok(None) => return Ok(GuessOutcome::NotFound),
                    Err(err) => {
                        return self.quarantine(record, "full guess", err, store, blacklist)
                    }
                }
            }
            Err(err) => return self.quarantine(record, "prefix guess", err, store, blacklist),
        };

        let verified = match self.engine.eval(&formula, record.terms.len(), timeout) {
            Ok(evaluated) => evaluated == record.terms,
            Err(err) => return self.quarantine(record, "verification", err, store, blacklist),
        };
        if !verified {
            warn!(
                id = %record.id,
                formula,
                "formula reproduces only a prefix, keeping it unverified"
            );
        }

        let simplified = match self.engine.simplify(&formula, timeout) {
            Ok(simplified) => simplified,
            Err(err) => {
                warn!(id = %record.id, formula, error = %err, "engine could not simplify");
                None
            }
        };

        let is_new = is_newly_discovered(
            &formula,
            simplified.as_deref(),
            &record.name,
            &record.raw_formula_text,
        );

        Ok(GuessOutcome::Found(FoundFormula {
            formula,
            simplified,
            algo,
            verified,
            is_new,
        }))
    }

    fn quarantine(
        &self,
        record: &SequenceRecord,
        phase: &str,
        err: EngineError,
        store: &MinerStore,
        blacklist: &mut Blacklist,
    ) -> Result<GuessOutcome, StorageError> {
        let reason = format!("{phase}: {err}");
        warn!(id = %record.id, %reason, "engine failure, blacklisting id");
        blacklist.add(store, &record.id, &reason)?;
        Ok(GuessOutcome::Skipped { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use seqmine_core::XrefRelation;

    enum Reply<T> {
        Value(T),
        Timeout,
    }

    #[derive(Default)]
    struct ScriptedEngine {
        guess_replies: RefCell<VecDeque<Reply<Option<String>>>>,
        eval_replies: RefCell<VecDeque<Reply<Vec<i64>>>>,
        simplify_replies: RefCell<VecDeque<Reply<Option<String>>>>,
        guess_calls: Cell<u32>,
        eval_calls: Cell<u32>,
    }

    impl ScriptedEngine {
        fn on_guess(self, reply: Reply<Option<String>>) -> Self {
            self.guess_replies.borrow_mut().push_back(reply);
            self
        }

        fn on_eval(self, reply: Reply<Vec<i64>>) -> Self {
            self.eval_replies.borrow_mut().push_back(reply);
            self
        }

        fn on_simplify(self, reply: Reply<Option<String>>) -> Self {
            self.simplify_replies.borrow_mut().push_back(reply);
            self
        }
    }

    fn take<T: Default>(queue: &RefCell<VecDeque<Reply<T>>>) -> Result<T, EngineError> {
        match queue.borrow_mut().pop_front() {
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Timeout) => Err(EngineError::Timeout(Duration::from_millis(1))),
            None => Ok(T::default()),
        }
    }

    impl GuessEngine for &ScriptedEngine {
        fn guess(
            &self,
            _terms: &[i64],
            _timeout: Duration,
        ) -> Result<Option<String>, EngineError> {
            self.guess_calls.set(self.guess_calls.get() + 1);
            take(&self.guess_replies)
        }

        fn eval(
            &self,
            _formula: &str,
            _count: usize,
            _timeout: Duration,
        ) -> Result<Vec<i64>, EngineError> {
            self.eval_calls.set(self.eval_calls.get() + 1);
            take(&self.eval_replies)
        }

        fn simplify(
            &self,
            _formula: &str,
            _timeout: Duration,
        ) -> Result<Option<String>, EngineError> {
            take(&self.simplify_replies)
        }

        fn equivalence(
            &self,
            _lhs: &str,
            _rhs: &str,
            _timeout: Duration,
        ) -> Result<Option<XrefRelation>, EngineError> {
            Ok(None)
        }
    }

    fn record(id: &str, terms: &[i64]) -> SequenceRecord {
        SequenceRecord {
            id: id.to_string(),
            name: "test sequence".to_string(),
            raw_formula_text: String::new(),
            terms: terms.to_vec(),
            keyword_flags: Vec::new(),
            visited: false,
            closed_form: None,
            simplified_closed_form: None,
            algo: None,
            check_cf: false,
            is_new: false,
            hard: false,
            not_easy: true,
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            prefix_len: 3,
            min_terms: 3,
            timeout: Duration::from_millis(10),
            full_fallback: true,
        }
    }

    fn fixture() -> (MinerStore, Blacklist) {
        let store = MinerStore::open_in_memory().expect("open db");
        let blacklist = Blacklist::load(&store).expect("load blacklist");
        (store, blacklist)
    }

    #[test]
    fn prefix_hit_is_verified_against_all_terms() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(Some("n".to_string())))
            .on_eval(Reply::Value(vec![1, 2, 3, 4, 5]));
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000027", &[1, 2, 3, 4, 5]), &store, &mut blacklist)
            .expect("attempt");

        match outcome {
            GuessOutcome::Found(found) => {
                assert_eq!(found.formula, "n");
                assert_eq!(found.algo, GuessAlgo::Prefix);
                assert!(found.verified);
                assert!(found.is_new);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(blacklist.is_empty());
        assert_eq!(engine.eval_calls.get(), 1);
    }

    #[test]
    fn prefix_only_match_is_kept_but_unverified() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(Some("n".to_string())))
            .on_eval(Reply::Value(vec![1, 2, 3, 4, 99]));
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000027", &[1, 2, 3, 4, 5]), &store, &mut blacklist)
            .expect("attempt");

        match outcome {
            GuessOutcome::Found(found) => {
                assert_eq!(found.formula, "n");
                assert!(!found.verified);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(blacklist.is_empty());
    }

    #[test]
    fn prefix_miss_falls_back_to_the_full_term_list() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(None))
            .on_guess(Reply::Value(Some("2^n".to_string())))
            .on_eval(Reply::Value(vec![1, 2, 4, 8, 16]));
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000079", &[1, 2, 4, 8, 16]), &store, &mut blacklist)
            .expect("attempt");

        match outcome {
            GuessOutcome::Found(found) => {
                assert_eq!(found.algo, GuessAlgo::Full);
                assert!(found.verified);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(engine.guess_calls.get(), 2);
    }

    #[test]
    fn sequences_without_a_closed_form_are_not_blacklisted() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(None))
            .on_guess(Reply::Value(None));
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000040", &[2, 3, 5, 7, 11]), &store, &mut blacklist)
            .expect("attempt");

        assert_eq!(outcome, GuessOutcome::NotFound);
        assert!(blacklist.is_empty());
        assert_eq!(engine.guess_calls.get(), 2);
    }

    #[test]
    fn timeout_blacklists_and_later_attempts_short_circuit() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default().on_guess(Reply::Timeout);
        let dispatcher = Dispatcher::new(&engine, config());
        let rec = record("A000001", &[1, 1, 1, 2, 1]);

        let outcome = dispatcher
            .attempt(&rec, &store, &mut blacklist)
            .expect("attempt");
        assert!(matches!(outcome, GuessOutcome::Skipped { .. }));
        assert!(blacklist.contains("A000001"));
        assert!(store.blacklist_contains("A000001").expect("durable"));
        assert_eq!(engine.guess_calls.get(), 1);

        let second = dispatcher
            .attempt(&rec, &store, &mut blacklist)
            .expect("second attempt");
        assert!(matches!(second, GuessOutcome::Skipped { .. }));
        assert_eq!(engine.guess_calls.get(), 1);
    }

    #[test]
    fn verification_timeout_also_quarantines() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(Some("n!".to_string())))
            .on_eval(Reply::Timeout);
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000142", &[1, 1, 2, 6, 24]), &store, &mut blacklist)
            .expect("attempt");

        assert!(matches!(outcome, GuessOutcome::Skipped { .. }));
        assert!(blacklist.contains("A000142"));
    }

    #[test]
    fn too_few_terms_never_reach_the_engine() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default();
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000001", &[1, 2]), &store, &mut blacklist)
            .expect("attempt");

        assert_eq!(outcome, GuessOutcome::NotFound);
        assert_eq!(engine.guess_calls.get(), 0);
    }

    #[test]
    fn simplify_failure_keeps_the_discovery() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(Some("n^2".to_string())))
            .on_eval(Reply::Value(vec![0, 1, 4, 9, 16]))
            .on_simplify(Reply::Timeout);
        let dispatcher = Dispatcher::new(&engine, config());

        let outcome = dispatcher
            .attempt(&record("A000290", &[0, 1, 4, 9, 16]), &store, &mut blacklist)
            .expect("attempt");

        match outcome {
            GuessOutcome::Found(found) => {
                assert_eq!(found.formula, "n^2");
                assert!(found.simplified.is_none());
                assert!(found.verified);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert!(blacklist.is_empty());
    }

    #[test]
    fn known_formula_text_is_not_counted_as_new() {
        let (store, mut blacklist) = fixture();
        let engine = ScriptedEngine::default()
            .on_guess(Reply::Value(Some("n^2".to_string())))
            .on_eval(Reply::Value(vec![0, 1, 4, 9, 16]));
        let dispatcher = Dispatcher::new(&engine, config());

        let mut rec = record("A000290", &[0, 1, 4, 9, 16]);
        rec.raw_formula_text = "[\"a(n) = n^2.\"]".to_string();
        let outcome = dispatcher
            .attempt(&rec, &store, &mut blacklist)
            .expect("attempt");

        match outcome {
            GuessOutcome::Found(found) => assert!(!found.is_new),
            other => panic!("expected Found, got {other:?}"),
        }
    }
}
