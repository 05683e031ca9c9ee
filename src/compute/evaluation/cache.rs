//! Memoizing evaluation cache with staleness tracking.
//!
//! Every identity maps to one of three slot states:
//!
//! - `Ready`: a completed evaluation (the only state visible as an entry),
//! - `InFlight`: an evaluation is running; callers wait on its latch. A
//!   refresh keeps the entry's age on the slot so generations keep counting,
//! - `Retiring`: the entry was evicted and its artifacts are being removed;
//!   callers wait for the removal, then evaluate afresh.
//!
//! The map lock is held only for state transitions. Evaluation and artifact
//! cleanup run outside it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::schema::{ArtifactHandle, FitnessRecord, Identity};

use super::evaluator::{CacheConsistencyError, Deadline, EvalError, Evaluation, Evaluator};
use super::latch::Latch;

type EvalResult = Result<FitnessRecord, EvalError>;

/// A completed evaluation held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub record: FitnessRecord,
    pub artifact: ArtifactHandle,
    /// Generation boundaries since the identity last appeared in a population.
    pub generations_since_use: usize,
}

enum Slot {
    Ready(CacheEntry),
    InFlight {
        latch: Arc<Latch<EvalResult>>,
        /// Age of the entry being refreshed; `None` for a first evaluation.
        age: Option<usize>,
    },
    Retiring(Arc<Latch<()>>),
}

#[derive(Default)]
struct State {
    slots: HashMap<Identity, Slot>,
    /// Artifacts whose cleanup failed, retried on the next sweep.
    pending_cleanup: Vec<(Identity, ArtifactHandle)>,
    /// Number of `mark_used` calls so far.
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered by an existing entry.
    pub hits: u64,
    /// Lookups that ran the evaluator (including refreshes).
    pub misses: u64,
    /// Lookups that waited for another caller's evaluation.
    pub coalesced: u64,
    /// Evaluations that failed.
    pub failures: u64,
    /// Entries removed by eviction.
    pub evictions: u64,
}

/// Artifact cleanup failed during eviction. The cleanup is retried on the
/// next sweep.
#[derive(Debug, thiserror::Error)]
#[error("Cleanup of {identity} failed: {source}")]
pub struct EvictionIoError {
    pub identity: Identity,
    #[source]
    pub source: io::Error,
}

/// Outcome of one eviction sweep.
#[derive(Debug, Default)]
pub struct EvictionReport {
    /// Entries removed in this sweep.
    pub evicted: Vec<Identity>,
    /// Earlier failed cleanups attempted again.
    pub retried: usize,
    /// Cleanups that failed in this sweep.
    pub failures: Vec<EvictionIoError>,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub identity: Identity,
    pub generations_since_use: usize,
    pub record: FitnessRecord,
}

/// Read-only view of the whole cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    /// Number of `mark_used` calls so far.
    pub generation: u64,
    /// Entries, ordered by identity.
    pub entries: Vec<EntrySummary>,
    pub in_flight: usize,
    pub retiring: usize,
    pub pending_cleanup: usize,
}

impl CacheSummary {
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter().map(|e| &e.identity)
    }

    pub fn age_of(&self, identity: &Identity) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| &e.identity == identity)
            .map(|e| e.generations_since_use)
    }
}

impl fmt::Display for CacheSummary {
    /// `[ID: key: score, key: score; ID: fitness]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: ", entry.identity)?;
            if entry.record.sub_scores.is_empty() {
                write!(f, "{}", entry.record.fitness)?;
            } else {
                for (j, (key, score)) in entry.record.sub_scores.iter().enumerate() {
                    if j > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {score}")?;
                }
            }
        }
        f.write_str("]")
    }
}

/// Memoizes evaluator results by identity.
pub struct EvaluationCache<E> {
    evaluator: E,
    state: Mutex<State>,
    counters: Counters,
}

impl<E: Evaluator> EvaluationCache<E> {
    /// Create an empty cache in front of `evaluator`.
    pub fn new(evaluator: E) -> Self {
        Self {
            evaluator,
            state: Mutex::new(State::default()),
            counters: Counters::default(),
        }
    }

    /// The wrapped evaluator.
    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached fitness of `identity`, evaluating it if needed.
    ///
    /// Concurrent calls for the same identity share one evaluation and all
    /// receive its result, success or failure.
    pub fn lookup_or_compute(&self, identity: &Identity, deadline: Deadline) -> EvalResult {
        loop {
            let mut state = self.lock();
            match state.slots.get(identity) {
                Some(Slot::Ready(entry)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.record.clone());
                }
                Some(Slot::InFlight { latch, .. }) => {
                    let latch = Arc::clone(latch);
                    drop(state);
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!("Waiting for in-flight evaluation of {identity}");
                    return latch
                        .wait(deadline.instant())
                        .unwrap_or_else(|| Err(deadline_exceeded(identity)));
                }
                Some(Slot::Retiring(latch)) => {
                    let latch = Arc::clone(latch);
                    drop(state);
                    debug!("Waiting for cleanup of {identity} before re-evaluating");
                    if latch.wait(deadline.instant()).is_none() {
                        return Err(deadline_exceeded(identity));
                    }
                }
                None => {
                    let latch = Arc::new(Latch::new());
                    state.slots.insert(
                        identity.clone(),
                        Slot::InFlight {
                            latch: Arc::clone(&latch),
                            age: None,
                        },
                    );
                    drop(state);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!("Evaluating {identity}");

                    let guard = InFlight::new(self, identity, latch, None);
                    let outcome = self.evaluator.evaluate(identity, deadline);
                    return guard.finish(self.check_deadline(identity, outcome, deadline));
                }
            }
        }
    }

    /// Re-run refinement for a cached identity, starting from its artifact.
    ///
    /// Without an entry this is [`lookup_or_compute`](Self::lookup_or_compute).
    /// On failure the previous entry is restored unchanged.
    pub fn refresh(&self, identity: &Identity, deadline: Deadline) -> EvalResult {
        let mut state = self.lock();
        let previous = match state.slots.remove(identity) {
            Some(Slot::Ready(entry)) => entry,
            Some(other) => {
                state.slots.insert(identity.clone(), other);
                drop(state);
                return self.lookup_or_compute(identity, deadline);
            }
            None => {
                drop(state);
                return self.lookup_or_compute(identity, deadline);
            }
        };
        let latch = Arc::new(Latch::new());
        state.slots.insert(
            identity.clone(),
            Slot::InFlight {
                latch: Arc::clone(&latch),
                age: Some(previous.generations_since_use),
            },
        );
        drop(state);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Refining {identity}");

        let artifact = previous.artifact.clone();
        let guard = InFlight::new(self, identity, latch, Some(previous));
        let outcome = self.evaluator.refine(identity, &artifact, deadline);
        guard.finish(self.check_deadline(identity, outcome, deadline))
    }

    /// An evaluation that returns after its deadline is a failure. Its
    /// artifacts are released right away since no entry will own them.
    fn check_deadline(
        &self,
        identity: &Identity,
        outcome: Result<Evaluation, EvalError>,
        deadline: Deadline,
    ) -> Result<Evaluation, EvalError> {
        match outcome {
            Ok(evaluation) if deadline.is_expired() => {
                if let Err(err) = self.evaluator.cleanup(identity, &evaluation.artifact) {
                    warn!("Could not release late artifacts of {identity}: {err}");
                }
                Err(deadline_exceeded(identity))
            }
            other => other,
        }
    }

    /// Start a new generation: reset the age of every listed identity and
    /// age every other entry by one.
    ///
    /// Entries under refresh are aged the same way. Listed identities without
    /// an entry are ignored.
    pub fn mark_used<'a, I>(&self, identities: I)
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let used: HashSet<&Identity> = identities.into_iter().collect();
        let mut state = self.lock();
        state.generation += 1;
        for (identity, slot) in state.slots.iter_mut() {
            let age = match slot {
                Slot::Ready(entry) => &mut entry.generations_since_use,
                Slot::InFlight { age: Some(age), .. } => age,
                _ => continue,
            };
            if used.contains(identity) {
                *age = 0;
            } else {
                *age += 1;
            }
        }
    }

    /// Remove every entry unused for more than `max_age` generations and
    /// release its artifacts.
    ///
    /// In-flight evaluations are never touched. Failed cleanups are reported,
    /// kept, and retried on the next sweep unless the identity has been
    /// evaluated again in the meantime.
    pub fn evict_stale(&self, max_age: usize) -> EvictionReport {
        let retiring = Arc::new(Latch::new());
        let mut report = EvictionReport::default();
        let mut work = Vec::new();

        {
            let mut state = self.lock();
            let stale: Vec<Identity> = state
                .slots
                .iter()
                .filter_map(|(identity, slot)| match slot {
                    Slot::Ready(entry) if entry.generations_since_use > max_age => {
                        Some(identity.clone())
                    }
                    _ => None,
                })
                .collect();

            for identity in stale {
                let previous = state
                    .slots
                    .insert(identity.clone(), Slot::Retiring(Arc::clone(&retiring)));
                if let Some(Slot::Ready(entry)) = previous {
                    report.evicted.push(identity.clone());
                    work.push((identity, entry.artifact));
                }
            }

            for (identity, artifact) in std::mem::take(&mut state.pending_cleanup) {
                if state.slots.contains_key(&identity) {
                    debug!("Dropping stale cleanup of {identity}, identity is live again");
                    continue;
                }
                state
                    .slots
                    .insert(identity.clone(), Slot::Retiring(Arc::clone(&retiring)));
                report.retried += 1;
                work.push((identity, artifact));
            }
        }

        let mut failed = Vec::new();
        for (identity, artifact) in &work {
            debug!("Releasing artifacts of {identity}");
            if let Err(source) = self.evaluator.cleanup(identity, artifact) {
                warn!("Cleanup of {identity} failed, will retry: {source}");
                failed.push((identity.clone(), artifact.clone()));
                report.failures.push(EvictionIoError {
                    identity: identity.clone(),
                    source,
                });
            }
        }

        {
            let mut state = self.lock();
            for (identity, _) in &work {
                let ours = matches!(
                    state.slots.get(identity),
                    Some(Slot::Retiring(latch)) if Arc::ptr_eq(latch, &retiring)
                );
                if ours {
                    state.slots.remove(identity);
                }
            }
            state.pending_cleanup.extend(failed);
        }
        retiring.publish(());

        self.counters
            .evictions
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        if !report.evicted.is_empty() || !report.failures.is_empty() {
            info!(
                "Evicted {} stale entries ({} cleanup failures, {} retried)",
                report.evicted.len(),
                report.failures.len(),
                report.retried
            );
        }
        report
    }

    /// Read-only snapshot for diagnostics.
    pub fn describe(&self) -> CacheSummary {
        let state = self.lock();
        let mut summary = CacheSummary {
            generation: state.generation,
            pending_cleanup: state.pending_cleanup.len(),
            ..Default::default()
        };
        for (identity, slot) in &state.slots {
            match slot {
                Slot::Ready(entry) => summary.entries.push(EntrySummary {
                    identity: identity.clone(),
                    generations_since_use: entry.generations_since_use,
                    record: entry.record.clone(),
                }),
                Slot::InFlight { .. } => summary.in_flight += 1,
                Slot::Retiring(_) => summary.retiring += 1,
            }
        }
        drop(state);
        summary.entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summary
    }

    /// The entry for `identity`, if one exists.
    pub fn get(&self, identity: &Identity) -> Option<CacheEntry> {
        match self.lock().slots.get(identity) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        matches!(self.lock().slots.get(identity), Some(Slot::Ready(_)))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

fn deadline_exceeded(identity: &Identity) -> EvalError {
    EvalError::DeadlineExceeded {
        identity: identity.clone(),
    }
}

/// Owns an `InFlight` slot until the evaluation result is installed.
///
/// Dropped without `finish` (the evaluator panicked), it restores the
/// previous entry or removes the placeholder and releases waiters with
/// [`EvalError::Aborted`].
struct InFlight<'a, E: Evaluator> {
    cache: &'a EvaluationCache<E>,
    identity: &'a Identity,
    latch: Arc<Latch<EvalResult>>,
    previous: Option<CacheEntry>,
    finished: bool,
}

impl<'a, E: Evaluator> InFlight<'a, E> {
    fn new(
        cache: &'a EvaluationCache<E>,
        identity: &'a Identity,
        latch: Arc<Latch<EvalResult>>,
        previous: Option<CacheEntry>,
    ) -> Self {
        Self {
            cache,
            identity,
            latch,
            previous,
            finished: false,
        }
    }

    fn finish(mut self, outcome: Result<Evaluation, EvalError>) -> EvalResult {
        let result = self.settle(outcome);
        self.latch.publish(result.clone());
        self.finished = true;
        result
    }

    /// Swap the placeholder for the outcome under the map lock.
    fn settle(&mut self, outcome: Result<Evaluation, EvalError>) -> EvalResult {
        let mut state = self.cache.lock();
        let age = match state.slots.get(self.identity) {
            Some(Slot::InFlight { latch, age }) if Arc::ptr_eq(latch, &self.latch) => *age,
            _ => {
                return Err(CacheConsistencyError {
                    identity: self.identity.clone(),
                    detail: "in-flight placeholder vanished before install",
                }
                .into());
            }
        };

        match outcome {
            Ok(evaluation) => {
                let generations_since_use = age.unwrap_or(0);
                self.previous = None;
                let record = evaluation.record.clone();
                state.slots.insert(
                    self.identity.clone(),
                    Slot::Ready(CacheEntry {
                        record: evaluation.record,
                        artifact: evaluation.artifact,
                        generations_since_use,
                    }),
                );
                Ok(record)
            }
            Err(err) => {
                self.cache.counters.failures.fetch_add(1, Ordering::Relaxed);
                match self.previous.take() {
                    Some(mut previous) => {
                        if let Some(age) = age {
                            previous.generations_since_use = age;
                        }
                        state
                            .slots
                            .insert(self.identity.clone(), Slot::Ready(previous));
                    }
                    None => {
                        state.slots.remove(self.identity);
                    }
                }
                debug!("Evaluation of {} failed: {err}", self.identity);
                Err(err)
            }
        }
    }
}

impl<E: Evaluator> Drop for InFlight<'_, E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Evaluation of {} abandoned", self.identity);
        let aborted = EvalError::Aborted {
            identity: self.identity.clone(),
        };
        let result = self.settle(Err(aborted));
        self.latch.publish(result);
    }
}
