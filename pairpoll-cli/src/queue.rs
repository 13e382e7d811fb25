/// Crash-safe claim/commit queue, one status map per responder.
///
/// Status transitions:
///   Unprocessed -> Claimed          claim_next, under the question's lease
///   Claimed     -> Answered(text)   commit, under the question's lease
///   Claimed     -> Unprocessed      reset_claimed, explicit recovery
///
/// `claim_next` scans without a lease, then re-reads each candidate under its
/// lease before mutating. Only the locked re-read decides; the scan is advisory.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lease::LockManager;
use crate::records::QuestionRecord;
use crate::store::{SharedMap, StoreError};

/// Key holding option metadata for every loaded question (shared by all responders).
const OPTIONS_KEY: &str = "question-options";

/// How long `commit` and `reset_claimed` wait for a briefly held lease.
const DEFAULT_LEASE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "answer", rename_all = "snake_case")]
pub enum QuestionStatus {
    Unprocessed,
    Claimed,
    Answered(String),
}

impl QuestionStatus {
    fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(raw: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn label(&self) -> &'static str {
        match self {
            QuestionStatus::Unprocessed => "unprocessed",
            QuestionStatus::Claimed => "claimed",
            QuestionStatus::Answered(_) => "answered",
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("question is {found} for responder {responder}, expected claimed: {question:?}")]
    InconsistentState {
        responder: String,
        question: String,
        found: &'static str,
    },
    #[error("question not loaded for responder {responder}: {question:?}")]
    UnknownQuestion { responder: String, question: String },
    #[error("lease for {question:?} (responder {responder}) is held elsewhere")]
    LeaseUnavailable { responder: String, question: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub unprocessed: usize,
    pub claimed: usize,
    pub answered: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.unprocessed + self.claimed + self.answered
    }
}

/// The two options a question asks about, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionPair {
    pub option_a: String,
    pub option_b: String,
}

/// One answered question, ready for export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsweredQuestion {
    pub question: String,
    pub options: Option<OptionPair>,
    pub answer: String,
}

fn status_key(responder: &str) -> String {
    format!("status:{responder}")
}

pub struct QuestionQueue {
    store: Arc<dyn SharedMap>,
    locks: LockManager,
    lease_wait: Duration,
}

impl QuestionQueue {
    pub fn new(store: Arc<dyn SharedMap>, lease_timeout: Duration) -> Self {
        QuestionQueue {
            locks: LockManager::new(store.clone(), lease_timeout),
            store,
            lease_wait: DEFAULT_LEASE_WAIT,
        }
    }

    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }

    /// Add questions as `Unprocessed`, leaving any existing status untouched.
    /// Duplicate question text collapses to one entry.
    pub fn load(&self, responder: &str, questions: &[QuestionRecord]) -> Result<LoadSummary, QueueError> {
        let key = status_key(responder);
        let unprocessed = QuestionStatus::Unprocessed.encode()?;
        let mut seen = HashSet::new();
        let mut summary = LoadSummary::default();

        for record in questions {
            if !seen.insert(record.question.as_str()) {
                continue;
            }
            if self.store.set_if_absent(&key, &record.question, &unprocessed)? {
                summary.inserted += 1;
            } else {
                summary.existing += 1;
            }
            if let Some(options) = record.options() {
                let encoded = serde_json::to_string(&options).map_err(StoreError::from)?;
                self.store.set_if_absent(OPTIONS_KEY, &record.question, &encoded)?;
            }
        }

        info!(responder, inserted = summary.inserted, existing = summary.existing, "loaded questions");
        Ok(summary)
    }

    fn entries(&self, responder: &str) -> Result<Vec<(String, QuestionStatus)>, QueueError> {
        let mut entries = Vec::new();
        for (question, raw) in self.store.get_all(&status_key(responder))? {
            match QuestionStatus::decode(&raw) {
                Ok(status) => entries.push((question, status)),
                Err(e) => warn!(responder, question = %question, error = %e, "skipping undecodable status"),
            }
        }
        Ok(entries)
    }

    pub fn status(&self, responder: &str, question: &str) -> Result<Option<QuestionStatus>, QueueError> {
        match self.store.get(&status_key(responder), question)? {
            Some(raw) => Ok(Some(QuestionStatus::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_status(&self, responder: &str, question: &str, status: &QuestionStatus) -> Result<(), QueueError> {
        self.store.set(&status_key(responder), question, &status.encode()?)?;
        Ok(())
    }

    /// Claim one unprocessed question, or `None` if none can be claimed right now.
    ///
    /// Candidates are tried in random order so concurrent workers rarely
    /// contend for the same lease.
    pub fn claim_next(&self, responder: &str) -> Result<Option<String>, QueueError> {
        let mut candidates: Vec<String> = self
            .entries(responder)?
            .into_iter()
            .filter(|(_, status)| *status == QuestionStatus::Unprocessed)
            .map(|(question, _)| question)
            .collect();
        candidates.shuffle(&mut rand::rng());

        for question in candidates {
            let Some(guard) = self.locks.try_acquire(responder, &question)? else {
                debug!(responder, question = %question, "lease busy, trying next candidate");
                continue;
            };

            // Another worker may have claimed it between the scan and the lease.
            if self.status(responder, &question)? == Some(QuestionStatus::Unprocessed) {
                self.write_status(responder, &question, &QuestionStatus::Claimed)?;
                // The claim is already written; a stuck lease only delays the commit.
                if let Err(e) = guard.release() {
                    warn!(responder, question = %question, error = %e, "failed to release lease after claim; it will expire on its own");
                }
                debug!(responder, question = %question, "claimed");
                return Ok(Some(question));
            }
            guard.release()?;
        }

        Ok(None)
    }

    /// Store the answer for a question this worker claimed.
    ///
    /// Fails with `InconsistentState` unless the question is currently `Claimed`;
    /// in that case the stored status is left as it was.
    pub fn commit(&self, responder: &str, question: &str, answer: &str) -> Result<(), QueueError> {
        let Some(guard) = self.locks.acquire(responder, question, self.lease_wait)? else {
            return Err(QueueError::LeaseUnavailable {
                responder: responder.to_string(),
                question: question.to_string(),
            });
        };

        match self.status(responder, question)? {
            Some(QuestionStatus::Claimed) => {
                self.write_status(responder, question, &QuestionStatus::Answered(answer.to_string()))?;
                if let Err(e) = guard.release() {
                    warn!(responder, question, error = %e, "failed to release lease after commit; it will expire on its own");
                }
                Ok(())
            }
            Some(other) => Err(QueueError::InconsistentState {
                responder: responder.to_string(),
                question: question.to_string(),
                found: other.label(),
            }),
            None => Err(QueueError::UnknownQuestion {
                responder: responder.to_string(),
                question: question.to_string(),
            }),
        }
    }

    /// Return every `Claimed` question to `Unprocessed`. Only safe while no
    /// worker holds a claim on this store.
    pub fn reset_claimed(&self, responder: &str) -> Result<usize, QueueError> {
        let mut reset = 0;
        for (question, status) in self.entries(responder)? {
            if status != QuestionStatus::Claimed {
                continue;
            }
            let Some(guard) = self.locks.acquire(responder, &question, self.lease_wait)? else {
                warn!(responder, question = %question, "lease busy during reset; leaving claimed");
                continue;
            };
            if self.status(responder, &question)? == Some(QuestionStatus::Claimed) {
                self.write_status(responder, &question, &QuestionStatus::Unprocessed)?;
                reset += 1;
            }
            guard.release()?;
        }

        if reset > 0 {
            info!(responder, reset, "returned claimed questions to the queue");
        }
        Ok(reset)
    }

    /// Remove all outstanding leases left by crashed processes.
    pub fn clear_locks(&self) -> Result<usize, QueueError> {
        let cleared = self.locks.clear()?;
        info!(cleared, "cleared leases");
        Ok(cleared)
    }

    /// Drop every status for a responder.
    pub fn clear(&self, responder: &str) -> Result<(), QueueError> {
        self.store.delete(&status_key(responder))?;
        Ok(())
    }

    pub fn stats(&self, responder: &str) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for (_, status) in self.entries(responder)? {
            match status {
                QuestionStatus::Unprocessed => stats.unprocessed += 1,
                QuestionStatus::Claimed => stats.claimed += 1,
                QuestionStatus::Answered(_) => stats.answered += 1,
            }
        }
        Ok(stats)
    }

    /// Every answered question for a responder, with option metadata when loaded.
    pub fn answered(&self, responder: &str) -> Result<Vec<AnsweredQuestion>, QueueError> {
        let mut answered = Vec::new();
        for (question, status) in self.entries(responder)? {
            let QuestionStatus::Answered(answer) = status else {
                continue;
            };
            let options = match self.store.get(OPTIONS_KEY, &question)? {
                Some(raw) => Some(serde_json::from_str(&raw).map_err(StoreError::from)?),
                None => None,
            };
            answered.push(AnsweredQuestion { question, options, answer });
        }
        Ok(answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use crate::store::{LeaseToken, MemoryStore};

    fn queue() -> QuestionQueue {
        QuestionQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(10))
            .with_lease_wait(Duration::from_millis(100))
    }

    fn questions(texts: &[&str]) -> Vec<QuestionRecord> {
        texts.iter().map(|t| QuestionRecord::plain(*t)).collect()
    }

    #[test]
    fn test_load_is_idempotent_and_preserves_progress() {
        let q = queue();
        let qs = questions(&["q1", "q2", "q3", "q1"]);
        assert_eq!(q.load("m", &qs).unwrap(), LoadSummary { inserted: 3, existing: 0 });

        let claimed = q.claim_next("m").unwrap().unwrap();
        let answered = q.claim_next("m").unwrap().unwrap();
        q.commit("m", &answered, "Pizza").unwrap();

        assert_eq!(q.load("m", &qs).unwrap(), LoadSummary { inserted: 0, existing: 3 });
        assert_eq!(q.status("m", &claimed).unwrap(), Some(QuestionStatus::Claimed));
        assert_eq!(
            q.status("m", &answered).unwrap(),
            Some(QuestionStatus::Answered("Pizza".to_string()))
        );
        assert_eq!(q.stats("m").unwrap(), QueueStats { unprocessed: 1, claimed: 1, answered: 1 });
    }

    #[test]
    fn test_claim_drains_queue_then_returns_none() {
        let q = queue();
        q.load("m", &questions(&["a", "b"])).unwrap();

        let mut claimed = vec![q.claim_next("m").unwrap().unwrap(), q.claim_next("m").unwrap().unwrap()];
        claimed.sort();
        assert_eq!(claimed, vec!["a", "b"]);
        assert!(q.claim_next("m").unwrap().is_none());
        assert!(q.claim_next("unknown-responder").unwrap().is_none());
    }

    #[test]
    fn test_claim_skips_leased_question() {
        let q = queue();
        q.load("m", &questions(&["busy", "free"])).unwrap();

        let _held = q.locks.try_acquire("m", "busy").unwrap().unwrap();
        assert_eq!(q.claim_next("m").unwrap().as_deref(), Some("free"));
        assert!(q.claim_next("m").unwrap().is_none());
        assert_eq!(q.status("m", "busy").unwrap(), Some(QuestionStatus::Unprocessed));
    }

    #[test]
    fn test_responders_have_independent_queues() {
        let q = queue();
        let qs = questions(&["only"]);
        q.load("gpt", &qs).unwrap();
        q.load("claude", &qs).unwrap();

        assert!(q.claim_next("gpt").unwrap().is_some());
        assert!(q.claim_next("claude").unwrap().is_some());
    }

    #[test]
    fn test_commit_requires_claimed_state() {
        let q = queue();
        q.load("m", &questions(&["q"])).unwrap();

        let err = q.commit("m", "q", "too early").unwrap_err();
        assert!(matches!(err, QueueError::InconsistentState { found: "unprocessed", .. }));
        assert_eq!(q.status("m", "q").unwrap(), Some(QuestionStatus::Unprocessed));

        q.claim_next("m").unwrap().unwrap();
        q.commit("m", "q", "first").unwrap();

        let err = q.commit("m", "q", "second").unwrap_err();
        assert!(matches!(err, QueueError::InconsistentState { found: "answered", .. }));
        assert_eq!(q.status("m", "q").unwrap(), Some(QuestionStatus::Answered("first".to_string())));

        assert!(matches!(
            q.commit("m", "never loaded", "x").unwrap_err(),
            QueueError::UnknownQuestion { .. }
        ));
    }

    #[test]
    fn test_commit_fails_while_lease_is_held_elsewhere() {
        let q = queue();
        q.load("m", &questions(&["q"])).unwrap();
        q.claim_next("m").unwrap().unwrap();

        let held = q.locks.try_acquire("m", "q").unwrap().unwrap();
        assert!(matches!(q.commit("m", "q", "x").unwrap_err(), QueueError::LeaseUnavailable { .. }));
        assert_eq!(q.status("m", "q").unwrap(), Some(QuestionStatus::Claimed));

        held.release().unwrap();
        q.commit("m", "q", "x").unwrap();
    }

    #[test]
    fn test_reset_claimed_recovers_only_claimed() {
        let q = queue();
        q.load("m", &questions(&["a", "b", "c"])).unwrap();
        let answered = q.claim_next("m").unwrap().unwrap();
        q.commit("m", &answered, "done").unwrap();
        let crashed = q.claim_next("m").unwrap().unwrap();

        assert_eq!(q.reset_claimed("m").unwrap(), 1);
        assert_eq!(q.status("m", &crashed).unwrap(), Some(QuestionStatus::Unprocessed));
        assert_eq!(
            q.status("m", &answered).unwrap(),
            Some(QuestionStatus::Answered("done".to_string()))
        );
        assert_eq!(q.stats("m").unwrap(), QueueStats { unprocessed: 2, claimed: 0, answered: 1 });

        let mut reclaimed = vec![q.claim_next("m").unwrap().unwrap(), q.claim_next("m").unwrap().unwrap()];
        reclaimed.sort();
        assert!(reclaimed.contains(&crashed));
    }

    #[test]
    fn test_concurrent_claimers_single_question() {
        let q = Arc::new(queue());
        q.load("m", &questions(&["contested"])).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || q.claim_next("m").unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(winners, 1);
        assert_eq!(q.status("m", "contested").unwrap(), Some(QuestionStatus::Claimed));
    }

    #[test]
    fn test_concurrent_commits_only_one_wins() {
        let q = Arc::new(queue());
        q.load("m", &questions(&["q"])).unwrap();
        q.claim_next("m").unwrap().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = q.clone();
                std::thread::spawn(move || q.commit("m", "q", &format!("answer-{i}")))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
            r,
            Err(QueueError::InconsistentState { found: "answered", .. }) | Err(QueueError::LeaseUnavailable { .. })
        )));
    }

    #[test]
    fn test_concurrent_claimers_across_sqlite_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.sqlite3");
        let setup = QuestionQueue::new(Arc::new(SqliteStore::open(&path).unwrap()), Duration::from_secs(10));
        let texts: Vec<String> = (0..20).map(|i| format!("question {i}")).collect();
        let records: Vec<QuestionRecord> = texts.iter().map(|t| QuestionRecord::plain(t.as_str())).collect();
        setup.load("m", &records).unwrap();

        // Separate connections behave like separate worker processes.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let q = QuestionQueue::new(Arc::new(SqliteStore::open(&path).unwrap()), Duration::from_secs(10));
                    let mut mine = Vec::new();
                    while let Some(question) = q.claim_next("m").unwrap() {
                        q.commit("m", &question, "ok").unwrap();
                        mine.push(question);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let mut expected = texts.clone();
        expected.sort();
        assert_eq!(all, expected);
        assert_eq!(setup.stats("m").unwrap(), QueueStats { unprocessed: 0, claimed: 0, answered: 20 });
    }

    /// Forwards everything to a `MemoryStore` except lease release, which always fails.
    struct StuckReleaseStore(MemoryStore);

    impl SharedMap for StuckReleaseStore {
        fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
            self.0.set_if_absent(key, field, value)
        }

        fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key, field)
        }

        fn set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.0.set(key, field, value)
        }

        fn get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
            self.0.get_all(key)
        }

        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key)
        }

        fn try_acquire_lease(&self, name: &str, timeout: Duration) -> Result<Option<LeaseToken>, StoreError> {
            self.0.try_acquire_lease(name, timeout)
        }

        fn release_lease(&self, _lease: &LeaseToken) -> Result<bool, StoreError> {
            Err(StoreError::Io {
                path: "leases".to_string(),
                source: std::io::Error::other("disk full"),
            })
        }

        fn clear_leases(&self) -> Result<usize, StoreError> {
            self.0.clear_leases()
        }
    }

    #[test]
    fn test_claim_survives_failed_lease_release() {
        let q = QuestionQueue::new(Arc::new(StuckReleaseStore(MemoryStore::new())), Duration::from_secs(10))
            .with_lease_wait(Duration::from_millis(50));
        q.load("m", &questions(&["q"])).unwrap();

        assert_eq!(q.claim_next("m").unwrap().as_deref(), Some("q"));
        assert_eq!(q.status("m", "q").unwrap(), Some(QuestionStatus::Claimed));
        // The unreleased lease blocks the commit until it expires or is cleared.
        assert!(matches!(q.commit("m", "q", "x").unwrap_err(), QueueError::LeaseUnavailable { .. }));
        q.clear_locks().unwrap();
        q.commit("m", "q", "x").unwrap();
        assert_eq!(q.status("m", "q").unwrap(), Some(QuestionStatus::Answered("x".to_string())));
    }

    #[test]
    fn test_answered_carries_option_metadata() {
        let q = queue();
        let records = vec![
            QuestionRecord::with_options("Pizza or Sushi?", "Pizza", "Sushi"),
            QuestionRecord::plain("Free text?"),
        ];
        q.load("m", &records).unwrap();
        while let Some(question) = q.claim_next("m").unwrap() {
            q.commit("m", &question, "Sushi").unwrap();
        }

        let mut answered = q.answered("m").unwrap();
        answered.sort_by(|a, b| a.question.cmp(&b.question));
        assert_eq!(answered[0].question, "Free text?");
        assert!(answered[0].options.is_none());
        assert_eq!(
            answered[1].options,
            Some(OptionPair { option_a: "Pizza".to_string(), option_b: "Sushi".to_string() })
        );
    }
}
