/// Responder loops: claim, ask, commit, pace. One sequential loop per responder,
/// all responders running concurrently.
///
/// Queue calls block (SQLite, lease polling) and run on the blocking pool. No
/// lease is held while a responder call is in flight: the claim and the commit
/// each take the question's lease only for their own short state transition.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{ResponderError, TextResponder};
use crate::queue::{QueueError, QuestionQueue};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("responder {responder}: {source}")]
    Queue {
        responder: String,
        #[source]
        source: QueueError,
    },
    #[error("responder {responder}: worker task failed: {source}")]
    Join {
        responder: String,
        #[source]
        source: JoinError,
    },
    #[error("recovery failed: {0}")]
    Recovery(#[source] QueueError),
    #[error("recovery task failed: {0}")]
    RecoveryJoin(#[source] JoinError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSummary {
    pub responder: String,
    pub answered: usize,
    /// Questions left `Claimed` because the responder kept failing.
    pub failed: usize,
    /// Stopped by cancellation rather than by an empty queue.
    pub cancelled: bool,
}

pub struct ResponderDriver {
    queue: Arc<QuestionQueue>,
    responder: Arc<dyn TextResponder>,
    max_retries: usize,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl ResponderDriver {
    pub fn new(
        queue: Arc<QuestionQueue>,
        responder: Arc<dyn TextResponder>,
        max_retries: usize,
        cancel: CancellationToken,
    ) -> Self {
        ResponderDriver {
            queue,
            responder,
            max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run a blocking queue operation on the blocking pool.
    async fn with_queue<T, F>(&self, op: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&QuestionQueue, &str) -> Result<T, QueueError> + Send + 'static,
    {
        let queue = self.queue.clone();
        let responder = self.responder.name().to_string();
        let name = responder.clone();
        tokio::task::spawn_blocking(move || op(&queue, &name))
            .await
            .map_err(|source| DriverError::Join {
                responder: responder.clone(),
                source,
            })?
            .map_err(|source| DriverError::Queue { responder, source })
    }

    /// Ask once, then retry up to `max_retries` times with `retry_delay` between attempts.
    async fn ask_with_retries(&self, question: &str) -> Result<String, ResponderError> {
        let mut attempt = 0;
        loop {
            match self.responder.answer(question).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(responder = self.responder.name(), attempt, error = %e, "responder call failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive this responder until its queue is empty or the run is cancelled.
    ///
    /// Failed calls leave the question `Claimed` for a later `reset_claimed`.
    /// A protocol violation on commit stops the loop with an error.
    pub async fn run(self) -> Result<DriverSummary, DriverError> {
        let name = self.responder.name().to_string();
        let pacing = self.responder.pacing_interval();
        let mut summary = DriverSummary {
            responder: name.clone(),
            ..DriverSummary::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let Some(question) = self.with_queue(|q, r| q.claim_next(r)).await? else {
                debug!(responder = %name, "queue drained");
                break;
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(responder = %name, question = %question, "cancelled during call; question stays claimed");
                    summary.cancelled = true;
                    break;
                }
                result = self.ask_with_retries(&question) => result,
            };

            match result {
                Ok(answer) => {
                    let q = question.clone();
                    match self.with_queue(move |queue, r| queue.commit(r, &q, &answer)).await {
                        Ok(()) => {
                            summary.answered += 1;
                            info!(responder = %name, question = %question, "answered");
                        }
                        Err(DriverError::Queue { source: QueueError::LeaseUnavailable { .. }, .. }) => {
                            warn!(responder = %name, question = %question, "lease busy at commit; question stays claimed");
                            summary.failed += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!(responder = %name, question = %question, error = %e, "giving up on question for this run");
                    summary.failed += 1;
                }
            }

            if !pacing.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(pacing) => {}
                }
            }
        }

        Ok(summary)
    }
}

/// Runs one `ResponderDriver` per responder over a shared queue.
pub struct Orchestrator {
    queue: Arc<QuestionQueue>,
    max_retries: usize,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(queue: Arc<QuestionQueue>, max_retries: usize) -> Self {
        Orchestrator {
            queue,
            max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Cancelling this token stops every responder loop at its next await point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crash recovery: drop every lease, then return every `Claimed` question
    /// to the queue. Only safe when no other worker is using the store, so
    /// callers opt in; it never runs implicitly.
    pub async fn recover(&self, responders: Vec<String>) -> Result<usize, DriverError> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            queue.clear_locks()?;
            let mut reset = 0;
            for responder in &responders {
                reset += queue.reset_claimed(responder)?;
            }
            Ok::<_, QueueError>(reset)
        })
        .await
        .map_err(DriverError::RecoveryJoin)?
        .map_err(DriverError::Recovery)
    }

    /// Run every responder to completion. Results come back in input order.
    pub async fn run(&self, responders: Vec<Arc<dyn TextResponder>>) -> Vec<Result<DriverSummary, DriverError>> {
        let mut handles = Vec::with_capacity(responders.len());
        for responder in responders {
            let name = responder.name().to_string();
            let driver = ResponderDriver::new(
                self.queue.clone(),
                responder,
                self.max_retries,
                self.cancel.child_token(),
            )
            .with_retry_delay(self.retry_delay);
            handles.push((name, tokio::spawn(driver.run())));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (responder, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(source) => Err(DriverError::Join { responder, source }),
            };
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QuestionStatus, QueueStats};
    use crate::records::QuestionRecord;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    enum Behavior {
        Echo,
        /// Fail this many calls, then echo.
        FailFirst(usize),
        AlwaysFail,
        Hang,
    }

    struct FakeResponder {
        name: String,
        pacing: Duration,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeResponder {
        fn new(name: &str, behavior: Behavior) -> Self {
            FakeResponder {
                name: name.to_string(),
                pacing: Duration::ZERO,
                behavior,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextResponder for FakeResponder {
        fn name(&self) -> &str {
            &self.name
        }

        fn pacing_interval(&self) -> Duration {
            self.pacing
        }

        async fn answer(&self, question: &str) -> Result<String, ResponderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo => Ok(format!("answer to {question}")),
                Behavior::FailFirst(n) if call < n => Err(ResponderError::EmptyResponse),
                Behavior::FailFirst(_) => Ok(format!("answer to {question}")),
                Behavior::AlwaysFail => Err(ResponderError::Api { status: 503, body: "overloaded".to_string() }),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    /// Answers the question itself behind the driver's back, like a rogue second worker.
    struct RogueResponder {
        queue: Arc<QuestionQueue>,
    }

    #[async_trait]
    impl TextResponder for RogueResponder {
        fn name(&self) -> &str {
            "rogue"
        }

        fn pacing_interval(&self) -> Duration {
            Duration::ZERO
        }

        async fn answer(&self, question: &str) -> Result<String, ResponderError> {
            self.queue.commit("rogue", question, "sneaky").unwrap();
            Ok("honest".to_string())
        }
    }

    fn loaded_queue(responders: &[&str], questions: &[&str]) -> Arc<QuestionQueue> {
        let queue = QuestionQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(10))
            .with_lease_wait(Duration::from_millis(50));
        let records: Vec<QuestionRecord> = questions.iter().map(|q| QuestionRecord::plain(*q)).collect();
        for responder in responders {
            queue.load(responder, &records).unwrap();
        }
        Arc::new(queue)
    }

    fn driver(queue: &Arc<QuestionQueue>, responder: Arc<dyn TextResponder>, max_retries: usize) -> ResponderDriver {
        ResponderDriver::new(queue.clone(), responder, max_retries, CancellationToken::new())
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_driver_drains_queue() {
        let queue = loaded_queue(&["m"], &["q1", "q2", "q3", "q4", "q5"]);
        let summary = driver(&queue, Arc::new(FakeResponder::new("m", Behavior::Echo)), 0)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.answered, 5);
        assert_eq!(summary.failed, 0);
        assert!(!summary.cancelled);
        assert_eq!(queue.stats("m").unwrap(), QueueStats { unprocessed: 0, claimed: 0, answered: 5 });
        assert_eq!(
            queue.status("m", "q3").unwrap(),
            Some(QuestionStatus::Answered("answer to q3".to_string()))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let queue = loaded_queue(&["m"], &["q"]);
        let responder = Arc::new(FakeResponder::new("m", Behavior::FailFirst(2)));
        let summary = driver(&queue, responder.clone(), 3).run().await.unwrap();

        assert_eq!(summary.answered, 1);
        assert_eq!(responder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_leaves_question_claimed() {
        let queue = loaded_queue(&["m"], &["q1", "q2"]);
        let responder = Arc::new(FakeResponder::new("m", Behavior::AlwaysFail));
        let summary = driver(&queue, responder.clone(), 2).run().await.unwrap();

        assert_eq!(summary.answered, 0);
        assert_eq!(summary.failed, 2);
        // One call plus two retries per question.
        assert_eq!(responder.calls.load(Ordering::SeqCst), 6);
        assert_eq!(queue.stats("m").unwrap(), QueueStats { unprocessed: 0, claimed: 2, answered: 0 });

        assert_eq!(queue.reset_claimed("m").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_call_leaves_question_claimed() {
        let queue = loaded_queue(&["m"], &["q"]);
        let cancel = CancellationToken::new();
        let driver = ResponderDriver::new(
            queue.clone(),
            Arc::new(FakeResponder::new("m", Behavior::Hang)),
            0,
            cancel.clone(),
        );
        let handle = tokio::spawn(driver.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.answered, 0);
        assert_eq!(queue.status("m", "q").unwrap(), Some(QuestionStatus::Claimed));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_claims_nothing() {
        let queue = loaded_queue(&["m"], &["q"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = ResponderDriver::new(queue.clone(), Arc::new(FakeResponder::new("m", Behavior::Echo)), 0, cancel)
            .run()
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(queue.status("m", "q").unwrap(), Some(QuestionStatus::Unprocessed));
    }

    #[tokio::test]
    async fn test_pacing_spaces_out_calls() {
        let queue = loaded_queue(&["m"], &["q1", "q2", "q3"]);
        let mut responder = FakeResponder::new("m", Behavior::Echo);
        responder.pacing = Duration::from_millis(30);

        let started = Instant::now();
        let summary = driver(&queue, Arc::new(responder), 0).run().await.unwrap();
        assert_eq!(summary.answered, 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_commit_conflict_stops_driver() {
        let queue = loaded_queue(&["rogue"], &["q"]);
        let rogue = Arc::new(RogueResponder { queue: queue.clone() });
        let err = driver(&queue, rogue, 0).run().await.unwrap_err();

        assert!(matches!(
            err,
            DriverError::Queue { source: QueueError::InconsistentState { found: "answered", .. }, .. }
        ));
        // The first committed answer is kept.
        assert_eq!(
            queue.status("rogue", "q").unwrap(),
            Some(QuestionStatus::Answered("sneaky".to_string()))
        );
    }

    #[tokio::test]
    async fn test_orchestrator_runs_responders_independently() {
        let queue = loaded_queue(&["good", "bad"], &["q1", "q2", "q3"]);
        let orchestrator = Orchestrator::new(queue.clone(), 1).with_retry_delay(Duration::from_millis(1));

        let results = orchestrator
            .run(vec![
                Arc::new(FakeResponder::new("good", Behavior::Echo)),
                Arc::new(FakeResponder::new("bad", Behavior::AlwaysFail)),
            ])
            .await;

        let summaries: Vec<DriverSummary> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(summaries[0].responder, "good");
        assert_eq!(summaries[0].answered, 3);
        assert_eq!(summaries[1].responder, "bad");
        assert_eq!(summaries[1].failed, 3);
        assert_eq!(queue.stats("good").unwrap().answered, 3);
        assert_eq!(queue.stats("bad").unwrap().claimed, 3);
    }

    #[tokio::test]
    async fn test_recover_returns_claimed_questions() {
        let queue = loaded_queue(&["m"], &["q1", "q2"]);
        queue.claim_next("m").unwrap().unwrap();
        let orchestrator = Orchestrator::new(queue.clone(), 0);

        assert_eq!(orchestrator.recover(vec!["m".to_string()]).await.unwrap(), 1);
        let results = orchestrator.run(vec![Arc::new(FakeResponder::new("m", Behavior::Echo))]).await;
        assert_eq!(results[0].as_ref().unwrap().answered, 2);
    }

    fn sqlite_queue(path: &std::path::Path) -> Arc<QuestionQueue> {
        let store = crate::sqlite_store::SqliteStore::open(path).unwrap();
        Arc::new(QuestionQueue::new(Arc::new(store), Duration::from_secs(10)).with_lease_wait(Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn test_second_worker_leaves_in_flight_claims_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.sqlite3");

        // Two connections on one file stand in for two worker processes.
        let worker_a = sqlite_queue(&path);
        worker_a.load("m", &[QuestionRecord::plain("q")]).unwrap();
        assert_eq!(worker_a.claim_next("m").unwrap().as_deref(), Some("q"));
        worker_a.load("m", &[QuestionRecord::plain("other")]).unwrap();

        let worker_b = sqlite_queue(&path);
        let results = Orchestrator::new(worker_b.clone(), 0)
            .run(vec![Arc::new(FakeResponder::new("m", Behavior::Echo))])
            .await;
        assert_eq!(results[0].as_ref().unwrap().answered, 1);
        assert_eq!(worker_b.status("m", "q").unwrap(), Some(QuestionStatus::Claimed));

        // Worker A's answer still lands.
        worker_a.commit("m", "q", "from a").unwrap();
        assert_eq!(
            worker_b.status("m", "q").unwrap(),
            Some(QuestionStatus::Answered("from a".to_string()))
        );
    }
}
