//! Stage worker framework.
//!
//! A stage owns one topic. The runner feeds claimed messages through a
//! bounded channel to a pool of workers; each worker decodes the
//! envelope, touches the message, runs the stage, then routes: advance
//! to the next topic, retry transient failures while attempts remain,
//! or serialize to the trouble topic. Post-processing here is the only
//! place retry-vs-trouble is decided.

use super::envelope::{ResultEnvelope, StageTag};
use super::queue::{DirQueue, Message};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

/// What a stage decided about one envelope.
#[derive(Debug)]
pub enum StageOutcome {
    /// Enqueue the envelope on the named topic and acknowledge.
    Advance(&'static str),
    /// Pipeline finished for this envelope.
    Done,
    /// Work was already completed or cancelled elsewhere; acknowledge
    /// without forwarding.
    Skip(String),
    /// Terminal but expected failure (e.g. the origin rejected our
    /// receipt): acknowledge without retry and without trouble-sinking.
    Abandon(String),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// The envelope is exclusively owned by this call for its duration.
    /// Errors are routed by the runner: transient ones retry, the rest
    /// trouble-sink.
    async fn process(
        &self,
        envelope: &mut ResultEnvelope,
        message: &Message,
    ) -> Result<StageOutcome>;
}

pub struct StageRunner {
    queue: Arc<DirQueue>,
    stage: Arc<dyn Stage>,
    topic: String,
    trouble_topic: String,
    workers: usize,
    max_attempts: u32,
    retry_delay: Duration,
    /// Long wait used when staging space is exhausted.
    disk_wait_delay: Duration,
    poll_interval: Duration,
}

impl StageRunner {
    pub fn new(
        queue: Arc<DirQueue>,
        stage: Arc<dyn Stage>,
        topic: &str,
        trouble_topic: &str,
        workers: usize,
        max_attempts: u32,
        retry_delay: Duration,
        disk_wait_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            stage,
            topic: topic.to_string(),
            trouble_topic: trouble_topic.to_string(),
            workers: workers.max(1),
            max_attempts,
            retry_delay,
            disk_wait_delay,
            poll_interval: Duration::from_millis(500),
        })
    }

    /// Runs reader and worker tasks until `shutdown` flips to true and
    /// the in-flight channel drains.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel::<Message>(self.workers * 4);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.workers + 1);

        let reader = Arc::clone(&self);
        let mut reader_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if *reader_shutdown.borrow() {
                    break;
                }
                match reader.queue.dequeue(&reader.topic) {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(reader.poll_interval) => {}
                            _ = reader_shutdown.changed() => {}
                        }
                    }
                    Err(e) => {
                        error!(topic = %reader.topic, "queue read failed: {}", e);
                        tokio::time::sleep(reader.poll_interval).await;
                    }
                }
            }
        }));

        for _ in 0..self.workers {
            let runner = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let message = { rx.lock().await.recv().await };
                    match message {
                        Some(message) => runner.handle(message).await,
                        None => break,
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drains the topic sequentially until no message is deliverable.
    /// Returns how many were handled. Batch entry points and tests use
    /// this instead of `run`.
    pub async fn run_until_idle(self: &Arc<Self>) -> Result<usize> {
        let mut handled = 0;
        while let Some(message) = self.queue.dequeue(&self.topic)? {
            self.handle(message).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle(&self, message: Message) {
        let mut envelope: ResultEnvelope = match message.body() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    stage = self.stage.name(),
                    "undecodable message {}: {}",
                    message.id(),
                    e
                );
                // The trouble topic must not feed itself.
                if self.topic != self.trouble_topic {
                    let _ = self.queue.enqueue(&self.trouble_topic, message.raw_body());
                }
                if let Err(e) = message.finish() {
                    error!("cannot finish undecodable message: {}", e);
                }
                return;
            }
        };
        message.touch();

        match self.stage.process(&mut envelope, &message).await {
            Ok(StageOutcome::Advance(next)) => {
                if let Err(e) = self.queue.enqueue(next, &envelope) {
                    error!(
                        stage = self.stage.name(),
                        uuid = %envelope.uuid,
                        "cannot enqueue on {}: {}",
                        next,
                        e
                    );
                    let _ = message.requeue(self.retry_delay);
                    return;
                }
                if let Err(e) = message.finish() {
                    error!("cannot finish message: {}", e);
                }
            }
            Ok(StageOutcome::Done) => {
                if let Err(e) = message.finish() {
                    error!("cannot finish message: {}", e);
                }
            }
            Ok(StageOutcome::Skip(note)) => {
                info!(stage = self.stage.name(), uuid = %envelope.uuid, "{}", note);
                if let Err(e) = message.finish() {
                    error!("cannot finish message: {}", e);
                }
            }
            Ok(StageOutcome::Abandon(reason)) => {
                warn!(
                    stage = self.stage.name(),
                    uuid = %envelope.uuid,
                    "abandoned: {}",
                    reason
                );
                if let Err(e) = message.finish() {
                    error!("cannot finish message: {}", e);
                }
            }
            Err(e) => self.post_process_error(envelope, message, e).await,
        }
    }

    async fn post_process_error(
        &self,
        mut envelope: ResultEnvelope,
        message: Message,
        error: CourierError,
    ) {
        if let CourierError::DiskExhausted { needed, available } = &error {
            warn!(
                stage = self.stage.name(),
                uuid = %envelope.uuid,
                "staging full ({} needed, {} free), deferring",
                needed,
                available
            );
            if let Err(e) = message.defer(self.disk_wait_delay) {
                error!("cannot defer message: {}", e);
            }
            return;
        }

        envelope.fail(error.to_string());
        if error.is_transient() && message.attempts() < self.max_attempts {
            warn!(
                stage = self.stage.name(),
                uuid = %envelope.uuid,
                attempt = message.attempts(),
                "retrying: {}",
                error
            );
            if let Err(e) = message.requeue(self.retry_delay) {
                error!("cannot requeue message: {}", e);
            }
        } else {
            error!(
                stage = self.stage.name(),
                uuid = %envelope.uuid,
                "terminal failure after {} attempts: {}",
                message.attempts(),
                error
            );
            envelope.stage = StageTag::Trouble;
            if let Err(e) = self.queue.enqueue(&self.trouble_topic, &envelope) {
                error!("cannot enqueue trouble envelope: {}", e);
            }
            if let Err(e) = message.finish() {
                error!("cannot finish message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{TOPIC_STORE, TOPIC_TROUBLE, TOPIC_VALIDATE};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct AdvanceStage;

    #[async_trait]
    impl Stage for AdvanceStage {
        fn name(&self) -> &'static str {
            "advance"
        }

        async fn process(
            &self,
            envelope: &mut ResultEnvelope,
            _message: &Message,
        ) -> Result<StageOutcome> {
            envelope.size = Some(686);
            Ok(StageOutcome::Advance(TOPIC_STORE))
        }
    }

    struct FlakyStage {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Stage for FlakyStage {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn process(
            &self,
            _envelope: &mut ResultEnvelope,
            _message: &Message,
        ) -> Result<StageOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(StageOutcome::Done)
            } else {
                Err(CourierError::Transport("connection refused".into()))
            }
        }
    }

    struct DoomedStage;

    #[async_trait]
    impl Stage for DoomedStage {
        fn name(&self) -> &'static str {
            "doomed"
        }

        async fn process(
            &self,
            _envelope: &mut ResultEnvelope,
            _message: &Message,
        ) -> Result<StageOutcome> {
            Err(CourierError::Validation("bad bag".into()))
        }
    }

    fn envelope() -> ResultEnvelope {
        ResultEnvelope::for_local(Uuid::new_v4(), "item-1")
    }

    fn runner(queue: &Arc<DirQueue>, stage: Arc<dyn Stage>) -> Arc<StageRunner> {
        StageRunner::new(
            Arc::clone(queue),
            stage,
            TOPIC_VALIDATE,
            TOPIC_TROUBLE,
            2,
            3,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_success_advances_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        queue.enqueue(TOPIC_VALIDATE, &envelope()).unwrap();

        let runner = runner(&queue, Arc::new(AdvanceStage));
        assert_eq!(runner.run_until_idle().await.unwrap(), 1);

        assert_eq!(queue.depth(TOPIC_VALIDATE), 0);
        assert_eq!(queue.depth(TOPIC_STORE), 1);
        let forwarded = queue.dequeue(TOPIC_STORE).unwrap().unwrap();
        let envelope: ResultEnvelope = forwarded.body().unwrap();
        assert_eq!(envelope.size, Some(686));
        forwarded.finish().unwrap();
    }

    #[tokio::test]
    async fn test_transient_error_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        queue.enqueue(TOPIC_VALIDATE, &envelope()).unwrap();

        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        });
        let runner = runner(&queue, stage.clone());
        // Each drain pass handles the message once; the short retry
        // delay makes it deliverable again almost immediately.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            runner.run_until_idle().await.unwrap();
        }
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.depth(TOPIC_VALIDATE), 0);
        assert_eq!(queue.depth(TOPIC_TROUBLE), 0);
    }

    #[tokio::test]
    async fn test_nontransient_error_goes_to_trouble() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        queue.enqueue(TOPIC_VALIDATE, &envelope()).unwrap();

        let runner = runner(&queue, Arc::new(DoomedStage));
        assert_eq!(runner.run_until_idle().await.unwrap(), 1);

        assert_eq!(queue.depth(TOPIC_VALIDATE), 0);
        assert_eq!(queue.depth(TOPIC_TROUBLE), 1);
        let troubled = queue.dequeue(TOPIC_TROUBLE).unwrap().unwrap();
        let envelope: ResultEnvelope = troubled.body().unwrap();
        assert_eq!(envelope.stage, StageTag::Trouble);
        assert!(envelope.error_message.contains("bad bag"));
        troubled.finish().unwrap();
    }

    #[tokio::test]
    async fn test_transient_error_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        queue.enqueue(TOPIC_VALIDATE, &envelope()).unwrap();

        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let runner = runner(&queue, stage);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            runner.run_until_idle().await.unwrap();
        }
        // Third attempt hits max_attempts and trouble-sinks.
        assert_eq!(queue.depth(TOPIC_VALIDATE), 0);
        assert_eq!(queue.depth(TOPIC_TROUBLE), 1);
    }

    #[tokio::test]
    async fn test_run_drains_then_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        for _ in 0..5 {
            queue.enqueue(TOPIC_VALIDATE, &envelope()).unwrap();
        }

        let runner = runner(&queue, Arc::new(AdvanceStage));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&runner).run(shutdown_rx));

        for _ in 0..50 {
            if queue.depth(TOPIC_STORE) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.depth(TOPIC_STORE), 5);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
