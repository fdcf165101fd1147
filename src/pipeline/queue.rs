//! Durable FIFO topics with at-least-once delivery.
//!
//! Each topic is a directory; each message a JSON file written
//! atomically (tmp + rename) carrying its attempt counter and an
//! earliest-redelivery timestamp. Delivery takes an in-process lease
//! with a visibility deadline; `touch` extends it, and a lease that
//! expires (or dies with the process) makes the message deliverable
//! again. Completion is explicit and consumes the handle, so a message
//! is finished, requeued, or deferred exactly once.

use crate::error::{CourierError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    attempts: u32,
    not_before: DateTime<Utc>,
    body: serde_json::Value,
}

pub struct DirQueue {
    root: PathBuf,
    visibility: Duration,
    leases: Mutex<HashMap<String, Instant>>,
    seq: AtomicU64,
}

impl DirQueue {
    pub fn new(root: &std::path::Path, visibility: Duration) -> Result<Arc<Self>> {
        fs::create_dir_all(root)?;
        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            visibility,
            leases: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }))
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    fn message_path(&self, topic: &str, id: &str) -> PathBuf {
        self.topic_dir(topic).join(format!("{}.json", id))
    }

    fn next_id(&self) -> String {
        // Millisecond stamp keeps FIFO order across restarts; the
        // counter breaks ties within one.
        format!(
            "{:013}-{:06}",
            Utc::now().timestamp_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn write_message(&self, topic: &str, message: &StoredMessage) -> Result<()> {
        let dir = self.topic_dir(topic);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", message.id));
        fs::write(&tmp, serde_json::to_vec_pretty(message)?)?;
        fs::rename(&tmp, self.message_path(topic, &message.id))?;
        Ok(())
    }

    pub fn enqueue<B: Serialize>(&self, topic: &str, body: &B) -> Result<String> {
        self.enqueue_delayed(topic, body, Duration::ZERO)
    }

    pub fn enqueue_delayed<B: Serialize>(
        &self,
        topic: &str,
        body: &B,
        delay: Duration,
    ) -> Result<String> {
        let message = StoredMessage {
            id: self.next_id(),
            attempts: 0,
            not_before: Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| CourierError::Queue(e.to_string()))?,
            body: serde_json::to_value(body)?,
        };
        self.write_message(topic, &message)?;
        Ok(message.id)
    }

    /// Oldest deliverable message, if any. Claiming increments the
    /// persisted attempt counter and takes a visibility lease.
    pub fn dequeue(self: &Arc<Self>, topic: &str) -> Result<Option<Message>> {
        let dir = self.topic_dir(topic);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut names: Vec<String> = fs::read_dir(&dir)?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();

        let mut leases = self.leases.lock();
        let now = Instant::now();
        for name in names {
            let id = name.trim_end_matches(".json").to_string();
            let key = format!("{}/{}", topic, id);
            if leases.get(&key).is_some_and(|deadline| *deadline > now) {
                continue;
            }
            let path = self.message_path(topic, &id);
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                // Finished by another worker between listing and read.
                Err(_) => continue,
            };
            let mut stored: StoredMessage = serde_json::from_slice(&raw)?;
            if stored.not_before > Utc::now() {
                continue;
            }
            stored.attempts += 1;
            self.write_message(topic, &stored)?;
            leases.insert(key, now + self.visibility);
            return Ok(Some(Message {
                queue: Arc::clone(self),
                topic: topic.to_string(),
                id,
                attempts: stored.attempts,
                body: stored.body,
            }));
        }
        Ok(None)
    }

    /// Deliverable-or-leased message count, used by batch drains and
    /// tests.
    pub fn depth(&self, topic: &str) -> usize {
        let dir = self.topic_dir(topic);
        match fs::read_dir(&dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
                .count(),
            Err(_) => 0,
        }
    }

    fn extend_lease(&self, topic: &str, id: &str) {
        let key = format!("{}/{}", topic, id);
        self.leases
            .lock()
            .insert(key, Instant::now() + self.visibility);
    }

    fn drop_lease(&self, topic: &str, id: &str) {
        self.leases.lock().remove(&format!("{}/{}", topic, id));
    }

    fn remove(&self, topic: &str, id: &str) -> Result<()> {
        fs::remove_file(self.message_path(topic, id))?;
        self.drop_lease(topic, id);
        Ok(())
    }

    fn reschedule(&self, topic: &str, id: &str, delay: Duration, roll_back_attempt: bool) -> Result<()> {
        let raw = fs::read(self.message_path(topic, id))?;
        let mut stored: StoredMessage = serde_json::from_slice(&raw)?;
        stored.not_before = Utc::now()
            + chrono::Duration::from_std(delay).map_err(|e| CourierError::Queue(e.to_string()))?;
        if roll_back_attempt {
            stored.attempts = stored.attempts.saturating_sub(1);
        }
        self.write_message(topic, &stored)?;
        self.drop_lease(topic, id);
        Ok(())
    }
}

/// A claimed message. Dropping it without calling a completion method
/// leaves the lease to expire, after which the message is redelivered.
pub struct Message {
    queue: Arc<DirQueue>,
    topic: String,
    id: String,
    attempts: u32,
    body: serde_json::Value,
}

impl Message {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Delivery attempts including this one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn raw_body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Extends the visibility window. Call around operations that can
    /// outlast it.
    pub fn touch(&self) {
        self.queue.extend_lease(&self.topic, &self.id);
    }

    /// A cloneable handle that can only touch, for keep-alive from
    /// blocking tasks.
    pub fn touch_handle(&self) -> TouchHandle {
        TouchHandle {
            queue: Arc::clone(&self.queue),
            topic: self.topic.clone(),
            id: self.id.clone(),
        }
    }

    /// Acknowledges and deletes the message.
    pub fn finish(self) -> Result<()> {
        self.queue.remove(&self.topic, &self.id)
    }

    /// Returns the message for redelivery after `delay`. The attempt
    /// counter stands.
    pub fn requeue(self, delay: Duration) -> Result<()> {
        self.queue.reschedule(&self.topic, &self.id, delay, false)
    }

    /// Like `requeue`, but rolls the attempt counter back: the delay is
    /// a wait for resources, not a failed try.
    pub fn defer(self, delay: Duration) -> Result<()> {
        self.queue.reschedule(&self.topic, &self.id, delay, true)
    }
}

/// Keep-alive-only view of a claimed message.
#[derive(Clone)]
pub struct TouchHandle {
    queue: Arc<DirQueue>,
    topic: String,
    id: String,
}

impl TouchHandle {
    pub fn touch(&self) {
        self.queue.extend_lease(&self.topic, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility: Duration) -> (tempfile::TempDir, Arc<DirQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::new(dir.path(), visibility).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_fifo_delivery_and_finish() {
        let (_dir, queue) = queue(Duration::from_secs(60));
        queue.enqueue("work", &serde_json::json!({"n": 1})).unwrap();
        queue.enqueue("work", &serde_json::json!({"n": 2})).unwrap();
        assert_eq!(queue.depth("work"), 2);

        let first = queue.dequeue("work").unwrap().unwrap();
        let body: serde_json::Value = first.body().unwrap();
        assert_eq!(body["n"], 1);
        assert_eq!(first.attempts(), 1);
        first.finish().unwrap();

        let second = queue.dequeue("work").unwrap().unwrap();
        let body: serde_json::Value = second.body().unwrap();
        assert_eq!(body["n"], 2);
        second.finish().unwrap();

        assert!(queue.dequeue("work").unwrap().is_none());
        assert_eq!(queue.depth("work"), 0);
    }

    #[test]
    fn test_leased_message_not_redelivered() {
        let (_dir, queue) = queue(Duration::from_secs(60));
        queue.enqueue("work", &serde_json::json!({})).unwrap();
        let held = queue.dequeue("work").unwrap().unwrap();
        assert!(queue.dequeue("work").unwrap().is_none());
        held.finish().unwrap();
    }

    #[test]
    fn test_expired_lease_redelivers_with_higher_attempts() {
        let (_dir, queue) = queue(Duration::from_millis(5));
        queue.enqueue("work", &serde_json::json!({})).unwrap();
        let first = queue.dequeue("work").unwrap().unwrap();
        assert_eq!(first.attempts(), 1);
        std::thread::sleep(Duration::from_millis(20));
        // Lease expired without completion; the message comes back.
        let second = queue.dequeue("work").unwrap().unwrap();
        assert_eq!(second.attempts(), 2);
        second.finish().unwrap();
        drop(first);
    }

    #[test]
    fn test_touch_keeps_lease_alive() {
        let (_dir, queue) = queue(Duration::from_millis(40));
        queue.enqueue("work", &serde_json::json!({})).unwrap();
        let held = queue.dequeue("work").unwrap().unwrap();
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(15));
            held.touch();
            assert!(queue.dequeue("work").unwrap().is_none());
        }
        held.finish().unwrap();
    }

    #[test]
    fn test_requeue_delays_and_keeps_attempts() {
        let (_dir, queue) = queue(Duration::from_secs(60));
        queue.enqueue("work", &serde_json::json!({})).unwrap();
        let msg = queue.dequeue("work").unwrap().unwrap();
        msg.requeue(Duration::from_millis(30)).unwrap();

        // Not yet deliverable.
        assert!(queue.dequeue("work").unwrap().is_none());
        std::thread::sleep(Duration::from_millis(50));
        let again = queue.dequeue("work").unwrap().unwrap();
        assert_eq!(again.attempts(), 2);
        again.finish().unwrap();
    }

    #[test]
    fn test_defer_rolls_attempt_back() {
        let (_dir, queue) = queue(Duration::from_secs(60));
        queue.enqueue("work", &serde_json::json!({})).unwrap();
        let msg = queue.dequeue("work").unwrap().unwrap();
        msg.defer(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let again = queue.dequeue("work").unwrap().unwrap();
        // Waiting on resources does not count as a failed try.
        assert_eq!(again.attempts(), 1);
        again.finish().unwrap();
    }

    #[test]
    fn test_enqueue_delayed() {
        let (_dir, queue) = queue(Duration::from_secs(60));
        queue
            .enqueue_delayed("work", &serde_json::json!({}), Duration::from_millis(40))
            .unwrap();
        assert!(queue.dequeue("work").unwrap().is_none());
        std::thread::sleep(Duration::from_millis(60));
        assert!(queue.dequeue("work").unwrap().is_some());
    }

    #[test]
    fn test_messages_survive_queue_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
            queue.enqueue("work", &serde_json::json!({"n": 7})).unwrap();
        }
        let reopened = DirQueue::new(dir.path(), Duration::from_secs(60)).unwrap();
        let msg = reopened.dequeue("work").unwrap().unwrap();
        let body: serde_json::Value = msg.body().unwrap();
        assert_eq!(body["n"], 7);
        msg.finish().unwrap();
    }
}
