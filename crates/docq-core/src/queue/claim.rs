//! Claim engine behind [`Queue::get`].

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Queue, document};
use crate::domain::{Message, Payload, QueueError};
use crate::ports::{Direction, Document, FindOneAndUpdateOptions, KeyPattern, ReturnDocument, Update};
use crate::query::{self, fields};

pub const DEFAULT_WAIT: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL: Duration = Duration::from_millis(200);
pub const DEFAULT_RUNNING_RESET: Duration = Duration::from_secs(30);

/// Parameters of a single `get` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// How long a claimed message stays hidden from other consumers.
    pub running_reset: Duration,
    /// Total time to keep trying before returning an empty batch.
    pub wait: Duration,
    /// Sleep between attempts that found nothing.
    pub poll: Duration,
    /// Maximum messages per batch. Must be at least 1.
    pub limit: usize,
}

impl GetOptions {
    pub fn new(running_reset: Duration) -> Self {
        Self {
            running_reset,
            wait: DEFAULT_WAIT,
            poll: DEFAULT_POLL,
            limit: 1,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl Default for GetOptions {
    fn default() -> Self {
        Self::new(DEFAULT_RUNNING_RESET)
    }
}

/// Claim order: lowest priority value first, then oldest.
fn claim_sort() -> KeyPattern {
    KeyPattern::new()
        .with(fields::PRIORITY, Direction::Ascending)
        .with(fields::CREATED, Direction::Ascending)
}

impl Queue {
    /// Claim up to `options.limit` visible messages matching `filter`.
    ///
    /// Each claim is a single atomic find-and-update that pushes the message's
    /// `earliestGet` to `now + running_reset`, so no two consumers ever hold
    /// the same message inside that window. Returns as soon as at least one
    /// message is held and the store has nothing more to give, or once `wait`
    /// has elapsed (possibly overrunning it by one `poll`).
    pub async fn get(&self, filter: &Payload, options: GetOptions) -> Result<Vec<Message>, QueueError> {
        self.claim_batch(filter, options, None).await
    }

    /// [`Queue::get`] that gives up early once `shutdown` flips to true.
    ///
    /// The signal is only observed while waiting between polls, never during
    /// a claim, so every message the store hands over is returned.
    pub async fn get_until_shutdown(
        &self,
        filter: &Payload,
        options: GetOptions,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<Message>, QueueError> {
        self.claim_batch(filter, options, Some(shutdown)).await
    }

    async fn claim_batch(
        &self,
        filter: &Payload,
        options: GetOptions,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Vec<Message>, QueueError> {
        if options.limit == 0 {
            return Err(QueueError::InvalidLimit);
        }

        let base = query::payload_filter(filter)?;
        let claim_options = FindOneAndUpdateOptions {
            sort: claim_sort(),
            upsert: false,
            return_document: ReturnDocument::After,
        };
        // None: the wait is too long to represent, so never time out.
        let deadline = Instant::now().checked_add(options.wait);

        let mut messages = Vec::with_capacity(options.limit.min(64));
        loop {
            let now = self.now();

            let mut claim_filter = base.clone();
            claim_filter.insert(fields::EARLIEST_GET.to_string(), query::visible_at(now));

            let mut set = Document::new();
            set.insert(
                fields::EARLIEST_GET.to_string(),
                Value::from(now.saturating_add(options.running_reset).as_millis()),
            );

            let claimed = self
                .collection
                .find_one_and_update(&claim_filter, &Update::set(set), &claim_options)
                .await?;

            if let Some(doc) = claimed {
                let message = document::message_from_document(doc)?;
                debug!(
                    id = %message.id(),
                    priority = %message.priority(),
                    hidden_until = %message.earliest_get(),
                    "claimed message"
                );
                messages.push(message);
                if messages.len() >= options.limit {
                    return Ok(messages);
                }
                continue;
            }

            let timed_out = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if !messages.is_empty() || timed_out {
                return Ok(messages);
            }

            trace!(poll = ?options.poll, "nothing visible, polling");
            match shutdown.as_deref_mut() {
                Some(rx) => {
                    if *rx.borrow() {
                        return Ok(messages);
                    }
                    tokio::select! {
                        _ = pause(options.poll) => {}
                        // A dropped sender counts as shutdown too.
                        _ = rx.changed() => return Ok(messages),
                    }
                }
                None => pause(options.poll).await,
            }
        }
    }
}

async fn pause(poll: Duration) {
    if poll.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::domain::Timestamp;
    use crate::impls::MemoryCollection;
    use crate::ports::{Clock, FixedClock};

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn fixed_queue() -> (Queue, Arc<FixedClock>, Arc<MemoryCollection>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let coll = Arc::new(MemoryCollection::new());
        let queue = Queue::with_clock(coll.clone(), clock.clone());
        (queue, clock, coll)
    }

    fn no_wait() -> GetOptions {
        GetOptions::default().wait(Duration::ZERO).poll(Duration::ZERO)
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let (queue, _, _) = fixed_queue();
        let err = queue.get(&Payload::new(), no_wait().limit(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidLimit));
    }

    #[tokio::test]
    async fn invalid_filter_is_rejected_before_touching_the_store() {
        let (queue, _, _) = fixed_queue();
        let err = queue
            .get(&payload(json!({"$or": []})), no_wait())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidFilterKey(_)));
    }

    #[tokio::test]
    async fn empty_queue_with_zero_wait_returns_empty() {
        let (queue, _, _) = fixed_queue();
        assert!(queue.get(&Payload::new(), no_wait()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_roughly_the_configured_time() {
        let (queue, _, _) = fixed_queue();
        let options = GetOptions::default()
            .wait(Duration::from_millis(500))
            .poll(Duration::from_millis(100));

        let started = Instant::now();
        let batch = queue.get(&Payload::new(), options).await.unwrap();
        let elapsed = started.elapsed();

        assert!(batch.is_empty());
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed <= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn message_arriving_mid_wait_is_picked_up_on_a_later_poll() {
        let (queue, clock, _) = fixed_queue();
        let due = Timestamp::from_datetime(clock.now()).saturating_add(Duration::from_millis(250));
        queue.send(Payload::new(), due, 0.0).await.unwrap();

        let ticker = Arc::clone(&clock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            ticker.advance(Duration::from_millis(250));
        });

        let options = GetOptions::default()
            .wait(Duration::from_secs(1))
            .poll(Duration::from_millis(100));
        let started = Instant::now();
        let batch = queue.get(&Payload::new(), options).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(batch.len(), 1);
        assert!(elapsed >= options.poll, "returned before polling: {elapsed:?}");
        assert!(elapsed < options.wait, "waited the whole window: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_an_idle_wait_early() {
        let (queue, _, _) = fixed_queue();
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(true);
        });

        let options = GetOptions::default()
            .wait(Duration::from_secs(60))
            .poll(Duration::from_millis(100));
        let started = Instant::now();
        let batch = queue
            .get_until_shutdown(&Payload::new(), options, &mut rx)
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn raised_shutdown_still_returns_visible_messages() {
        let (queue, _, _) = fixed_queue();
        queue.send(Payload::new(), Timestamp::ZERO, 0.0).await.unwrap();
        let (_tx, mut rx) = watch::channel(true);

        let batch = queue
            .get_until_shutdown(&Payload::new(), no_wait(), &mut rx)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn lowest_priority_value_first() {
        let (queue, _, _) = fixed_queue();
        for p in [0.4, 0.5, 0.3] {
            queue
                .send(payload(json!({"p": p})), Timestamp::ZERO, p)
                .await
                .unwrap();
        }

        let batch = queue.get(&Payload::new(), no_wait().limit(10)).await.unwrap();
        let order: Vec<f64> = batch.iter().map(|m| m.priority().value()).collect();
        assert_eq!(order, vec![0.3, 0.4, 0.5]);
    }

    #[tokio::test]
    async fn equal_priority_drains_in_send_order() {
        let (queue, clock, _) = fixed_queue();
        for name in ["A", "B", "C"] {
            queue
                .send(payload(json!({"name": name})), Timestamp::ZERO, 0.0)
                .await
                .unwrap();
            clock.advance(Duration::from_millis(1));
        }

        let mut names = Vec::new();
        for _ in 0..3 {
            let batch = queue.get(&Payload::new(), no_wait()).await.unwrap();
            assert_eq!(batch.len(), 1);
            names.push(batch[0].payload()["name"].clone());
            queue.ack(&batch[0]).await.unwrap();
        }
        assert_eq!(names, vec![json!("A"), json!("B"), json!("C")]);
    }

    #[tokio::test]
    async fn future_messages_are_invisible_until_due() {
        let (queue, clock, _) = fixed_queue();
        let due = Timestamp::from_datetime(clock.now()).saturating_add(Duration::from_secs(60));
        queue.send(Payload::new(), due, 0.0).await.unwrap();

        assert!(queue.get(&Payload::new(), no_wait()).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.get(&Payload::new(), no_wait()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_message_reappears_after_running_reset() {
        let (queue, clock, _) = fixed_queue();
        queue.send(Payload::new(), Timestamp::ZERO, 0.0).await.unwrap();
        let options = no_wait();

        let first = queue.get(&Payload::new(), options).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.get(&Payload::new(), options).await.unwrap().is_empty());

        clock.advance(options.running_reset - Duration::from_millis(1));
        assert!(queue.get(&Payload::new(), options).await.unwrap().is_empty());

        clock.advance(Duration::from_millis(1));
        let again = queue.get(&Payload::new(), options).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id(), first[0].id());
    }

    #[tokio::test]
    async fn claim_records_new_visibility_on_the_message() {
        let (queue, clock, _) = fixed_queue();
        queue.send(Payload::new(), Timestamp::ZERO, 0.0).await.unwrap();
        let now = Timestamp::from_datetime(clock.now());

        let batch = queue.get(&Payload::new(), no_wait()).await.unwrap();
        assert_eq!(
            batch[0].earliest_get(),
            now.saturating_add(DEFAULT_RUNNING_RESET)
        );
    }

    #[tokio::test]
    async fn huge_running_reset_saturates() {
        let (queue, _, coll) = fixed_queue();
        queue.send(Payload::new(), Timestamp::ZERO, 0.0).await.unwrap();

        let options = GetOptions::new(Duration::MAX).wait(Duration::ZERO);
        let batch = queue.get(&Payload::new(), options).await.unwrap();
        assert_eq!(batch[0].earliest_get(), Timestamp::MAX);
        assert_eq!(coll.documents().await[0]["earliestGet"], json!(i64::MAX));
    }

    #[tokio::test]
    async fn batch_stops_at_limit() {
        let (queue, _, _) = fixed_queue();
        for _ in 0..5 {
            queue.send(Payload::new(), Timestamp::ZERO, 0.0).await.unwrap();
        }

        assert_eq!(queue.get(&Payload::new(), no_wait().limit(3)).await.unwrap().len(), 3);
        assert_eq!(queue.get(&Payload::new(), no_wait().limit(3)).await.unwrap().len(), 2);
        assert!(queue.get(&Payload::new(), no_wait().limit(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filter_selects_by_payload() {
        let (queue, _, _) = fixed_queue();
        queue.send(payload(json!({"type": "sms"})), Timestamp::ZERO, 0.0).await.unwrap();
        queue.send(payload(json!({"type": "email"})), Timestamp::ZERO, 1.0).await.unwrap();

        let batch = queue
            .get(&payload(json!({"type": "email"})), no_wait().limit(10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload()["type"], json!("email"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_share_a_message() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryCollection::new())));
        for i in 0..50 {
            queue
                .send(payload(json!({"i": i})), Timestamp::ZERO, 0.0)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let batch = queue
                        .get(&Payload::new(), no_wait().limit(3))
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        return ids;
                    }
                    ids.extend(batch.iter().map(|m| m.id()));
                }
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }
}
