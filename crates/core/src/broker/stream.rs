use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::BrokerError;
use crate::broker::store::{OpLog, StoreCipher};

/// How long a delivered message may sit unacknowledged before it is handed
/// out again. `in_progress()` resets the window.
const ACK_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct StreamConfig {
  pub name: String,
  /// Subject filters captured by this stream, e.g. `exec.>`.
  pub subjects: Vec<String>,
  pub replicas: usize,
}

#[derive(Clone, Debug)]
pub struct StoredMessage {
  pub seq: u64,
  pub subject: String,
  pub payload: Vec<u8>,
  pub headers: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
enum StreamRecord {
  Msg {
    seq: u64,
    subject: String,
    payload: String,
    headers: HashMap<String, String>,
    msg_id: Option<String>,
  },
  Ack {
    seq: u64,
  },
}

#[derive(Debug)]
struct StreamState {
  entries: BTreeMap<u64, Arc<StoredMessage>>,
  next_seq: u64,
  /// Server-side idempotency: msg-id -> sequence it was stored at.
  dedup: HashMap<String, u64>,
  consumers: HashMap<String, Arc<Consumer>>,
  log: OpLog,
}

/// A durable stream with work-queue retention: messages are removed on ack
/// and redelivered on nak or ack-wait expiry until max-deliver is reached.
#[derive(Debug)]
pub struct Stream {
  config: StreamConfig,
  state: Mutex<StreamState>,
}

impl Stream {
  pub(super) fn open(
    dir: &Path,
    config: StreamConfig,
    cipher: Option<Arc<StoreCipher>>,
  ) -> Result<Self, BrokerError> {
    let label = format!("stream:{}", config.name);
    let (log, records) = OpLog::open(&dir.join("msgs.log"), &label, cipher)?;

    let mut entries = BTreeMap::new();
    let mut dedup = HashMap::new();
    let mut next_seq = 1u64;
    for record in records {
      let record: StreamRecord = serde_json::from_slice(&record)
        .map_err(|err| BrokerError::Storage(format!("corrupt stream record: {err}")))?;
      match record {
        StreamRecord::Msg {
          seq,
          subject,
          payload,
          headers,
          msg_id,
        } => {
          entries.insert(
            seq,
            Arc::new(StoredMessage {
              seq,
              subject,
              payload: BASE64.decode(&payload).unwrap_or_default(),
              headers,
            }),
          );
          if let Some(msg_id) = msg_id {
            dedup.insert(msg_id, seq);
          }
          next_seq = next_seq.max(seq + 1);
        }
        StreamRecord::Ack { seq } => {
          entries.remove(&seq);
        }
      }
    }

    return Ok(Self {
      config,
      state: Mutex::new(StreamState {
        entries,
        next_seq,
        dedup,
        consumers: HashMap::new(),
        log,
      }),
    });
  }

  pub fn name(&self) -> &str {
    return &self.config.name;
  }

  pub fn config(&self) -> &StreamConfig {
    return &self.config;
  }

  pub fn captures_subject(&self, subject: &str) -> bool {
    return self
      .config
      .subjects
      .iter()
      .any(|filter| super::subject_matches(filter, subject));
  }

  /// Durably store a message and offer it to matching consumers. A repeated
  /// `msg_id` is deduplicated and returns the original sequence.
  pub fn publish(
    &self,
    subject: &str,
    payload: &[u8],
    msg_id: Option<&str>,
    headers: HashMap<String, String>,
  ) -> Result<u64, BrokerError> {
    let (seq, consumers) = {
      let mut state = self.state.lock();

      if let Some(msg_id) = msg_id {
        if let Some(&seq) = state.dedup.get(msg_id) {
          debug!("Duplicate msg_id '{msg_id}' on '{subject}': deduplicated to seq {seq}");
          return Ok(seq);
        }
      }

      let seq = state.next_seq;
      let record = StreamRecord::Msg {
        seq,
        subject: subject.to_string(),
        payload: BASE64.encode(payload),
        headers: headers.clone(),
        msg_id: msg_id.map(str::to_string),
      };
      let encoded = serde_json::to_vec(&record)
        .map_err(|err| BrokerError::Storage(format!("stream record encode: {err}")))?;
      state.log.append(&encoded)?;

      state.next_seq += 1;
      if let Some(msg_id) = msg_id {
        state.dedup.insert(msg_id.to_string(), seq);
      }
      state.entries.insert(
        seq,
        Arc::new(StoredMessage {
          seq,
          subject: subject.to_string(),
          payload: payload.to_vec(),
          headers,
        }),
      );

      let consumers: Vec<Arc<Consumer>> = state
        .consumers
        .values()
        .filter(|c| super::subject_matches(&c.filter, subject))
        .cloned()
        .collect();
      (seq, consumers)
    };

    for consumer in consumers {
      consumer.enqueue(seq);
    }
    return Ok(seq);
  }

  /// Work-queue retention: acknowledging removes the message.
  pub(super) fn ack(&self, seq: u64) -> Result<(), BrokerError> {
    let mut state = self.state.lock();
    if state.entries.remove(&seq).is_none() {
      return Ok(());
    }
    let encoded = serde_json::to_vec(&StreamRecord::Ack { seq })
      .map_err(|err| BrokerError::Storage(format!("stream record encode: {err}")))?;
    state.log.append(&encoded)?;
    return Ok(());
  }

  fn message(&self, seq: u64) -> Option<Arc<StoredMessage>> {
    return self.state.lock().entries.get(&seq).cloned();
  }

  /// Unacknowledged message count, sampled by the queue-depth monitor.
  pub fn pending_count(&self) -> usize {
    return self.state.lock().entries.len();
  }

  /// Get or create the shared consumer for a queue group. A drained consumer
  /// is replaced by a fresh one seeded from the currently stored messages.
  pub(super) fn queue_consumer(
    self: &Arc<Self>,
    filter: &str,
    group: &str,
    max_deliver: u64,
  ) -> Arc<Consumer> {
    let mut state = self.state.lock();

    if let Some(existing) = state.consumers.get(group) {
      if !existing.is_draining() {
        return existing.clone();
      }
    }

    let consumer = Arc::new(Consumer {
      filter: filter.to_string(),
      group: group.to_string(),
      max_deliver,
      state: Mutex::new(ConsumerState {
        ready: VecDeque::new(),
        deliveries: HashMap::new(),
        draining: false,
        in_flight: 0,
      }),
      notify: Notify::new(),
    });

    {
      let mut cstate = consumer.state.lock();
      for (seq, msg) in &state.entries {
        if super::subject_matches(filter, &msg.subject) {
          cstate.ready.push_back(*seq);
        }
      }
    }

    state.consumers.insert(group.to_string(), consumer.clone());
    return consumer;
  }

  pub(super) fn remove_consumer(&self, group: &str) {
    self.state.lock().consumers.remove(group);
  }
}

#[derive(Debug)]
struct Delivery {
  count: u64,
  redeliver_at: Instant,
  in_flight: bool,
  exhausted: bool,
}

#[derive(Debug)]
struct ConsumerState {
  ready: VecDeque<u64>,
  deliveries: HashMap<u64, Delivery>,
  draining: bool,
  in_flight: usize,
}

/// One durable consumer per queue group; concurrent fetchers on the same
/// consumer load-balance its messages.
#[derive(Debug)]
pub struct Consumer {
  filter: String,
  group: String,
  max_deliver: u64,
  state: Mutex<ConsumerState>,
  notify: Notify,
}

impl Consumer {
  fn enqueue(&self, seq: u64) {
    {
      let mut state = self.state.lock();
      if state.draining {
        return;
      }
      state.ready.push_back(seq);
    }
    self.notify.notify_waiters();
  }

  fn is_draining(&self) -> bool {
    return self.state.lock().draining;
  }

  /// Move expired deliveries back onto the ready queue and report the next
  /// wake-up deadline, if any.
  fn requeue_expired(&self, now: Instant) -> Option<Instant> {
    let mut state = self.state.lock();
    let state = &mut *state;
    let mut expired = Vec::new();
    let mut next: Option<Instant> = None;

    for (&seq, delivery) in &state.deliveries {
      if delivery.exhausted {
        continue;
      }
      if delivery.redeliver_at <= now {
        expired.push(seq);
      } else {
        next = Some(next.map_or(delivery.redeliver_at, |n| n.min(delivery.redeliver_at)));
      }
    }

    for seq in expired {
      if let Some(delivery) = state.deliveries.get_mut(&seq) {
        if delivery.in_flight {
          // Ack window expired on an in-flight handler; the message becomes
          // eligible again, matching at-least-once semantics.
          delivery.in_flight = false;
          state.in_flight = state.in_flight.saturating_sub(1);
        }
        // Parked until taken; avoids re-queuing on every scan.
        delivery.redeliver_at = now + ACK_WAIT;
        state.ready.push_back(seq);
      }
    }

    return next;
  }

  fn take_ready(&self) -> Option<(u64, u64)> {
    let mut state = self.state.lock();
    let state = &mut *state;
    if state.draining {
      return None;
    }

    while let Some(seq) = state.ready.pop_front() {
      let max_deliver = self.max_deliver;
      let delivery = state.deliveries.entry(seq).or_insert(Delivery {
        count: 0,
        redeliver_at: Instant::now(),
        in_flight: false,
        exhausted: false,
      });
      if delivery.exhausted || delivery.in_flight {
        continue;
      }
      if delivery.count >= max_deliver {
        delivery.exhausted = true;
        warn!("Message seq {seq} exhausted {max_deliver} deliveries without ack");
        continue;
      }

      delivery.count += 1;
      delivery.in_flight = true;
      delivery.redeliver_at = Instant::now() + ACK_WAIT;
      let count = delivery.count;
      state.in_flight += 1;
      return Some((seq, count));
    }
    return None;
  }

  fn complete(&self, seq: u64) {
    {
      let mut state = self.state.lock();
      if state.deliveries.remove(&seq).is_some_and(|d| d.in_flight) {
        state.in_flight = state.in_flight.saturating_sub(1);
      }
    }
    self.notify.notify_waiters();
  }

  fn release(&self, seq: u64, delay: Duration) {
    {
      let mut state = self.state.lock();
      let state = &mut *state;
      if let Some(delivery) = state.deliveries.get_mut(&seq) {
        if delivery.in_flight {
          delivery.in_flight = false;
          state.in_flight = state.in_flight.saturating_sub(1);
        }
        delivery.redeliver_at = Instant::now() + delay;
      }
    }
    self.notify.notify_waiters();
  }

  fn extend(&self, seq: u64) {
    let mut state = self.state.lock();
    if let Some(delivery) = state.deliveries.get_mut(&seq) {
      delivery.redeliver_at = Instant::now() + ACK_WAIT;
    }
  }
}

/// Handle on a queue subscription. Dropping it does not drain; call
/// [`Subscription::drain`] to stop delivery and wait for in-flight messages.
#[derive(Clone)]
#[derive(Debug)]
pub struct Subscription {
  pub(super) stream: Arc<Stream>,
  pub(super) consumer: Arc<Consumer>,
}

impl Subscription {
  /// Wait for the next message. Returns `None` once the subscription is
  /// draining and nothing is left in flight for this fetcher.
  pub async fn fetch(&self) -> Option<JobMessage> {
    loop {
      let notified = self.consumer.notify.notified();

      let next_deadline = self.consumer.requeue_expired(Instant::now());
      while let Some((seq, count)) = self.consumer.take_ready() {
        let Some(message) = self.stream.message(seq) else {
          // Acked elsewhere between scheduling and fetch.
          self.consumer.complete(seq);
          continue;
        };
        return Some(JobMessage {
          message,
          delivered: count,
          stream: self.stream.clone(),
          consumer: self.consumer.clone(),
        });
      }

      if self.consumer.is_draining() {
        return None;
      }

      match next_deadline {
        Some(deadline) => {
          tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => {}
          }
        }
        None => notified.await,
      }
    }
  }

  /// Stop delivering, then wait until every in-flight message has been acked
  /// or released. The consumer is unregistered from the stream so undelivered
  /// messages wait for the next consumer generation.
  pub async fn drain(&self) {
    {
      let mut state = self.consumer.state.lock();
      state.draining = true;
      state.ready.clear();
    }
    self.consumer.notify.notify_waiters();

    loop {
      let notified = self.consumer.notify.notified();
      if self.consumer.state.lock().in_flight == 0 {
        break;
      }
      notified.await;
    }

    self.stream.remove_consumer(&self.consumer.group);
  }

  pub fn pending(&self) -> usize {
    let state = self.consumer.state.lock();
    return state.ready.len() + state.in_flight;
  }
}

/// Delivery metadata exposed to workers.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryInfo {
  pub stream_seq: u64,
  pub delivered: u64,
}

/// A message handed to a queue subscriber. Manual acknowledgment: exactly one
/// of `ack`, `nak`, or `nak_with_delay` should be issued per delivery.
pub struct JobMessage {
  message: Arc<StoredMessage>,
  delivered: u64,
  stream: Arc<Stream>,
  consumer: Arc<Consumer>,
}

impl JobMessage {
  pub fn subject(&self) -> &str {
    return &self.message.subject;
  }

  pub fn payload(&self) -> &[u8] {
    return &self.message.payload;
  }

  pub fn headers(&self) -> &HashMap<String, String> {
    return &self.message.headers;
  }

  pub fn metadata(&self) -> Result<DeliveryInfo, BrokerError> {
    return Ok(DeliveryInfo {
      stream_seq: self.message.seq,
      delivered: self.delivered,
    });
  }

  /// Terminal: removes the message from the work queue.
  pub fn ack(&self) -> Result<(), BrokerError> {
    self.stream.ack(self.message.seq)?;
    self.consumer.complete(self.message.seq);
    return Ok(());
  }

  pub fn nak(&self) {
    self.consumer.release(self.message.seq, Duration::ZERO);
  }

  pub fn nak_with_delay(&self, delay: Duration) {
    self.consumer.release(self.message.seq, delay);
  }

  /// Signal the handler is still working; extends the ack window.
  pub fn in_progress(&self) {
    self.consumer.extend(self.message.seq);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_stream(dir: &Path) -> Arc<Stream> {
    return Arc::new(
      Stream::open(
        dir,
        StreamConfig {
          name: "TEST_WORKER".to_string(),
          subjects: vec!["exec.>".to_string()],
          replicas: 1,
        },
        None,
      )
      .expect("open"),
    );
  }

  fn subscribe(stream: &Arc<Stream>, subject: &str, max_deliver: u64) -> Subscription {
    let consumer = stream.queue_consumer(subject, "WORKERS_test", max_deliver);
    return Subscription {
      stream: stream.clone(),
      consumer,
    };
  }

  #[tokio::test]
  async fn test_publish_fetch_ack_removes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());
    let sub = subscribe(&stream, "exec.abc", 6);

    stream
      .publish("exec.abc", b"job-1", Some("m1"), HashMap::new())
      .expect("publish");
    assert_eq!(stream.pending_count(), 1);

    let msg = sub.fetch().await.expect("message");
    assert_eq!(msg.payload(), b"job-1");
    assert_eq!(msg.metadata().expect("meta").delivered, 1);

    msg.ack().expect("ack");
    assert_eq!(stream.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_msg_id_dedup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());

    let first = stream
      .publish("exec.abc", b"payload", Some("job_1"), HashMap::new())
      .expect("publish");
    let second = stream
      .publish("exec.abc", b"payload", Some("job_1"), HashMap::new())
      .expect("publish");
    assert_eq!(first, second);
    assert_eq!(stream.pending_count(), 1);
  }

  #[tokio::test]
  async fn test_nak_redelivers_with_incremented_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());
    let sub = subscribe(&stream, "exec.abc", 6);

    stream
      .publish("exec.abc", b"flaky", None, HashMap::new())
      .expect("publish");

    let msg = sub.fetch().await.expect("message");
    assert_eq!(msg.metadata().expect("meta").delivered, 1);
    msg.nak();

    let again = sub.fetch().await.expect("redelivery");
    assert_eq!(again.metadata().expect("meta").delivered, 2);
    again.ack().expect("ack");
  }

  #[tokio::test]
  async fn test_max_deliver_stops_redelivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());
    let sub = subscribe(&stream, "exec.abc", 2);

    stream
      .publish("exec.abc", b"doomed", None, HashMap::new())
      .expect("publish");

    for expected in 1..=2u64 {
      let msg = sub.fetch().await.expect("delivery");
      assert_eq!(msg.metadata().expect("meta").delivered, expected);
      msg.nak();
    }

    // Third fetch must not yield the exhausted message.
    let outcome = tokio::time::timeout(Duration::from_millis(100), sub.fetch()).await;
    assert!(outcome.is_err(), "exhausted message was redelivered");
  }

  #[tokio::test]
  async fn test_queue_group_load_balances_without_double_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());
    let sub_a = subscribe(&stream, "exec.abc", 6);
    let sub_b = subscribe(&stream, "exec.abc", 6);

    for i in 0..8 {
      stream
        .publish("exec.abc", format!("job-{i}").as_bytes(), None, HashMap::new())
        .expect("publish");
    }

    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
      let a = sub_a.fetch().await.expect("a");
      let b = sub_b.fetch().await.expect("b");
      assert!(seen.insert(a.metadata().expect("meta").stream_seq));
      assert!(seen.insert(b.metadata().expect("meta").stream_seq));
      a.ack().expect("ack");
      b.ack().expect("ack");
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(stream.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_drain_waits_for_in_flight() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stream = open_stream(dir.path());
    let sub = subscribe(&stream, "exec.abc", 6);

    stream
      .publish("exec.abc", b"slow", None, HashMap::new())
      .expect("publish");

    let msg = sub.fetch().await.expect("message");

    let drainer = {
      let sub = sub.clone();
      tokio::spawn(async move { sub.drain().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drainer.is_finished(), "drain returned with a message in flight");

    msg.ack().expect("ack");
    tokio::time::timeout(Duration::from_secs(1), drainer)
      .await
      .expect("drain finished")
      .expect("join");

    assert!(sub.fetch().await.is_none());
  }

  #[tokio::test]
  async fn test_unacked_messages_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
      let stream = open_stream(dir.path());
      stream
        .publish("exec.abc", b"durable", Some("m1"), HashMap::new())
        .expect("publish");
      let sub = subscribe(&stream, "exec.abc", 6);
      let msg = sub.fetch().await.expect("message");
      // Delivered but never acked.
      drop(msg);
    }

    let stream = open_stream(dir.path());
    assert_eq!(stream.pending_count(), 1);

    let sub = subscribe(&stream, "exec.abc", 6);
    let msg = sub.fetch().await.expect("redelivered after restart");
    assert_eq!(msg.payload(), b"durable");
    msg.ack().expect("ack");

    // And the ack is durable too.
    drop(stream);
    let stream = open_stream(dir.path());
    assert_eq!(stream.pending_count(), 0);
  }
}
