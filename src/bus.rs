//! Topic-addressed publish/subscribe bus for incremental units.
//!
//! In-process implementation of the transport contract: producers publish to
//! a named topic; each subscriber gets its own bounded queue and sees every
//! unit published after subscription, in the publisher's per-topic order.
//! When a subscriber queue is full the oldest *uncommitted* unit at the head
//! is dropped; a COMMIT at the head instead blocks the publisher until the
//! subscriber catches up, so commits are never lost. Drops happen only at the
//! head, which keeps every delivery sequence a subsequence of the publication
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::iu::{IncrementalUnit, UpdateType};

/// Logical topic names.
pub mod topics {
    pub const AUDIO_IN: &str = "audio.in";
    pub const ASR_PARTIAL: &str = "asr.partial";
    pub const ASR_COMMIT: &str = "asr.commit";
    pub const VAP_PROB: &str = "vap.prob";
    pub const INTENT_TIMEOUT: &str = "intent.timeout";
    pub const DIALOGUE_TEXT: &str = "dialogue.text";
    pub const TTS_AUDIO: &str = "tts.audio";
    pub const AUDIO_OUT: &str = "audio.out";
    pub const SYSTEM_STATE: &str = "system.state";
    pub const BC_SUGGEST: &str = "bc.suggest";
}

/// One subscriber's bounded queue.
struct SubQueue {
    items: Mutex<VecDeque<IncrementalUnit>>,
    capacity: usize,
    /// Signaled on push; single consumer per queue.
    readable: Notify,
    /// Signaled on pop; wakes publishers blocked on a COMMIT at the head.
    writable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one unit, applying the backpressure policy.
    async fn push(&self, iu: IncrementalUnit, topic: &str) {
        let mut iu = Some(iu);
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return;
            }

            // Register interest before inspecting the queue so a pop between
            // the check and the await cannot be missed.
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut items = self.items.lock().expect("bus queue lock");
                if items.len() < self.capacity {
                    items.push_back(iu.take().expect("unit present"));
                    drop(items);
                    self.readable.notify_one();
                    return;
                }
                let head_committed = items
                    .front()
                    .is_some_and(|head| head.update_type == UpdateType::Commit);
                if !head_committed {
                    // Stale partial at the head: worthless, make room.
                    items.pop_front();
                    items.push_back(iu.take().expect("unit present"));
                    drop(items);
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 10 == 1 {
                        warn!(topic, dropped, "subscriber queue full, dropping oldest partial");
                    }
                    self.readable.notify_one();
                    return;
                }
            }

            // Head is a COMMIT: never drop it, wait for the subscriber.
            writable.await;
        }
    }

    async fn pop(&self) -> Option<IncrementalUnit> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut items = self.items.lock().expect("bus queue lock");
                if let Some(iu) = items.pop_front() {
                    drop(items);
                    self.writable.notify_waiters();
                    return Some(iu);
                }
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            readable.await;
        }
    }
}

/// A subscription to one topic. Dropping it cancels the subscription.
pub struct Subscription {
    topic: &'static str,
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Receive the next unit. Returns `None` once the bus is closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<IncrementalUnit> {
        self.queue.pop().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<IncrementalUnit> {
        let iu = self
            .queue
            .items
            .lock()
            .expect("bus queue lock")
            .pop_front();
        if iu.is_some() {
            self.queue.writable.notify_waiters();
        }
        iu
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Units dropped from this subscription's queue under backpressure.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Lazily yield units as a stream.
    pub fn into_stream(self) -> impl Stream<Item = IncrementalUnit> {
        async_stream::stream! {
            let mut sub = self;
            while let Some(iu) = sub.recv().await {
                yield iu;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Relaxed);
        self.queue.writable.notify_waiters();
    }
}

/// The shared topic exchange. Cheap to clone; all clones address the same
/// exchange.
#[derive(Clone)]
pub struct MessageBus {
    topics: Arc<Mutex<HashMap<&'static str, Vec<Arc<SubQueue>>>>>,
    buff_size: usize,
    closed: Arc<AtomicBool>,
}

impl MessageBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            buff_size: config.buff_size,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish one unit to every current subscriber of `topic`.
    ///
    /// Non-blocking up to each subscriber's queue depth; only a COMMIT stuck
    /// at the head of a full queue makes this await.
    pub async fn publish(&self, topic: &'static str, iu: IncrementalUnit) {
        let queues: Vec<Arc<SubQueue>> = {
            let mut topics = self.topics.lock().expect("bus topics lock");
            let Some(subs) = topics.get_mut(topic) else {
                debug!(topic, "publish with no subscribers");
                return;
            };
            subs.retain(|q| !q.closed.load(Ordering::Relaxed));
            subs.clone()
        };

        for queue in &queues {
            queue.push(iu.clone(), topic).await;
        }
    }

    /// Subscribe to `topic`, receiving every unit published afterwards.
    pub fn subscribe(&self, topic: &'static str) -> Subscription {
        let queue = Arc::new(SubQueue::new(self.buff_size));
        self.topics
            .lock()
            .expect("bus topics lock")
            .entry(topic)
            .or_default()
            .push(Arc::clone(&queue));
        Subscription { topic, queue }
    }

    /// Close the bus: subscribers drain what is queued, then see end of
    /// stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let topics = self.topics.lock().expect("bus topics lock");
        for subs in topics.values() {
            for q in subs {
                q.closed.store(true, Ordering::Relaxed);
                q.readable.notify_one();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
