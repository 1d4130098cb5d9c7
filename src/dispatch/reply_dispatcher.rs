//! Outbound reply dispatcher with statum state machine
//!
//! One worker task drains the reply queue and publishes entries one at a
//! time, so the inbound path never waits on publish latency.
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Running ──► Stopped
//!   (start)        (shutdown)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::config::ClientSettings;
use crate::mqtt::message_manager::ReplyMessage;
use crate::mqtt::{with_timeout, Transport};

/// Sending half of the reply queue
///
/// Cheap to clone. Handlers enqueue from the inbound task without waiting.
#[derive(Debug, Clone)]
pub struct ReplyQueue {
    sender: mpsc::UnboundedSender<ReplyMessage>,
}

impl ReplyQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReplyMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues a reply, returns false once the dispatcher is gone
    pub fn enqueue(&self, reply: ReplyMessage) -> bool {
        self.sender.send(reply).is_ok()
    }
}

// Dispatcher settings
#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub publish_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ClientSettings> for DispatcherSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            poll_interval: settings.reply_poll_interval(),
            publish_timeout: settings.publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: usize,
    pub failed: usize,
    /// Replies still queued when the dispatcher stopped
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicUsize,
    failed: AtomicUsize,
    dropped: AtomicUsize,
}

#[state]
#[derive(Debug, Clone)]
pub enum DispatcherState {
    Configured, // Queue created, worker not spawned
    Running,    // Worker draining the queue
    Stopped,    // Worker joined
}

#[machine]
pub struct ReplyDispatcher<S: DispatcherState> {
    receiver: Option<mpsc::UnboundedReceiver<ReplyMessage>>,
    worker: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    settings: DispatcherSettings,
    counters: Arc<Counters>,
    span: Span,
}

impl<S: DispatcherState> ReplyDispatcher<S> {
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }
}

impl ReplyDispatcher<Configured> {
    /// Creates the dispatcher and the queue handle that feeds it
    ///
    /// Replies may be queued right away. They are published once the
    /// dispatcher is started with a transport.
    pub fn create(
        settings: Option<DispatcherSettings>,
        span: Span,
    ) -> (Self, ReplyQueue) {
        let settings = settings.unwrap_or_default();
        debug!(parent: &span, "Creating reply dispatcher with settings: {:?}", settings);

        let (queue, receiver) = ReplyQueue::channel();
        let dispatcher = Self::new(
            Some(receiver),
            None, // worker
            CancellationToken::new(),
            settings,
            Arc::new(Counters::default()),
            span,
        );
        (dispatcher, queue)
    }

    /// Spawns the worker task publishing through `transport`
    pub fn start(mut self, transport: Arc<dyn Transport>) -> ReplyDispatcher<Running> {
        match self.receiver.take() {
            Some(receiver) => {
                let worker = Worker {
                    receiver,
                    transport,
                    settings: self.settings.clone(),
                    counters: self.counters.clone(),
                    shutdown: self.shutdown.clone(),
                    span: self.span.clone(),
                };
                self.worker = Some(tokio::spawn(worker.run()));
                info!(parent: &self.span, "Reply dispatcher started");
            }
            None => error!(parent: &self.span, "Reply dispatcher has no queue to drain"),
        }
        self.transition()
    }
}

impl ReplyDispatcher<Running> {
    /// Signals the worker to exit and joins it
    ///
    /// A publish already in flight completes or times out first.
    pub async fn shutdown(mut self) -> ReplyDispatcher<Stopped> {
        info!(parent: &self.span, "Stopping reply dispatcher");
        self.shutdown.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(parent: &self.span, "Reply dispatcher worker failed: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            parent: &self.span,
            "Reply dispatcher stopped: {} published, {} failed, {} dropped",
            stats.published, stats.failed, stats.dropped
        );
        self.transition()
    }
}

struct Worker {
    receiver: mpsc::UnboundedReceiver<ReplyMessage>,
    transport: Arc<dyn Transport>,
    settings: DispatcherSettings,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    span: Span,
}

impl Worker {
    async fn run(mut self) {
        debug!(parent: &self.span, "Reply dispatcher worker running");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(self.settings.poll_interval, self.receiver.recv()) => next,
            };

            match next {
                Ok(Some(reply)) => self.publish(reply).await,
                Ok(None) => {
                    debug!(parent: &self.span, "Reply queue closed");
                    break;
                }
                // idle poll
                Err(_) => continue,
            }
        }

        self.receiver.close();
        while self.receiver.try_recv().is_ok() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn publish(&self, reply: ReplyMessage) {
        debug!(parent: &self.span, "Publishing reply {}", reply);
        let result = with_timeout(
            "publish",
            &reply.topic,
            self.settings.publish_timeout,
            self.transport.publish(&reply.topic, reply.to_bytes(), reply.qos),
        )
        .await;

        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(parent: &self.span, "Reply on {} not delivered: {}", reply.topic, e);
            }
        }
    }
}
