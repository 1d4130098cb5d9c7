//! Firmware lifecycle handler
//!
//! Drives the platform's firmware protocol on behalf of a [`FirmwareActions`]
//! implementation:
//!
//! ```text
//! iotdm-1/device/update   ──► verify                 (204 when the offer differs)
//! iotdm-1/observe         ──► is_ready_for_download  (200 when download can start)
//! .../firmware/download   ──► download  ──► 202 ──► download progress task
//! .../firmware/update     ──► update    ──► 202 ──► update progress task
//! iotdm-1/cancel          ──► 200
//! ```
//!
//! A progress task polls the device every `timeout / 10`, publishes a
//! notification after each poll and ends at the first terminal state or
//! after ten polls, whichever comes first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use super::attribute::first_field;
use super::device_data::{FirmwareInfo, FirmwareState, UpdateStatus};
use super::response::ActionResponse;
use crate::dispatch::ReplyQueue;
use crate::mqtt::message_manager::ReplyMessage;
use crate::routing::topic::{
    CANCEL_TOPIC, DEVICE_UPDATE_TOPIC, FIRMWARE_DOWNLOAD_TOPIC, FIRMWARE_UPDATE_TOPIC,
    NOTIFY_TOPIC, OBSERVE_TOPIC,
};
use crate::routing::MessageHandler;

/// Upper bound on progress polls per download or update
pub const MAX_PROGRESS_POLLS: usize = 10;

pub const FIRMWARE_FIELD: &str = "mgmt.firmware";

/// Device-side firmware operations
///
/// `download` and `update` only start the work and return 202; the
/// `report_*_progress` hooks are then polled to move `state` and
/// `update_status` forward.
pub trait FirmwareActions: Send + Sync {
    /// Checks the offered firmware, 204 when it differs from the installed one
    fn verify(&self, offer: &FirmwareInfo) -> ActionResponse;

    fn is_ready_for_download(&self, _offer: &FirmwareInfo) -> ActionResponse {
        ActionResponse::ok()
    }

    fn download(&self, info: &mut FirmwareInfo) -> ActionResponse;

    fn download_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn report_download_progress(&self, info: &mut FirmwareInfo);

    fn update(&self, info: &mut FirmwareInfo) -> ActionResponse;

    fn update_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn report_update_progress(&self, info: &mut FirmwareInfo);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Download,
    Update,
}

impl ProgressKind {
    fn timeout(self, actions: &dyn FirmwareActions) -> Duration {
        match self {
            ProgressKind::Download => actions.download_timeout(),
            ProgressKind::Update => actions.update_timeout(),
        }
    }

    fn poll(self, actions: &dyn FirmwareActions, info: &mut FirmwareInfo) {
        match self {
            ProgressKind::Download => actions.report_download_progress(info),
            ProgressKind::Update => actions.report_update_progress(info),
        }
    }

    fn is_finished(self, info: &FirmwareInfo) -> bool {
        match self {
            ProgressKind::Download => info.state == FirmwareState::Downloaded,
            ProgressKind::Update => info.update_status.is_terminal(),
        }
    }

    /// `{"d":{"fields":[{"field":"mgmt.firmware","value":{...}}]}}`
    fn notification(self, info: &FirmwareInfo) -> ReplyMessage {
        let value = info.progress_json(self == ProgressKind::Update);
        let payload = json!({
            "d": {"fields": [{"field": FIRMWARE_FIELD, "value": value}]}
        });
        ReplyMessage::at_least_once(NOTIFY_TOPIC, payload)
    }
}

struct ProgressTask {
    token: CancellationToken,
    handle: JoinHandle<usize>,
}

#[derive(Default)]
struct ProgressTasks {
    download: Option<ProgressTask>,
    update: Option<ProgressTask>,
}

impl ProgressTasks {
    fn slot(&mut self, kind: ProgressKind) -> &mut Option<ProgressTask> {
        match kind {
            ProgressKind::Download => &mut self.download,
            ProgressKind::Update => &mut self.update,
        }
    }
}

type SharedInfo = Arc<Mutex<FirmwareInfo>>;

fn lock_info(info: &SharedInfo) -> MutexGuard<'_, FirmwareInfo> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler for the firmware topics
pub struct FirmwareHandler {
    actions: Arc<dyn FirmwareActions>,
    info: SharedInfo,
    replies: ReplyQueue,
    progress: Mutex<ProgressTasks>,
    shutdown: CancellationToken,
    span: Span,
}

impl FirmwareHandler {
    pub fn new(actions: Arc<dyn FirmwareActions>, replies: ReplyQueue, span: Span) -> Self {
        Self {
            actions,
            info: SharedInfo::default(),
            replies,
            progress: Mutex::new(ProgressTasks::default()),
            shutdown: CancellationToken::new(),
            span,
        }
    }

    pub fn topics() -> [&'static str; 5] {
        [
            DEVICE_UPDATE_TOPIC,
            OBSERVE_TOPIC,
            CANCEL_TOPIC,
            FIRMWARE_DOWNLOAD_TOPIC,
            FIRMWARE_UPDATE_TOPIC,
        ]
    }

    pub fn info(&self) -> FirmwareInfo {
        lock_info(&self.info).clone()
    }

    /// Replaces the stored firmware description, e.g. with the installed one
    pub fn set_info(&self, info: FirmwareInfo) {
        *lock_info(&self.info) = info;
    }

    fn start_download(&self) -> ActionResponse {
        let response = {
            let mut info = lock_info(&self.info);
            info.state = FirmwareState::Idle;
            let response = self.actions.download(&mut info);
            if response.is_accepted() && info.state == FirmwareState::Idle {
                info.state = FirmwareState::Downloading;
            }
            response
        };
        if response.is_accepted() {
            self.spawn_progress(ProgressKind::Download);
        }
        response
    }

    fn start_update(&self) -> ActionResponse {
        let response = {
            let mut info = lock_info(&self.info);
            info.update_status = UpdateStatus::NotSet;
            let response = self.actions.update(&mut info);
            if response.is_accepted() && info.update_status == UpdateStatus::NotSet {
                info.update_status = UpdateStatus::InProgress;
            }
            response
        };
        if response.is_accepted() {
            self.spawn_progress(ProgressKind::Update);
        }
        response
    }

    fn spawn_progress(&self, kind: ProgressKind) {
        let Ok(runtime) = Handle::try_current() else {
            error!(parent: &self.span, "No runtime to report {:?} progress on", kind);
            return;
        };

        let token = self.shutdown.child_token();
        let handle = runtime.spawn(run_progress(
            kind,
            self.actions.clone(),
            self.info.clone(),
            self.replies.clone(),
            token.clone(),
            self.span.clone(),
        ));

        let previous = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(kind)
            .replace(ProgressTask { token, handle });
        if let Some(previous) = previous {
            info!(parent: &self.span, "Replacing running {:?} progress task", kind);
            previous.token.cancel();
        }
        debug!(parent: &self.span, "{:?} progress task spawned", kind);
    }

    /// Waits for the current progress task of `kind`, returning its poll count
    pub async fn join_progress(&self, kind: ProgressKind) -> Option<usize> {
        let task = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(kind)
            .take()?;

        match task.handle.await {
            Ok(polls) => Some(polls),
            Err(e) => {
                error!(parent: &self.span, "{:?} progress task failed: {}", kind, e);
                None
            }
        }
    }

    /// Cancels all progress tasks and waits for them to end
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.join_progress(ProgressKind::Download).await;
        self.join_progress(ProgressKind::Update).await;
        debug!(parent: &self.span, "Firmware progress tasks stopped");
    }
}

async fn run_progress(
    kind: ProgressKind,
    actions: Arc<dyn FirmwareActions>,
    info: SharedInfo,
    replies: ReplyQueue,
    token: CancellationToken,
    span: Span,
) -> usize {
    let interval = kind.timeout(actions.as_ref()) / MAX_PROGRESS_POLLS as u32;
    let mut polls = 0;

    while polls < MAX_PROGRESS_POLLS {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(parent: &span, "{:?} progress cancelled after {} polls", kind, polls);
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        polls += 1;

        let (notification, finished) = {
            let mut info = lock_info(&info);
            kind.poll(actions.as_ref(), &mut info);
            (kind.notification(&info), kind.is_finished(&info))
        };

        if !replies.enqueue(notification) {
            warn!(parent: &span, "{:?} progress notification dropped, dispatcher is gone", kind);
            break;
        }
        if finished {
            info!(parent: &span, "{:?} finished after {} polls", kind, polls);
            break;
        }
    }

    polls
}

impl MessageHandler for FirmwareHandler {
    fn name(&self) -> &str {
        "firmware"
    }

    fn on_document(&self, topic: &str, document: &Value) -> Option<ReplyMessage> {
        let response = match topic {
            DEVICE_UPDATE_TOPIC => {
                let (field, value) = first_field(document)?;
                if field != FIRMWARE_FIELD {
                    return None;
                }
                let offer = {
                    let mut info = lock_info(&self.info);
                    info.apply_offer(value);
                    info.clone()
                };
                info!(parent: &self.span, "Firmware offered: {} {}", offer.name, offer.version);
                self.actions.verify(&offer)
            }
            OBSERVE_TOPIC => self.actions.is_ready_for_download(&self.info()),
            FIRMWARE_DOWNLOAD_TOPIC => self.start_download(),
            FIRMWARE_UPDATE_TOPIC => self.start_update(),
            CANCEL_TOPIC => ActionResponse::ok(),
            other => {
                warn!(parent: &self.span, "Firmware request on unexpected topic {}", other);
                ActionResponse::unsupported(format!("no firmware action on {other}"))
            }
        };

        debug!(parent: &self.span, "Firmware request on {} answered with {}", topic, response.code());
        Some(response.into_reply(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::ReplyMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Finishes after the given number of polls, never when `None`
    struct Scripted {
        download_done_after: Option<usize>,
        update_result: Option<(usize, UpdateStatus)>,
        polls: AtomicUsize,
    }

    impl Scripted {
        fn new(download_done_after: Option<usize>, update_result: Option<(usize, UpdateStatus)>) -> Arc<Self> {
            Arc::new(Self {
                download_done_after,
                update_result,
                polls: AtomicUsize::new(0),
            })
        }
    }

    impl FirmwareActions for Scripted {
        fn verify(&self, offer: &FirmwareInfo) -> ActionResponse {
            if offer.version == "1.0" {
                ActionResponse::ok()
            } else {
                ActionResponse::changed()
            }
        }

        fn download(&self, _info: &mut FirmwareInfo) -> ActionResponse {
            ActionResponse::accepted()
        }

        fn report_download_progress(&self, info: &mut FirmwareInfo) {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.download_done_after == Some(polls) {
                info.state = FirmwareState::Downloaded;
            }
        }

        fn update(&self, _info: &mut FirmwareInfo) -> ActionResponse {
            ActionResponse::accepted()
        }

        fn report_update_progress(&self, info: &mut FirmwareInfo) {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, status)) = self.update_result {
                if polls == after {
                    info.set_update_status(status);
                }
            }
        }
    }

    fn handler(actions: Arc<Scripted>) -> (FirmwareHandler, mpsc::UnboundedReceiver<ReplyMessage>) {
        let (queue, rx) = ReplyQueue::channel();
        (FirmwareHandler::new(actions, queue, Span::none()), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ReplyMessage>) -> Vec<ReplyMessage> {
        let mut out = Vec::new();
        while let Ok(reply) = rx.try_recv() {
            out.push(reply);
        }
        out
    }

    fn firmware_value(reply: &ReplyMessage) -> &Value {
        &reply.payload["d"]["fields"][0]["value"]
    }

    #[test]
    fn verify_copies_offer_and_replies() {
        let (handler, _rx) = handler(Scripted::new(None, None));
        let update = json!({
            "reqId": "v1",
            "d": {"fields": [{"field": "mgmt.firmware", "value": {
                "name": "core", "version": "2.0", "uri": "https://fw.example/core-2.0", "verifier": "abc"
            }}]}
        });

        let reply = handler.on_document(DEVICE_UPDATE_TOPIC, &update).unwrap();
        assert_eq!(reply.payload, json!({"rc": 204, "reqId": "v1"}));
        assert_eq!(handler.info().uri, "https://fw.example/core-2.0");

        let location = json!({"d": {"fields": [{"field": "location", "value": {}}]}});
        assert!(handler.on_document(DEVICE_UPDATE_TOPIC, &location).is_none());
    }

    #[test]
    fn observe_and_cancel_reply_ok() {
        let (handler, _rx) = handler(Scripted::new(None, None));
        let reply = handler.on_document(OBSERVE_TOPIC, &json!({"reqId": "o1"})).unwrap();
        assert_eq!(reply.payload["rc"], 200);
        let reply = handler.on_document(CANCEL_TOPIC, &json!({"reqId": "c1"})).unwrap();
        assert_eq!(reply.payload, json!({"rc": 200, "reqId": "c1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn download_progress_stops_after_ten_polls() {
        let (handler, mut rx) = handler(Scripted::new(None, None));
        let started = tokio::time::Instant::now();

        let reply = handler
            .on_document(FIRMWARE_DOWNLOAD_TOPIC, &json!({"reqId": "d1"}))
            .unwrap();
        assert_eq!(reply.payload["rc"], 202);
        assert_eq!(handler.info().state, FirmwareState::Downloading);

        assert_eq!(handler.join_progress(ProgressKind::Download).await, Some(10));
        assert_eq!(started.elapsed(), Duration::from_secs(60));

        let notifications = drain(&mut rx);
        assert_eq!(notifications.len(), 10);
        assert!(notifications.iter().all(|n| n.topic == NOTIFY_TOPIC));
        assert_eq!(firmware_value(&notifications[9]), &json!({"state": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn download_progress_ends_when_downloaded() {
        let (handler, mut rx) = handler(Scripted::new(Some(3), None));

        handler.on_document(FIRMWARE_DOWNLOAD_TOPIC, &json!({"reqId": "d1"}));
        assert_eq!(handler.join_progress(ProgressKind::Download).await, Some(3));

        let notifications = drain(&mut rx);
        assert_eq!(notifications.len(), 3);
        assert_eq!(firmware_value(&notifications[2]), &json!({"state": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn update_progress_ends_when_status_leaves_in_progress() {
        let (handler, mut rx) = handler(Scripted::new(None, Some((2, UpdateStatus::Success))));

        handler.on_document(FIRMWARE_UPDATE_TOPIC, &json!({"reqId": "u1"}));
        assert_eq!(handler.info().update_status, UpdateStatus::InProgress);
        assert_eq!(handler.join_progress(ProgressKind::Update).await, Some(2));

        let notifications = drain(&mut rx);
        assert_eq!(notifications.len(), 2);
        assert_eq!(firmware_value(&notifications[0])["updateStatus"], 1);
        let last = firmware_value(&notifications[1]);
        assert_eq!(last["updateStatus"], 0);
        assert!(last["updatedDateTime"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_is_terminal() {
        let (handler, mut rx) = handler(Scripted::new(None, Some((1, UpdateStatus::VerificationFailed))));

        handler.on_document(FIRMWARE_UPDATE_TOPIC, &json!({"reqId": "u1"}));
        assert_eq!(handler.join_progress(ProgressKind::Update).await, Some(1));
        let notifications = drain(&mut rx);
        assert_eq!(firmware_value(&notifications[0]), &json!({"state": 0, "updateStatus": 4}));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_progress() {
        let (handler, mut rx) = handler(Scripted::new(None, None));
        handler.on_document(FIRMWARE_DOWNLOAD_TOPIC, &json!({"reqId": "d1"}));

        // Two polls at 6s intervals
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        handler.shutdown().await;

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(handler.join_progress(ProgressKind::Download).await, None);
    }
}
