//! Streaming relay: forwards upstream fragments to the client as SSE frames.
//!
//! Each streaming request gets its own spawned task that reads the upstream
//! fragment stream and pushes [`StreamEvent`]s through a bounded channel into
//! the response body. The body owns a [`DropGuard`] for the task's
//! cancellation token, so when the client goes away (and axum drops the body)
//! the task stops and the upstream stream is dropped with it.
//!
//! [`DropGuard`]: tokio_util::sync::DropGuard

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::stream::FragmentStream;
use super::types::{ChatMessage, GenerationParams, StreamEvent};
use super::upstream::UpstreamClient;
use crate::error::Result;

/// Events buffered between the pump and the response body.
///
/// With a single slot the pump waits for the client to take each frame
/// before it reads the next upstream fragment.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Everything the relay needs for one upstream call.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// `done` was delivered.
    Completed,
    /// `error` was delivered (or was attempted).
    Failed,
    /// The client went away before a terminal event could be delivered.
    Disconnected,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Completed => "completed",
            RelayStatus::Failed => "failed",
            RelayStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished relay task.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub status: RelayStatus,
    /// Content events delivered to the client.
    pub fragments: usize,
    /// Text delivered so far, in order.
    pub assembled: String,
    pub error: Option<String>,
}

impl RelayOutcome {
    fn new(status: RelayStatus, fragments: usize, assembled: String) -> Self {
        Self {
            status,
            fragments,
            assembled,
            error: None,
        }
    }

    /// Characters of assembled output.
    pub fn output_chars(&self) -> usize {
        self.assembled.chars().count()
    }
}

/// Send one event unless the request has been cancelled.
///
/// Returns false when the event could not be delivered.
async fn emit(tx: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken, event: StreamEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Deliver a terminal error event and build the matching outcome.
async fn fail(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    message: String,
    fragments: usize,
    assembled: String,
) -> RelayOutcome {
    tracing::warn!(error = %message, fragments, "Relay failed");
    let status = if emit(tx, cancel, StreamEvent::Error(message.clone())).await {
        RelayStatus::Failed
    } else {
        RelayStatus::Disconnected
    };
    RelayOutcome {
        error: Some(message),
        ..RelayOutcome::new(status, fragments, assembled)
    }
}

fn idle_message(idle: Duration) -> String {
    format!("Upstream produced no data for {}s", idle.as_secs())
}

/// Forward upstream fragments as `content` events, then exactly one terminal event.
///
/// Stops reading upstream as soon as `cancel` fires or the receiver is gone;
/// the fragment stream is dropped on return either way.
pub async fn pump_fragments(
    mut fragments: FragmentStream,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    idle: Duration,
) -> RelayOutcome {
    let mut count = 0usize;
    let mut assembled = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RelayOutcome::new(RelayStatus::Disconnected, count, assembled);
            }
            next = tokio::time::timeout(idle, fragments.next()) => next,
        };

        match next {
            Ok(Some(Ok(fragment))) => {
                if fragment.is_empty() {
                    continue;
                }
                assembled.push_str(&fragment);
                if !emit(tx, cancel, StreamEvent::Content(fragment)).await {
                    return RelayOutcome::new(RelayStatus::Disconnected, count, assembled);
                }
                count += 1;
            }
            Ok(Some(Err(e))) => {
                return fail(tx, cancel, e.to_string(), count, assembled).await;
            }
            Ok(None) => {
                let status = if emit(tx, cancel, StreamEvent::Done).await {
                    RelayStatus::Completed
                } else {
                    RelayStatus::Disconnected
                };
                return RelayOutcome::new(status, count, assembled);
            }
            Err(_) => {
                return fail(tx, cancel, idle_message(idle), count, assembled).await;
            }
        }
    }
}

/// Upstream caller shared by all requests.
#[derive(Clone)]
pub struct Relay {
    upstream: UpstreamClient,
    idle_timeout: Duration,
}

impl Relay {
    pub fn new(upstream: UpstreamClient, idle_timeout: Duration) -> Self {
        Self {
            upstream,
            idle_timeout,
        }
    }

    /// Start a streaming relay.
    ///
    /// Returns the SSE response body and a handle resolving to the outcome
    /// once the task has finished. Dropping the body cancels the task.
    pub fn spawn_stream(&self, request: RelayRequest) -> (Body, JoinHandle<RelayOutcome>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let relay = self.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { relay.run(request, tx, task_cancel).await });

        let guard = cancel.drop_guard();
        let frames = ReceiverStream::new(rx).map(move |event: StreamEvent| {
            let _ = &guard;
            Ok::<_, Infallible>(event.to_frame())
        });

        (Body::from_stream(frames), handle)
    }

    async fn run(
        self,
        request: RelayRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> RelayOutcome {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RelayOutcome::new(RelayStatus::Disconnected, 0, String::new());
            }
            opened = tokio::time::timeout(
                self.idle_timeout,
                self.upstream
                    .stream_completion(&request.model, &request.messages, request.params),
            ) => opened,
        };

        let fragments = match opened {
            Ok(Ok(fragments)) => fragments,
            Ok(Err(e)) => return fail(&tx, &cancel, e.to_string(), 0, String::new()).await,
            Err(_) => {
                return fail(&tx, &cancel, idle_message(self.idle_timeout), 0, String::new()).await
            }
        };

        let outcome = pump_fragments(fragments, &tx, &cancel, self.idle_timeout).await;
        if outcome.status == RelayStatus::Disconnected {
            tracing::info!(
                model = %request.model,
                fragments = outcome.fragments,
                "Client disconnected, upstream stream released"
            );
        }
        outcome
    }

    /// Run one non-streaming upstream call.
    pub async fn complete(&self, request: &RelayRequest) -> Result<String> {
        self.upstream
            .complete(&request.model, &request.messages, request.params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fragments(items: Vec<Result<String>>) -> FragmentStream {
        Box::pin(futures::stream::iter(items))
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Pump into a roomy channel and collect what the client would see.
    async fn pump(items: Vec<Result<String>>) -> (RelayOutcome, Vec<StreamEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome = pump_fragments(fragments(items), &tx, &cancel, Duration::from_secs(5)).await;
        drop(tx);
        (outcome, drain(rx).await)
    }

    #[tokio::test]
    async fn test_fragments_forwarded_in_order_then_done() {
        let (outcome, events) = pump(vec![Ok("Hel".to_string()), Ok("lo".to_string())]).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hel".to_string()),
                StreamEvent::Content("lo".to_string()),
                StreamEvent::Done,
            ]
        );
        assert_eq!(outcome.status, RelayStatus::Completed);
        assert_eq!(outcome.fragments, 2);
        assert_eq!(outcome.assembled, "Hello");
        assert_eq!(outcome.output_chars(), 5);
    }

    #[tokio::test]
    async fn test_zero_fragments_still_terminates_once() {
        let (outcome, events) = pump(vec![]).await;
        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(outcome.status, RelayStatus::Completed);
        assert_eq!(outcome.fragments, 0);
    }

    #[tokio::test]
    async fn test_empty_fragments_not_forwarded() {
        let (outcome, events) = pump(vec![
            Ok(String::new()),
            Ok("a".to_string()),
            Ok(String::new()),
        ])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Content("a".to_string()), StreamEvent::Done]
        );
        assert_eq!(outcome.fragments, 1);
    }

    #[tokio::test]
    async fn test_error_mid_stream_is_terminal() {
        let (outcome, events) = pump(vec![
            Ok("partial".to_string()),
            Err(Error::UpstreamStream("overloaded".to_string())),
            Ok("never".to_string()),
        ])
        .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("partial".to_string()),
                StreamEvent::Error("Upstream stream error: overloaded".to_string()),
            ]
        );
        assert_eq!(outcome.status, RelayStatus::Failed);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Upstream stream error: overloaded")
        );
        assert_eq!(outcome.assembled, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_produces_error_event() {
        let stalled: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok("first".to_string())]).chain(futures::stream::pending()),
        );
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome = pump_fragments(stalled, &tx, &cancel, Duration::from_secs(60)).await;
        drop(tx);

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Content("first".to_string()));
        assert!(matches!(&events[1], StreamEvent::Error(m) if m.contains("60s")));
        assert_eq!(outcome.status, RelayStatus::Failed);
    }

    #[tokio::test]
    async fn test_receiver_dropped_reports_disconnect() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        drop(rx);
        let cancel = CancellationToken::new();
        let outcome = pump_fragments(
            fragments(vec![Ok("a".to_string()), Ok("b".to_string())]),
            &tx,
            &cancel,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome.status, RelayStatus::Disconnected);
        assert_eq!(outcome.fragments, 0);
    }

    /// Sets its flag when dropped.
    struct DropProbe(Arc<AtomicBool>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_cancellation_releases_upstream_stream() {
        let released = Arc::new(AtomicBool::new(false));
        let probe = DropProbe(released.clone());
        let upstream: FragmentStream = Box::pin(
            futures::stream::iter(vec![Ok("a".to_string())])
                .chain(futures::stream::pending())
                .map(move |item| {
                    let _ = &probe;
                    item
                }),
        );

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            pump_fragments(upstream, &tx, &task_cancel, Duration::from_secs(3600)).await
        });

        assert_eq!(rx.recv().await, Some(StreamEvent::Content("a".to_string())));
        assert!(!released.load(Ordering::SeqCst));

        // What the response body's drop guard does on client disconnect.
        drop(cancel.drop_guard());

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, RelayStatus::Disconnected);
        assert_eq!(outcome.fragments, 1);
        assert!(released.load(Ordering::SeqCst));
    }
}
