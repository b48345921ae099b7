//! Dual-mode observation of one deployment: a live subscription while it
//! runs, a static history snapshot otherwise.

use reqwest::Client;

use super::reconcile::LogReconciler;
use super::stream::{LogStream, StreamEvent};
use crate::api::deployments;
use crate::api::error::WatchError;
use crate::api::models::{DeploymentLogEntry, DeploymentStatus};

/// Invoked once when a live session ends, via the terminal signal or by
/// teardown. Callers use it to refresh the deployment's authoritative
/// metadata (final status, duration, error message), which the stream
/// itself does not carry.
pub type CompletionHook = Box<dyn FnOnce() + Send>;

/// Live half of a watch: the subscription plus the merged sequence built
/// from it and the not-yet-fired completion hook.
pub struct StreamSession {
    stream: LogStream,
    reconciler: LogReconciler,
    on_complete: Option<CompletionHook>,
}

/// Where a watch's entries come from.
///
/// A watch is live or historical for its whole lifetime. Keeping the two
/// as variants rather than flags means there is no state in which a
/// snapshot appears connected, and entries from a stale source cannot
/// bleed into the other.
pub enum LogSource {
    Live(StreamSession),
    Historical(Vec<DeploymentLogEntry>),
}

/// A change surfaced by [`DeploymentWatch::next_change`].
#[derive(Debug)]
pub enum WatchEvent {
    /// One step record was merged into the sequence, new or updated.
    Record(DeploymentLogEntry),
    /// The deployment reached a terminal status; the sequence is final.
    Finished,
}

/// Observation of one deployment.
///
/// The source is picked from the deployment's current status and whether
/// the caller wants live observation at all: a running job with `live`
/// requested gets a subscription feeding an identity-merged sequence,
/// everything else gets a one-shot history fetch. A failed history fetch
/// surfaces as an error with nothing constructed; retry is the caller
/// re-opening.
pub struct DeploymentWatch {
    deployment_id: u64,
    source: LogSource,
}

impl DeploymentWatch {
    pub async fn open(
        client: &Client,
        base_url: &str,
        token: &str,
        deployment_id: u64,
        status: &DeploymentStatus,
        live: bool,
        on_complete: Option<CompletionHook>,
    ) -> Result<DeploymentWatch, WatchError> {
        let source = if live && matches!(status, DeploymentStatus::Running) {
            let stream = LogStream::connect(client, base_url, token, deployment_id).await?;
            LogSource::Live(StreamSession {
                stream,
                reconciler: LogReconciler::new(),
                on_complete,
            })
        } else {
            // The hook is a live-session affair; a snapshot never fires it.
            let entries = deployments::logs(client, base_url, token, deployment_id).await?;
            LogSource::Historical(entries)
        };

        Ok(DeploymentWatch {
            deployment_id,
            source,
        })
    }

    /// Wait for the next change. Historical watches and finished or closed
    /// sessions return `Ok(None)` immediately.
    ///
    /// A transport error leaves the merged sequence intact; the caller
    /// decides between [`reconnect`](Self::reconnect) and falling back to
    /// snapshot fetches.
    pub async fn next_change(&mut self) -> Result<Option<WatchEvent>, WatchError> {
        let LogSource::Live(session) = &mut self.source else {
            return Ok(None);
        };

        match session.stream.next_event().await? {
            Some(StreamEvent::Log(entry)) => {
                session.reconciler.apply(entry.clone());
                Ok(Some(WatchEvent::Record(entry)))
            }
            Some(StreamEvent::Done) => {
                if let Some(hook) = session.on_complete.take() {
                    hook();
                }
                Ok(Some(WatchEvent::Finished))
            }
            None => Ok(None),
        }
    }

    /// Dial the subscription again after a transport error, keeping the
    /// merged sequence. Resent history folds into the existing entries by
    /// identity. Returns false without dialing when there is nothing to
    /// resume: historical watches and sessions already finished.
    pub async fn reconnect(
        &mut self,
        client: &Client,
        base_url: &str,
        token: &str,
    ) -> Result<bool, WatchError> {
        let deployment_id = self.deployment_id;
        let LogSource::Live(session) = &mut self.source else {
            return Ok(false);
        };
        if session.stream.is_done() {
            return Ok(false);
        }

        session.stream.close();
        session.stream = LogStream::connect(client, base_url, token, deployment_id).await?;
        Ok(true)
    }

    /// Tear down observation. On a live session that has not finished,
    /// this fires the completion hook; entries merged so far stay
    /// readable. Idempotent.
    pub fn close(&mut self) {
        if let LogSource::Live(session) = &mut self.source {
            session.stream.close();
            if let Some(hook) = session.on_complete.take() {
                hook();
            }
        }
    }

    /// The merged sequence (live) or the fetched snapshot (historical).
    pub fn entries(&self) -> &[DeploymentLogEntry] {
        match &self.source {
            LogSource::Live(session) => session.reconciler.entries(),
            LogSource::Historical(entries) => entries,
        }
    }

    /// Whether a live subscription currently holds its network handle.
    /// Always false for historical watches.
    pub fn connected(&self) -> bool {
        match &self.source {
            LogSource::Live(session) => session.stream.is_open(),
            LogSource::Historical(_) => false,
        }
    }

    /// Whether the sequence is final. True once a live session saw the
    /// terminal signal; historical snapshots are final by construction.
    /// Stays false for a session that merely lost its connection.
    pub fn is_done(&self) -> bool {
        match &self.source {
            LogSource::Live(session) => session.stream.is_done(),
            LogSource::Historical(_) => true,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.source, LogSource::Live(_))
    }

    pub fn deployment_id(&self) -> u64 {
        self.deployment_id
    }
}

impl Drop for DeploymentWatch {
    fn drop(&mut self) {
        self.close();
    }
}

/// Holder of the one active observation.
///
/// Opening through the slot always tears the previous watch down before
/// the new dial, so at most one live subscription exists at any instant
/// even when open requests arrive in quick succession or redirect to a
/// different deployment.
#[derive(Default)]
pub struct WatchSlot {
    active: Option<DeploymentWatch>,
}

impl WatchSlot {
    pub fn new() -> Self {
        WatchSlot::default()
    }

    /// Open observation for a deployment, replacing any prior one.
    pub async fn open(
        &mut self,
        client: &Client,
        base_url: &str,
        token: &str,
        deployment_id: u64,
        status: &DeploymentStatus,
        live: bool,
        on_complete: Option<CompletionHook>,
    ) -> Result<&mut DeploymentWatch, WatchError> {
        self.close();
        let watch = DeploymentWatch::open(
            client, base_url, token, deployment_id, status, live, on_complete,
        )
        .await?;
        Ok(self.active.insert(watch))
    }

    /// Tear down the active observation, if any. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut watch) = self.active.take() {
            watch.close();
        }
    }

    pub fn active(&mut self) -> Option<&mut DeploymentWatch> {
        self.active.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::response::Response;
    use axum::routing::get;
    use bytes::Bytes;

    use crate::api::models::StepStatus;

    fn sse_response(script: Vec<String>) -> Response {
        let body = Body::from_stream(async_stream::stream! {
            for chunk in script {
                yield Ok::<_, std::convert::Infallible>(Bytes::from(chunk));
            }
        });
        Response::builder()
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap()
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn log_frame(id: u64, step: i64, status: &str) -> String {
        format!(
            "event: log\ndata: {{\"id\":{},\"deployment_id\":1,\"step\":{},\"action\":\"step {}\",\"status\":\"{}\",\"output\":\"\",\"error_msg\":\"\",\"duration\":0,\"created_at\":\"t\"}}\n\n",
            id, step, step, status
        )
    }

    fn done_frame() -> String {
        "event: done\ndata: \n\n".to_string()
    }

    fn counting_hook(counter: &Arc<AtomicUsize>) -> CompletionHook {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_running_deployment_streams_and_finishes() {
        // One step goes running then success, then the job finishes.
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs/stream",
            get(|| async {
                sse_response(vec![
                    log_frame(1, 1, "running"),
                    log_frame(1, 1, "success"),
                    done_frame(),
                ])
            }),
        );
        let base = serve(app).await;

        let completions = Arc::new(AtomicUsize::new(0));
        let mut watch = DeploymentWatch::open(
            &Client::new(),
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            Some(counting_hook(&completions)),
        )
        .await
        .unwrap();

        assert!(watch.connected());
        assert!(watch.is_live());
        assert!(!watch.is_done());

        assert!(matches!(
            watch.next_change().await.unwrap(),
            Some(WatchEvent::Record(_))
        ));
        assert!(matches!(
            watch.next_change().await.unwrap(),
            Some(WatchEvent::Record(_))
        ));
        assert!(matches!(
            watch.next_change().await.unwrap(),
            Some(WatchEvent::Finished)
        ));

        assert_eq!(watch.entries().len(), 1);
        assert_eq!(watch.entries()[0].status, StepStatus::Success);
        assert!(!watch.connected());
        assert!(watch.is_done());
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // Finished means finished: no more changes, no second completion.
        assert!(watch.next_change().await.unwrap().is_none());
        watch.close();
        drop(watch);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finished_deployment_reads_history_without_streaming() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs",
            get(|| async {
                (
                    axum::http::StatusCode::OK,
                    r#"{"code":200,"message":"success","data":[{"id":1,"deployment_id":2,"step":1,"action":"backup","status":"success","output":"","error_msg":"","duration":10,"created_at":"t"},{"id":2,"deployment_id":2,"step":2,"action":"upload","status":"success","output":"","error_msg":"","duration":30,"created_at":"t"}],"timestamp":"t"}"#,
                )
            }),
        );
        let base = serve(app).await;

        let completions = Arc::new(AtomicUsize::new(0));
        let mut watch = DeploymentWatch::open(
            &Client::new(),
            &base,
            "tok",
            2,
            &DeploymentStatus::Success,
            true,
            Some(counting_hook(&completions)),
        )
        .await
        .unwrap();

        assert!(!watch.is_live());
        assert!(!watch.connected());
        assert!(watch.is_done());
        assert_eq!(watch.entries().len(), 2);
        assert!(watch.next_change().await.unwrap().is_none());

        watch.close();
        drop(watch);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_running_deployment_without_live_takes_snapshot() {
        // No stream route mounted: dialing one would fail the test.
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs",
            get(|| async {
                (
                    axum::http::StatusCode::OK,
                    r#"{"code":200,"message":"success","data":[{"id":1,"deployment_id":3,"step":1,"action":"backup","status":"running","output":"","error_msg":"","duration":0,"created_at":"t"}],"timestamp":"t"}"#,
                )
            }),
        );
        let base = serve(app).await;

        let watch = DeploymentWatch::open(
            &Client::new(),
            &base,
            "tok",
            3,
            &DeploymentStatus::Running,
            false,
            None,
        )
        .await
        .unwrap();

        assert!(!watch.is_live());
        assert!(!watch.connected());
        assert_eq!(watch.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_fires_completion_exactly_once() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs/stream",
            get(|| async { sse_response(vec![log_frame(1, 1, "running")]) }),
        );
        let base = serve(app).await;

        let completions = Arc::new(AtomicUsize::new(0));
        let mut watch = DeploymentWatch::open(
            &Client::new(),
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            Some(counting_hook(&completions)),
        )
        .await
        .unwrap();

        assert!(matches!(
            watch.next_change().await.unwrap(),
            Some(WatchEvent::Record(_))
        ));
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        watch.close();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(watch.entries().len(), 1);

        watch.close();
        drop(watch);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_entries_and_reconnect_dedupes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs/stream",
            get(move || {
                let calls = calls_in_handler.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // First attempt dies after one record, before done.
                        sse_response(vec![log_frame(1, 1, "running")])
                    } else {
                        // Resent history repeats step 1 under the same id.
                        sse_response(vec![
                            log_frame(1, 1, "success"),
                            log_frame(2, 2, "running"),
                            done_frame(),
                        ])
                    }
                }
            }),
        );
        let base = serve(app).await;
        let client = Client::new();

        let completions = Arc::new(AtomicUsize::new(0));
        let mut watch = DeploymentWatch::open(
            &client,
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            Some(counting_hook(&completions)),
        )
        .await
        .unwrap();

        assert!(matches!(
            watch.next_change().await.unwrap(),
            Some(WatchEvent::Record(_))
        ));
        let err = watch.next_change().await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::Stream(crate::api::error::StreamError::Interrupted)
        ));

        // Partial log survives the disconnect.
        assert_eq!(watch.entries().len(), 1);
        assert!(!watch.connected());
        assert!(!watch.is_done());

        assert!(watch.reconnect(&client, &base, "tok").await.unwrap());
        assert!(watch.connected());

        while let Some(event) = watch.next_change().await.unwrap() {
            if matches!(event, WatchEvent::Finished) {
                break;
            }
        }

        let entries = watch.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[0].status, StepStatus::Success);
        assert_eq!(entries[1].id, 2);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnect_refuses_when_nothing_to_resume() {
        let app = axum::Router::new()
            .route(
                "/api/v1/deployments/{id}/logs/stream",
                get(|| async { sse_response(vec![done_frame()]) }),
            )
            .route(
                "/api/v1/deployments/{id}/logs",
                get(|| async {
                    (
                        axum::http::StatusCode::OK,
                        r#"{"code":200,"message":"success","data":[],"timestamp":"t"}"#,
                    )
                }),
            );
        let base = serve(app).await;
        let client = Client::new();

        let mut live = DeploymentWatch::open(
            &client,
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            live.next_change().await.unwrap(),
            Some(WatchEvent::Finished)
        ));
        assert!(!live.reconnect(&client, &base, "tok").await.unwrap());

        let mut snapshot = DeploymentWatch::open(
            &client,
            &base,
            "tok",
            1,
            &DeploymentStatus::Failed,
            true,
            None,
        )
        .await
        .unwrap();
        assert!(!snapshot.reconnect(&client, &base, "tok").await.unwrap());
    }

    #[tokio::test]
    async fn test_slot_keeps_at_most_one_subscription() {
        struct Gauge(Arc<AtomicUsize>);
        impl Drop for Gauge {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let live_connections = Arc::new(AtomicUsize::new(0));
        let gauge_handle = live_connections.clone();
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs/stream",
            get(move || {
                let gauge = gauge_handle.clone();
                async move {
                    gauge.fetch_add(1, Ordering::SeqCst);
                    let guard = Gauge(gauge);
                    let body = Body::from_stream(async_stream::stream! {
                        let _guard = guard;
                        // Keep-alives force the server to notice a closed
                        // peer promptly.
                        loop {
                            yield Ok::<_, std::convert::Infallible>(Bytes::from(": keep-alive\n\n"));
                            tokio::time::sleep(Duration::from_millis(25)).await;
                        }
                    });
                    Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(body)
                        .unwrap()
                }
            }),
        );
        let base = serve(app).await;
        let client = Client::new();

        let mut slot = WatchSlot::new();
        slot.open(
            &client,
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            None,
        )
        .await
        .unwrap();
        assert_eq!(live_connections.load(Ordering::SeqCst), 1);

        // Rapid re-open for the same id must not stack subscriptions.
        slot.open(
            &client,
            &base,
            "tok",
            1,
            &DeploymentStatus::Running,
            true,
            None,
        )
        .await
        .unwrap();
        assert!(slot.active().is_some());

        let mut settled = 1;
        for _ in 0..40 {
            settled = live_connections.load(Ordering::SeqCst);
            if settled <= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(settled, 1);

        slot.close();
        slot.close();
        assert!(slot.active().is_none());
    }
}
