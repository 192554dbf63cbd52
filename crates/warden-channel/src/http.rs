//! HTTP long-poll transport: the agent parks a request on the kick endpoint
//! and treats each non-empty response body as a kick payload.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Channel, ChannelKind, OnReceive};

const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Default)]
struct LoopState {
    working: bool,
    token: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

pub struct HttpChannel {
    endpoint: String,
    client: reqwest::Client,
    on_receive: OnReceive,
    failure_tx: UnboundedSender<ChannelKind>,
    error_pause: Duration,
    state: Arc<Mutex<LoopState>>,
}

impl HttpChannel {
    pub fn new(
        endpoint: String,
        on_receive: OnReceive,
        failure_tx: UnboundedSender<ChannelKind>,
    ) -> Self {
        Self::with_error_pause(endpoint, on_receive, failure_tx, Duration::from_secs(2))
    }

    pub fn with_error_pause(
        endpoint: String,
        on_receive: OnReceive,
        failure_tx: UnboundedSender<ChannelKind>,
        error_pause: Duration,
    ) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::builder()
                .timeout(LONG_POLL_TIMEOUT)
                .build()
                .expect("failed to build http client"),
            on_receive,
            failure_tx,
            error_pause,
            state: Arc::new(Mutex::new(LoopState::default())),
        }
    }
}

#[async_trait]
impl Channel for HttpChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Http
    }

    fn is_working(&self) -> bool {
        self.state.lock().expect("http channel state poisoned").working
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.is_working() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let poller_token = token.clone();
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let on_receive = self.on_receive.clone();
        let failure_tx = self.failure_tx.clone();
        let error_pause = self.error_pause;
        let state = self.state.clone();

        let poller = tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                let round = tokio::select! {
                    _ = poller_token.cancelled() => return,
                    round = client.post(&endpoint).send() => round,
                };
                match round {
                    Ok(response) if response.status().is_success() => {
                        consecutive_failures = 0;
                        let body = response.text().await.unwrap_or_default();
                        if !body.is_empty() {
                            // long-poll replies are out-of-band, nothing is
                            // written back
                            let _ = on_receive(body, ChannelKind::Http);
                        }
                    }
                    Ok(response) => {
                        consecutive_failures += 1;
                        warn!(status = %response.status(), "kick long-poll returned error status");
                    }
                    Err(err) if err.is_timeout() => {
                        // an idle long-poll round, park again
                        consecutive_failures = 0;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(error = %err, "kick long-poll failed");
                    }
                }

                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("http channel degraded, requesting channel switch");
                    state.lock().expect("http channel state poisoned").working = false;
                    let _ = failure_tx.send(ChannelKind::Http);
                    return;
                }
                if consecutive_failures > 0 {
                    tokio::select! {
                        _ = poller_token.cancelled() => return,
                        _ = tokio::time::sleep(error_pause) => {}
                    }
                }
            }
        });

        let mut state = self.state.lock().expect("http channel state poisoned");
        state.token = token;
        state.poller = Some(poller);
        state.working = true;
        info!(endpoint = %self.endpoint, "http kick channel started");
        Ok(())
    }

    async fn stop(&self) {
        let poller = {
            let mut state = self.state.lock().expect("http channel state poisoned");
            state.token.cancel();
            state.poller.take()
        };
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        self.state.lock().expect("http channel state poisoned").working = false;
    }

    async fn is_supported(&self) -> bool {
        let probe = self
            .client
            .post(&self.endpoint)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            // a held long-poll means the endpoint is alive
            Err(err) => err.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::routing::post;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn spawn_kick_server(payloads: Arc<AtomicU32>) -> String {
        let app = Router::new().route(
            "/kick",
            post(move || {
                let payloads = payloads.clone();
                async move {
                    if payloads.fetch_sub(1, Ordering::SeqCst) > 0 {
                        "kick-payload".to_string()
                    } else {
                        payloads.store(0, Ordering::SeqCst);
                        String::new()
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/kick")
    }

    #[tokio::test]
    async fn delivers_long_poll_payloads() {
        let endpoint = spawn_kick_server(Arc::new(AtomicU32::new(1))).await;

        let received = Arc::new(StdMutex::new(Vec::new()));
        let log = received.clone();
        let on_receive: OnReceive = Arc::new(move |payload, kind| {
            assert_eq!(kind, ChannelKind::Http);
            log.lock().expect("log").push(payload);
            None
        });
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();

        let channel = HttpChannel::new(endpoint, on_receive, failure_tx);
        assert!(channel.is_supported().await);
        channel.start().await.expect("start");
        assert!(channel.is_working());

        tokio::time::sleep(Duration::from_millis(200)).await;
        channel.stop().await;
        assert!(!channel.is_working());
        assert!(
            received
                .lock()
                .expect("log")
                .contains(&"kick-payload".to_string())
        );
    }

    #[tokio::test]
    async fn repeated_failures_request_a_switch() {
        // nothing is listening on this endpoint
        let endpoint = "http://127.0.0.1:9/kick".to_string();
        let on_receive: OnReceive = Arc::new(|_, _| None);
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        let channel = HttpChannel::with_error_pause(
            endpoint,
            on_receive,
            failure_tx,
            Duration::from_millis(10),
        );
        channel.start().await.expect("start");

        let failed = tokio::time::timeout(Duration::from_secs(5), failure_rx.recv())
            .await
            .expect("failure signal in time");
        assert_eq!(failed, Some(ChannelKind::Http));
        assert!(!channel.is_working());
    }
}
