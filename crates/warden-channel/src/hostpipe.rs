//! Hostpipe transport: the QEMU guest-agent virtio-serial port, polled every
//! 200 ms with a fixed-size buffer. Replies are newline-framed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{Channel, ChannelKind, OnReceive, SupportProbe};

#[cfg(windows)]
pub const DEFAULT_DEVICE_PATH: &str = r"\\.\Global\org.qemu.guest_agent.0";
#[cfg(not(windows))]
pub const DEFAULT_DEVICE_PATH: &str = "/dev/virtio-ports/org.qemu.guest_agent.0";

const READ_BUFFER_SIZE: usize = 2048;

#[derive(Default)]
struct PipeState {
    working: bool,
    token: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

pub struct HostpipeChannel {
    device_path: PathBuf,
    poll_interval: Duration,
    hybrid: bool,
    on_receive: OnReceive,
    probe: Arc<dyn SupportProbe>,
    failure_tx: UnboundedSender<ChannelKind>,
    state: Arc<Mutex<PipeState>>,
}

impl HostpipeChannel {
    pub fn new(
        on_receive: OnReceive,
        probe: Arc<dyn SupportProbe>,
        failure_tx: UnboundedSender<ChannelKind>,
        hybrid: bool,
    ) -> Self {
        Self::with_device(
            Path::new(DEFAULT_DEVICE_PATH),
            Duration::from_millis(200),
            on_receive,
            probe,
            failure_tx,
            hybrid,
        )
    }

    pub fn with_device(
        device_path: &Path,
        poll_interval: Duration,
        on_receive: OnReceive,
        probe: Arc<dyn SupportProbe>,
        failure_tx: UnboundedSender<ChannelKind>,
        hybrid: bool,
    ) -> Self {
        Self {
            device_path: device_path.to_path_buf(),
            poll_interval,
            hybrid,
            on_receive,
            probe,
            failure_tx,
            state: Arc::new(Mutex::new(PipeState::default())),
        }
    }

    async fn start_reader(&self) -> anyhow::Result<()> {
        let mut device = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_path)
            .await
            .map_err(|err| {
                error!(path = %self.device_path.display(), error = %err, "failed to open hostpipe device");
                anyhow::anyhow!("open {} failed: {err}", self.device_path.display())
            })?;
        info!(path = %self.device_path.display(), "hostpipe device opened");

        let token = CancellationToken::new();
        let reader_token = token.clone();
        let on_receive = self.on_receive.clone();
        let failure_tx = self.failure_tx.clone();
        let state = self.state.clone();
        let poll_interval = self.poll_interval;

        let reader = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => return,
                    _ = ticker.tick() => {
                        let n = match device.read(&mut buf).await {
                            Ok(n) => n,
                            Err(err) => {
                                warn!(error = %err, "hostpipe read error");
                                continue;
                            }
                        };
                        if n == 0 {
                            continue;
                        }
                        let payload = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let Some(reply) = on_receive(payload, ChannelKind::Hostpipe) else {
                            continue;
                        };
                        if reply.is_empty() {
                            continue;
                        }
                        let framed = format!("{reply}\n");
                        if let Err(err) = device.write_all(framed.as_bytes()).await {
                            error!(error = %err, "hostpipe write error, requesting channel switch");
                            state.lock().expect("hostpipe state poisoned").working = false;
                            let _ = failure_tx.send(ChannelKind::Hostpipe);
                            return;
                        }
                    }
                }
            }
        });

        let mut state = self.state.lock().expect("hostpipe state poisoned");
        state.token = token;
        state.reader = Some(reader);
        state.working = true;
        Ok(())
    }
}

#[async_trait]
impl Channel for HostpipeChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Hostpipe
    }

    fn is_working(&self) -> bool {
        self.state.lock().expect("hostpipe state poisoned").working
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.is_working() {
            return Ok(());
        }
        self.start_reader().await
    }

    async fn stop(&self) {
        let reader = {
            let mut state = self.state.lock().expect("hostpipe state poisoned");
            state.token.cancel();
            state.reader.take()
        };
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.state.lock().expect("hostpipe state poisoned").working = false;
    }

    async fn is_supported(&self) -> bool {
        if self.hybrid {
            return false;
        }
        if !self.is_working() && self.start().await.is_err() {
            return false;
        }
        self.probe.gshell_supported().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct AlwaysSupported;

    #[async_trait]
    impl SupportProbe for AlwaysSupported {
        async fn gshell_supported(&self) -> bool {
            true
        }
    }

    fn recording_callback() -> (OnReceive, Arc<StdMutex<Vec<String>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let log = received.clone();
        // only kick payloads are acknowledged; the test device is a plain
        // file, so the reader sees its own reply bytes on later polls
        let callback: OnReceive = Arc::new(move |payload, kind| {
            assert_eq!(kind, ChannelKind::Hostpipe);
            let is_kick = payload.starts_with("kick");
            log.lock().expect("callback log").push(payload);
            is_kick.then(|| "ack".to_string())
        });
        (callback, received)
    }

    #[tokio::test]
    async fn reads_payload_and_writes_framed_reply() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let device = tmp.path().join("pipe");
        std::fs::write(&device, b"kick-t1").expect("seed device");

        let (callback, received) = recording_callback();
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        let channel = HostpipeChannel::with_device(
            &device,
            Duration::from_millis(10),
            callback,
            Arc::new(AlwaysSupported),
            failure_tx,
            false,
        );

        channel.start().await.expect("start channel");
        assert!(channel.is_working());

        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.stop().await;
        assert!(!channel.is_working());

        let payloads = received.lock().expect("log").clone();
        assert_eq!(payloads.first().map(String::as_str), Some("kick-t1"));
        let on_disk = std::fs::read_to_string(&device).expect("read device");
        assert!(on_disk.ends_with("ack\n"), "device contents: {on_disk:?}");
    }

    #[tokio::test]
    async fn start_fails_when_device_is_absent() {
        let (callback, _) = recording_callback();
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        let channel = HostpipeChannel::with_device(
            Path::new("/definitely/not/a/device"),
            Duration::from_millis(10),
            callback,
            Arc::new(AlwaysSupported),
            failure_tx,
            false,
        );
        assert!(channel.start().await.is_err());
        assert!(!channel.is_working());
    }

    #[tokio::test]
    async fn hybrid_mode_is_never_supported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let device = tmp.path().join("pipe");
        std::fs::write(&device, b"").expect("seed device");

        let (callback, _) = recording_callback();
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        let channel = HostpipeChannel::with_device(
            &device,
            Duration::from_millis(10),
            callback,
            Arc::new(AlwaysSupported),
            failure_tx,
            true,
        );
        assert!(!channel.is_supported().await);
        assert!(!channel.is_working());
    }
}
