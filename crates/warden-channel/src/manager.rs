//! Channel selection and failover.
//!
//! At most one transport is current. `switch_channel` stops the failing
//! transport, tries any other viable one, and falls back to retrying the
//! whole roster on a fixed budget. Every outcome emits exactly one report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{Channel, ChannelKind, ChannelReporter};

const SWITCH_REPORT_TYPE: &str = "switch_channel_in_gshell";
const SWITCH_RETRY_BUDGET: u32 = 5;

pub struct ChannelManager {
    channels: Mutex<Vec<Arc<dyn Channel>>>,
    current: Mutex<ChannelKind>,
    select_lock: tokio::sync::Mutex<()>,
    reporter: Arc<dyn ChannelReporter>,
    switch_pause: Duration,
    retry_pause: Duration,
}

impl ChannelManager {
    pub fn new(reporter: Arc<dyn ChannelReporter>) -> Self {
        Self::with_pauses(reporter, Duration::from_secs(1), Duration::from_secs(5))
    }

    pub fn with_pauses(
        reporter: Arc<dyn ChannelReporter>,
        switch_pause: Duration,
        retry_pause: Duration,
    ) -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            current: Mutex::new(ChannelKind::None),
            select_lock: tokio::sync::Mutex::new(()),
            reporter,
            switch_pause,
            retry_pause,
        }
    }

    /// Register a transport; registration order is selection preference.
    pub fn register(&self, channel: Arc<dyn Channel>) {
        self.channels.lock().expect("channel roster poisoned").push(channel);
    }

    pub fn current_kind(&self) -> ChannelKind {
        *self.current.lock().expect("current channel poisoned")
    }

    fn roster(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.lock().expect("channel roster poisoned").clone()
    }

    fn channel_of(&self, kind: ChannelKind) -> Option<Arc<dyn Channel>> {
        self.roster().into_iter().find(|ch| ch.kind() == kind)
    }

    /// Pick any viable transport other than `exclude` and make it current.
    /// Concurrent callers are serialised, so starts are not duplicated.
    pub async fn select_available_channel(
        &self,
        exclude: ChannelKind,
    ) -> anyhow::Result<ChannelKind> {
        let _selecting = self.select_lock.lock().await;

        for channel in self.roster() {
            let kind = channel.kind();
            if kind == exclude {
                continue;
            }
            if !channel.is_supported().await {
                continue;
            }
            if let Err(err) = channel.start().await {
                warn!(channel = kind.as_str(), error = %err, "failed to start channel");
                continue;
            }

            let previous = {
                let mut current = self.current.lock().expect("current channel poisoned");
                let previous = *current;
                *current = kind;
                previous
            };
            if previous != ChannelKind::None && previous != kind {
                if let Some(old) = self.channel_of(previous) {
                    old.stop().await;
                }
            }
            info!(channel = kind.as_str(), "channel selected");
            return Ok(kind);
        }
        anyhow::bail!("no available channel")
    }

    /// Stop the failed transport and move to another one. Returns the new
    /// current kind, or an error once the retry budget is spent. Exactly one
    /// report is emitted either way.
    pub async fn switch_channel(&self, from: ChannelKind) -> anyhow::Result<ChannelKind> {
        if let Some(failing) = self.channel_of(from) {
            failing.stop().await;
        }
        *self.current.lock().expect("current channel poisoned") = ChannelKind::None;
        tokio::time::sleep(self.switch_pause).await;

        if let Ok(kind) = self.select_available_channel(from).await {
            self.report_switch_success(kind).await;
            return Ok(kind);
        }

        for _ in 0..SWITCH_RETRY_BUDGET {
            if let Ok(kind) = self.select_available_channel(ChannelKind::None).await {
                self.report_switch_success(kind).await;
                return Ok(kind);
            }
            tokio::time::sleep(self.retry_pause).await;
        }

        self.reporter
            .report(SWITCH_REPORT_TYPE, "fail: no available channel")
            .await;
        anyhow::bail!("no available channel")
    }

    async fn report_switch_success(&self, kind: ChannelKind) {
        self.reporter
            .report(
                SWITCH_REPORT_TYPE,
                &format!("success: current channel is {}", kind.as_str()),
            )
            .await;
    }

    /// Consume transport failure signals and run the switch procedure for
    /// each.
    pub fn spawn_failure_listener(
        self: &Arc<Self>,
        mut failures: UnboundedReceiver<ChannelKind>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(failed) = failures.recv().await {
                warn!(channel = failed.as_str(), "transport failure, switching channel");
                if let Err(err) = manager.switch_channel(failed).await {
                    error!(error = %err, "channel switch exhausted its retry budget");
                }
            }
        })
    }

    pub async fn stop_all(&self) {
        for channel in self.roster() {
            channel.stop().await;
        }
        *self.current.lock().expect("current channel poisoned") = ChannelKind::None;
    }
}
