//! Transport supervisor for control-plane "kick" notifications.
//!
//! A kick can arrive over an HTTP long-poll or over the host-guest serial
//! pipe (hostpipe); at most one transport is current at a time. The
//! [`manager::ChannelManager`] selects a viable transport and fails over to
//! another when the current one breaks.

pub mod hostpipe;
pub mod http;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;

pub use hostpipe::HostpipeChannel;
pub use http::HttpChannel;
pub use manager::ChannelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Http,
    Hostpipe,
    None,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Http => "http",
            ChannelKind::Hostpipe => "hostpipe",
            ChannelKind::None => "none",
        }
    }
}

/// Callback invoked with each received payload; a returned string is written
/// back on the same transport as the reply.
pub type OnReceive = Arc<dyn Fn(String, ChannelKind) -> Option<String> + Send + Sync>;

#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// True iff the background reader is live and owns the transport handle.
    fn is_working(&self) -> bool;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);

    /// Whether this transport can work on this instance right now; may start
    /// the transport as part of probing.
    async fn is_supported(&self) -> bool;
}

/// Sink for channel lifecycle reports (switch outcomes, transport failures).
#[async_trait]
pub trait ChannelReporter: Send + Sync {
    async fn report(&self, report_type: &str, info: &str);
}

/// Control-plane probe asked whether the hostpipe protocol is supported.
#[async_trait]
pub trait SupportProbe: Send + Sync {
    async fn gshell_supported(&self) -> bool;
}
