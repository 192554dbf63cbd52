use async_trait::async_trait;
use tracing::warn;

/// Exit code a task returns to request an instance poweroff after its
/// terminal report has been delivered.
pub const EXIT_CODE_POWEROFF: i32 = 3009;

/// Exit code a task returns to request an instance reboot.
pub const EXIT_CODE_REBOOT: i32 = 3010;

/// OS power actions triggered by the reserved exit codes. The production
/// binary wires the platform implementation; tests and defaults only log.
#[async_trait]
pub trait PowerAction: Send + Sync {
    async fn poweroff(&self);
    async fn reboot(&self);
}

pub struct LoggingPowerAction;

#[async_trait]
impl PowerAction for LoggingPowerAction {
    async fn poweroff(&self) {
        warn!("poweroff requested by task exit code, no platform handler wired");
    }

    async fn reboot(&self) {
        warn!("reboot requested by task exit code, no platform handler wired");
    }
}
