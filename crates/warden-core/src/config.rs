use std::path::PathBuf;

/// Agent configuration; every knob can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. "http://100.100.100.200".
    pub server_url: String,

    /// Directory where task scripts are materialised.
    pub script_dir: PathBuf,

    /// Instance registered in hybrid (non-native) mode; disables the
    /// hostpipe transport.
    pub hybrid: bool,

    /// Fetch fair-lock acquisition timeout in milliseconds.
    pub fetch_lock_timeout_ms: u64,

    /// Extra attempts for failed control-plane posts.
    pub http_retry_attempts: u32,

    /// Pause between control-plane retries in milliseconds.
    pub http_retry_pause_ms: u64,

    /// Pause before the single re-fetch when a kick returned nothing.
    pub kick_retry_pause_ms: u64,

    /// Hostpipe device poll interval in milliseconds.
    pub hostpipe_poll_ms: u64,

    /// Concurrency bound of the task run pool.
    pub run_pool_size: usize,

    /// Concurrency bound of the pre-check pool for test tasks.
    pub precheck_pool_size: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: std::env::var("WARDEN_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8089".to_string()),
            script_dir: std::env::var("WARDEN_SCRIPT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("warden-scripts")),
            hybrid: env_or("WARDEN_HYBRID", false),
            fetch_lock_timeout_ms: env_or("WARDEN_FETCH_LOCK_TIMEOUT_MS", 2_000),
            http_retry_attempts: env_or("WARDEN_HTTP_RETRY_ATTEMPTS", 3),
            http_retry_pause_ms: env_or("WARDEN_HTTP_RETRY_PAUSE_MS", 2_000),
            kick_retry_pause_ms: env_or("WARDEN_KICK_RETRY_PAUSE_MS", 3_000),
            hostpipe_poll_ms: env_or("WARDEN_HOSTPIPE_POLL_MS", 200),
            run_pool_size: env_or("WARDEN_RUN_POOL_SIZE", 10),
            precheck_pool_size: env_or("WARDEN_PRECHECK_POOL_SIZE", 4),
        }
    }
}
