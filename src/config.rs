//! Runtime settings for the engine supervisor, the poller and the monitor.

use std::path::PathBuf;
use std::time::Duration;

use crate::ports::PortRange;

/// Marker the engine prints once its API accepts requests.
pub const DEFAULT_READY_MARKER: &str = "is now listening on";

/// How to launch and reach engine processes.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Engine launcher script or binary.
    pub binary: PathBuf,
    /// API key passed to the engine and sent with every request.
    pub api_key: String,
    /// Root under which per-process session directories are created.
    pub session_root: PathBuf,
    /// Host the engine API listens on.
    pub host: String,
    pub ready_marker: String,
    pub request_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("engine/zap.sh"),
            api_key: String::new(),
            session_root: PathBuf::from("engine/sessions"),
            host: "127.0.0.1".into(),
            ready_marker: DEFAULT_READY_MARKER.into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Poll cadence and retry bounds for status streams.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay before the first query.
    pub delay: Duration,
    /// Period between queries.
    pub interval: Duration,
    /// Extra attempts per tick after the first query fails.
    pub max_retries: u32,
    /// Pause between attempts within one tick.
    pub retry_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            max_retries: 5,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub ports: PortRange,
    pub poll: PollSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Wait between starting the inner crawl and issuing the active scan.
    ///
    /// A heuristic: the crawl is not guaranteed to have produced traffic by then.
    pub explore_settle: Duration,
    /// Events retained per job for subscribers that fall behind.
    pub hub_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            explore_settle: Duration::from_secs(10),
            hub_capacity: 64,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_ports(mut self, ports: PortRange) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_explore_settle(mut self, settle: Duration) -> Self {
        self.monitor.explore_settle = settle;
        self
    }

    pub fn with_hub_capacity(mut self, capacity: usize) -> Self {
        self.monitor.hub_capacity = capacity.max(1);
        self
    }
}
