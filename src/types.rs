use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job id used by modes that run a single logical job per client.
pub const PLACEHOLDER_JOB_ID: &str = "0";

/// Opaque identifier of one engine client in the pool.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Reference to a scan-session record owned by the persistence layer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether a client is the long-lived shared instance or owned by one job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Shared,
    Exclusive,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientKind::Shared => "shared",
            ClientKind::Exclusive => "exclusive",
        }
    }
}

/// Identifies a running scan: the client it runs on and the engine's job id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub client_id: ClientId,
    pub job_id: String,
}

impl JobHandle {
    pub fn new(client_id: ClientId, job_id: impl Into<String>) -> Self {
        Self {
            client_id,
            job_id: job_id.into(),
        }
    }

    /// Handle for a mode that has exactly one job per client.
    pub fn single(client_id: ClientId) -> Self {
        Self::new(client_id, PLACEHOLDER_JOB_ID)
    }

    pub fn key(&self) -> MonitorKey {
        MonitorKey::of(self)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.job_id)
    }
}

/// SHA-512 digest of a [`JobHandle`], hex encoded. Equal handles give equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey(String);

impl MonitorKey {
    pub fn of(handle: &JobHandle) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(handle.client_id.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(handle.job_id.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Scan modes the engine supports.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Spider,
    BrowserCrawl,
    Passive,
    Active,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Spider => "spider",
            ScanMode::BrowserCrawl => "browser_crawl",
            ScanMode::Passive => "passive",
            ScanMode::Active => "active",
        }
    }

    /// Value replayed to subscribers that attach before the first poll tick.
    pub fn initial_snapshot(self) -> StatusSnapshot {
        match self {
            ScanMode::BrowserCrawl => StatusSnapshot::Crawl {
                state: CrawlState::Running,
            },
            ScanMode::Spider | ScanMode::Passive | ScanMode::Active => {
                StatusSnapshot::Progress { percent: 0 }
            }
        }
    }

    pub fn is_terminal(self, snapshot: &StatusSnapshot) -> bool {
        match (self, snapshot) {
            (ScanMode::Spider | ScanMode::Active, StatusSnapshot::Progress { percent }) => {
                *percent >= 100
            }
            (ScanMode::BrowserCrawl, StatusSnapshot::Crawl { state }) => {
                *state == CrawlState::Stopped
            }
            (ScanMode::Passive, StatusSnapshot::Explored { records_to_scan }) => {
                *records_to_scan == 0
            }
            _ => false,
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named state reported by the browser-driven crawler.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrawlState {
    Running,
    Stopped,
}

impl FromStr for CrawlState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CrawlState::Running),
            "stopped" => Ok(CrawlState::Stopped),
            other => Err(format!("unknown crawl state: {other}")),
        }
    }
}

/// One observation of a job's progress.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusSnapshot {
    /// Percentage reported by the spider and the active scanner.
    Progress { percent: u8 },
    /// State reported by the browser-driven crawler.
    Crawl { state: CrawlState },
    /// Passive queue length once the inner crawl has finished.
    Explored { records_to_scan: u64 },
}

/// Lifecycle state stored on a scan-session record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Successful,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionStatus {
    pub fn running() -> Self {
        Self {
            state: SessionState::Running,
            message: None,
        }
    }

    pub fn successful() -> Self {
        Self {
            state: SessionState::Successful,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: SessionState::Failed,
            message: Some(message.into()),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            state: SessionState::Cancelled,
            message: Some(message.into()),
        }
    }
}

/// Risk buckets used by the engine's alert summary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
    Informational,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" => Ok(RiskLevel::High),
            "Medium" => Ok(RiskLevel::Medium),
            "Low" => Ok(RiskLevel::Low),
            "Informational" => Ok(RiskLevel::Informational),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Alerts of one kind within a risk bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RiskGroup {
    pub key: String,
    pub value: Vec<Value>,
}

pub type AlertsByRisk = BTreeMap<RiskLevel, Vec<RiskGroup>>;

/// Complete result set fetched from the engine when a job finishes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FullResults {
    Spider {
        urls_in_scope: Vec<Value>,
        urls_out_of_scope: Vec<Value>,
        urls_io_error: Vec<Value>,
    },
    BrowserCrawl {
        in_scope: Vec<Value>,
        out_of_scope: Vec<Value>,
        errors: Vec<Value>,
    },
    Alerts {
        alerts: Vec<Value>,
        alerts_by_risk: AlertsByRisk,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_handles_share_a_key() {
        let client = ClientId::new();
        let a = JobHandle::new(client, "3");
        let b = JobHandle::new(client, String::from("3"));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), JobHandle::new(client, "4").key());
        assert_eq!(a.key().as_str().len(), 128);
    }

    #[test]
    fn key_separates_client_and_job() {
        let client = ClientId::new();
        let other = ClientId::new();
        assert_ne!(JobHandle::single(client).key(), JobHandle::single(other).key());
    }

    #[test]
    fn terminal_predicates_per_mode() {
        let done = StatusSnapshot::Progress { percent: 100 };
        let half = StatusSnapshot::Progress { percent: 50 };
        assert!(ScanMode::Spider.is_terminal(&done));
        assert!(ScanMode::Active.is_terminal(&done));
        assert!(!ScanMode::Spider.is_terminal(&half));
        // a finished inner crawl is not the end of a passive scan
        assert!(!ScanMode::Passive.is_terminal(&done));
        assert!(ScanMode::Passive.is_terminal(&StatusSnapshot::Explored { records_to_scan: 0 }));
        assert!(!ScanMode::Passive.is_terminal(&StatusSnapshot::Explored { records_to_scan: 7 }));
        assert!(ScanMode::BrowserCrawl.is_terminal(&StatusSnapshot::Crawl {
            state: CrawlState::Stopped
        }));
        assert!(!ScanMode::BrowserCrawl.is_terminal(&ScanMode::BrowserCrawl.initial_snapshot()));
    }

    #[test]
    fn snapshot_serializes_with_kind_tag() {
        let json = serde_json::to_value(StatusSnapshot::Crawl {
            state: CrawlState::Running,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"kind": "crawl", "state": "running"}));
    }
}
