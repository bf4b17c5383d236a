#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use scan_relay::config::{PollSettings, Settings};
use scan_relay::engine::{CallKind, EngineLauncher, EngineProcess, EngineTransport, LaunchSpec};
use scan_relay::error::{EngineError, SpawnError, StoreError};
use scan_relay::ports::PortRange;
use scan_relay::store::SessionStore;
use scan_relay::types::{FullResults, ScanMode, SessionId, SessionState, SessionStatus};
use scan_relay::{ClientPool, JobMonitor};

/// Scripted reply for one engine call.
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Value),
    Fail,
}

/// In-process engine API shared by every client a [`MockLauncher`] creates.
#[derive(Debug, Default)]
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    rejected: Mutex<HashSet<String>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies for `op` (`component/name`), in order; the last one repeats.
    pub fn script(&self, op: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(op.to_string(), replies.into_iter().collect());
    }

    pub fn reject(&self, op: &str) {
        self.rejected.lock().unwrap().insert(op.to_string());
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn default_reply(op: &str, kind: CallKind) -> Value {
        match op {
            "spider/scan" | "ascan/scan" => json!({ "scan": "1" }),
            "spider/status" | "ascan/status" => json!({ "status": "0" }),
            "ajaxSpider/status" => json!({ "status": "running" }),
            "pscan/recordsToScan" => json!({ "recordsToScan": "0" }),
            "spider/results" => json!({ "results": ["http://t/a", "http://t/b", "http://t/c"] }),
            "ajaxSpider/results" => json!({ "results": [] }),
            "spider/fullResults" => json!({
                "fullResults": [
                    { "urlsInScope": [{ "url": "http://t/a" }] },
                    { "urlsOutOfScope": [] },
                    { "urlsIoError": [] }
                ]
            }),
            "ajaxSpider/fullResults" => json!({
                "fullResults": { "inScope": [{ "url": "http://t/" }], "outOfScope": [], "errors": [] }
            }),
            "core/alerts" => json!({ "alerts": [{ "alert": "X-Frame-Options Header Not Set" }] }),
            "alert/alertsByRisk" => json!({
                "alertsByRisk": [{ "Medium": [{ "X-Frame-Options Header Not Set": [{ "url": "http://t/" }] }] }]
            }),
            _ => match kind {
                CallKind::Action => json!({ "Result": "OK" }),
                CallKind::View => json!({}),
            },
        }
    }
}

#[async_trait]
impl EngineTransport for MockEngine {
    async fn request(
        &self,
        component: &str,
        kind: CallKind,
        name: &str,
        _params: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        let op = format!("{component}/{name}");
        self.calls.lock().unwrap().push(op.clone());

        if self.rejected.lock().unwrap().contains(&op) {
            return Ok(json!({ "Result": "FAIL" }));
        }
        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&op).and_then(|q| {
                if q.len() > 1 {
                    q.pop_front()
                } else {
                    q.front().cloned()
                }
            })
        };
        match scripted {
            Some(Reply::Body(v)) => Ok(v),
            Some(Reply::Fail) => Err(EngineError::Api {
                code: "500".into(),
                message: format!("scripted failure of {op}"),
            }),
            None => Ok(Self::default_reply(&op, kind)),
        }
    }
}

pub fn percent(p: u8) -> Reply {
    Reply::Body(json!({ "status": p.to_string() }))
}

pub fn crawl(state: &str) -> Reply {
    Reply::Body(json!({ "status": state }))
}

/// Launches nothing: every "process" is a detached handle backed by one [`MockEngine`].
#[derive(Debug)]
pub struct MockLauncher {
    pub engine: Arc<MockEngine>,
    launches: Mutex<Vec<LaunchSpec>>,
    delay: Duration,
    fail: bool,
}

impl MockLauncher {
    pub fn new(engine: Arc<MockEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            launches: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn slow(engine: Arc<MockEngine>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            engine,
            launches: Mutex::new(Vec::new()),
            delay,
            fail: false,
        })
    }

    pub fn failing(engine: Arc<MockEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            launches: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<EngineProcess, SpawnError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(SpawnError::ExitedEarly {
                kind: spec.kind.as_str(),
                code: Some(1),
            });
        }
        let port = spec.port;
        self.launches.lock().unwrap().push(spec);
        Ok(EngineProcess::detached(port))
    }

    fn connect(&self, _port: u16) -> Arc<dyn EngineTransport> {
        self.engine.clone()
    }
}

/// Records every status update and results document.
#[derive(Debug, Default)]
pub struct RecordingStore {
    statuses: Mutex<Vec<(SessionId, SessionStatus)>>,
    results: Mutex<Vec<(SessionId, ScanMode, FullResults)>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts calls but rejects every write.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        Ok(())
    }

    pub fn statuses(&self, session: SessionId) -> Vec<SessionStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == session)
            .map(|(_, st)| st.clone())
            .collect()
    }

    pub fn terminal_updates(&self, session: SessionId) -> usize {
        self.statuses(session)
            .iter()
            .filter(|s| s.state != SessionState::Running)
            .count()
    }

    pub fn last_status(&self, session: SessionId) -> Option<SessionStatus> {
        self.statuses(session).pop()
    }

    pub fn results_count(&self, session: SessionId) -> usize {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == session)
            .count()
    }
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn update_session_status(
        &self,
        session: SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.statuses.lock().unwrap().push((session, status));
        Ok(())
    }

    async fn create_full_results(
        &self,
        session: SessionId,
        mode: ScanMode,
        results: &FullResults,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.results
            .lock()
            .unwrap()
            .push((session, mode, results.clone()));
        Ok(())
    }
}

pub const TICK: Duration = Duration::from_secs(5);

pub fn test_settings() -> Settings {
    Settings::new()
        .with_ports(PortRange::new(9000, 9010).unwrap())
        .with_poll(PollSettings {
            delay: TICK,
            interval: TICK,
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        })
        .with_explore_settle(Duration::from_secs(1))
}

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub launcher: Arc<MockLauncher>,
    pub pool: Arc<ClientPool>,
    pub store: Arc<RecordingStore>,
    pub monitor: JobMonitor,
}

pub fn harness() -> Harness {
    harness_with_store(RecordingStore::new())
}

pub fn harness_with_store(store: Arc<RecordingStore>) -> Harness {
    let engine = MockEngine::new();
    let launcher = MockLauncher::new(engine.clone());
    let settings = test_settings();
    let pool = Arc::new(ClientPool::new(launcher.clone(), settings.ports));
    let monitor = JobMonitor::new(pool.clone(), store.clone(), settings);
    Harness {
        engine,
        launcher,
        pool,
        store,
        monitor,
    }
}
