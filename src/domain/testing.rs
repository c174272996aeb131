//! In-memory collaborators for exercising the engine and the webhook dispatcher.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::Utc;

use super::{
    error::EngineError,
    model::{PortMapping, Workload},
    port::{ContainerEngine, SourceFetcher},
};

#[derive(Clone, Copy, Debug)]
pub enum Failure {
    PortConflict,
    Other,
}

#[derive(Default)]
struct EngineState {
    workloads: BTreeMap<String, Workload>,
    calls: Vec<String>,
    next_id: usize,
    build_fails: bool,
    build_delay: Option<Duration>,
    create_failures: VecDeque<Failure>,
    start_failures: VecDeque<Failure>,
    stop_failures: VecDeque<Failure>,
    remove_failures: VecDeque<Failure>,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn workload(&self, id: &str) -> Option<Workload> {
        self.state.lock().unwrap().workloads.get(id).cloned()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.state.lock().unwrap().workloads.values().cloned().collect()
    }

    pub fn insert_running(&self, id: &str, host_ports: &[u16]) {
        let workload = Workload {
            id: id.to_string(),
            name: id.to_string(),
            image: "external:latest".to_string(),
            state: "running".to_string(),
            status: "Up".to_string(),
            created_at: Some(Utc::now()),
            started_at: Some(Utc::now()),
            ports: host_ports.iter().map(|port| PortMapping::tcp(*port, 80)).collect(),
            environment: HashMap::new(),
        };
        self.state
            .lock()
            .unwrap()
            .workloads
            .insert(id.to_string(), workload);
    }

    /// Drops a workload behind the core's back.
    pub fn forget(&self, id: &str) {
        self.state.lock().unwrap().workloads.remove(id);
    }

    pub fn fail_builds(&self) {
        self.state.lock().unwrap().build_fails = true;
    }

    pub fn delay_builds(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = Some(delay);
    }

    pub fn fail_next_create(&self, failure: Failure) {
        self.state.lock().unwrap().create_failures.push_back(failure);
    }

    pub fn fail_next_start(&self, failure: Failure) {
        self.state.lock().unwrap().start_failures.push_back(failure);
    }

    pub fn fail_next_stop(&self, failure: Failure) {
        self.state.lock().unwrap().stop_failures.push_back(failure);
    }

    pub fn fail_next_remove(&self, failure: Failure) {
        self.state.lock().unwrap().remove_failures.push_back(failure);
    }
}

fn engine_error(failure: Failure, port: u16) -> EngineError {
    match failure {
        Failure::PortConflict => EngineError::PortConflict(port),
        Failure::Other => EngineError::Other(anyhow!("injected engine failure")),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_workloads(&self) -> Result<Vec<Workload>, Error> {
        Ok(self.workloads())
    }

    async fn inspect_workload(&self, id: &str) -> Result<Option<Workload>, Error> {
        Ok(self.workload(id))
    }

    async fn build_image(
        &self,
        context: &Path,
        build_file: &str,
        image_tag: &str,
    ) -> Result<String, Error> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("build:{}", image_tag));
            if state.build_fails {
                return Err(anyhow!("injected build failure"));
            }
            state.build_delay
        };
        if !context.join(build_file).exists() {
            return Err(anyhow!("{} missing from build context", build_file));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(image_tag.to_string())
    }

    async fn create_workload(
        &self,
        image: &str,
        name: &str,
        port_mappings: &[PortMapping],
        environment: &HashMap<String, String>,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.create_failures.pop_front() {
            state.calls.push("create:failed".to_string());
            return Err(engine_error(failure, port_mappings[0].host_port));
        }
        state.next_id += 1;
        let id = format!("w{}", state.next_id);
        state.calls.push(format!("create:{}", id));
        state.workloads.insert(
            id.clone(),
            Workload {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                state: "created".to_string(),
                status: "Created".to_string(),
                created_at: Some(Utc::now()),
                started_at: None,
                ports: port_mappings.to_vec(),
                environment: environment.clone(),
            },
        );
        Ok(id)
    }

    async fn start_workload(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start:{}", id));
        if let Some(failure) = state.start_failures.pop_front() {
            let port = state
                .workloads
                .get(id)
                .and_then(|workload| workload.ports.first())
                .map(|mapping| mapping.host_port)
                .unwrap_or_default();
            return Err(engine_error(failure, port));
        }
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        workload.state = "running".to_string();
        workload.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop_workload(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop:{}", id));
        if let Some(failure) = state.stop_failures.pop_front() {
            return Err(engine_error(failure, 0));
        }
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        workload.state = "exited".to_string();
        Ok(())
    }

    async fn remove_workload(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{}", id));
        if let Some(failure) = state.remove_failures.pop_front() {
            return Err(engine_error(failure, 0));
        }
        state
            .workloads
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn fetch_logs(&self, id: &str, tail_lines: usize) -> Result<String, Error> {
        self.workload(id)
            .map(|_| format!("last {} lines of {}", tail_lines, id))
            .ok_or_else(|| anyhow!("no such workload {}", id))
    }
}

pub struct FakeFetcher {
    root: tempfile::TempDir,
    with_descriptor: bool,
    fails: bool,
    delay: Option<Duration>,
    fetched: Mutex<Vec<(String, String)>>,
    cleaned: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            with_descriptor: true,
            fails: false,
            delay: None,
            fetched: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn without_descriptor(self) -> Self {
        Self {
            with_descriptor: false,
            ..self
        }
    }

    pub fn failing(self) -> Self {
        Self { fails: true, ..self }
    }

    pub fn slow(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// `(repository, branch)` pairs fetched so far.
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn cleaned(&self) -> Vec<PathBuf> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch_source(&self, repository_url: &str, branch: &str) -> Result<PathBuf, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fails {
            return Err(anyhow!("injected clone failure for {}", repository_url));
        }
        let checkout = {
            let mut fetched = self.fetched.lock().unwrap();
            fetched.push((repository_url.to_string(), branch.to_string()));
            self.root.path().join(format!("checkout-{}", fetched.len()))
        };
        std::fs::create_dir_all(&checkout)?;
        if self.with_descriptor {
            std::fs::write(checkout.join("Dockerfile"), "FROM scratch\n")?;
        }
        Ok(checkout)
    }

    async fn locate_build_descriptor(&self, checkout: &Path) -> Result<Option<PathBuf>, Error> {
        let candidate = checkout.join("Dockerfile");
        Ok(candidate.is_file().then_some(candidate))
    }

    async fn latest_revision(&self, _checkout: &Path) -> Result<String, Error> {
        Ok(format!("rev-{}", self.fetched.lock().unwrap().len()))
    }

    async fn cleanup(&self, checkout: &Path) {
        let _ = std::fs::remove_dir_all(checkout);
        self.cleaned.lock().unwrap().push(checkout.to_path_buf());
    }
}
