//! In-memory catalog of deployments.
//!
//! Records live behind a single `RwLock` and are handed out as clones, so a
//! reader always sees a whole record. Redeploys of one deployment id are
//! serialized through a per-id async mutex obtained with [`DeploymentRegistry::lock`].
//! A mutex only stays in the registry while someone holds or awaits it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use super::model::{Deployment, Launch};

#[derive(Default)]
pub struct DeploymentRegistry {
    deployments: RwLock<HashMap<String, Deployment>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, deployment: Deployment) {
        self.deployments
            .write()
            .await
            .insert(deployment.id.clone(), deployment);
    }

    pub async fn get(&self, id: &str) -> Option<Deployment> {
        self.deployments.read().await.get(id).cloned()
    }

    /// All deployments, oldest first.
    pub async fn list_all(&self) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> =
            self.deployments.read().await.values().cloned().collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        deployments
    }

    /// Auto-deploy deployments tracking `repository_url`, compared after normalisation.
    pub async fn find_by_repository(&self, repository_url: &str) -> Vec<Deployment> {
        let wanted = normalize_repository_url(repository_url);
        let mut matches: Vec<Deployment> = self
            .deployments
            .read()
            .await
            .values()
            .filter(|deployment| deployment.auto_deploy)
            .filter(|deployment| normalize_repository_url(&deployment.source_repository) == wanted)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matches
    }

    pub async fn find_by_workload(&self, workload_id: &str) -> Option<Deployment> {
        self.deployments
            .read()
            .await
            .values()
            .find(|deployment| deployment.workload_id.as_deref() == Some(workload_id))
            .cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Deployment> {
        self.deployments.write().await.remove(id)
    }

    /// Points the record at its new workload. Returns `false` if the id is unknown.
    pub async fn update_after_redeploy(
        &self,
        id: &str,
        launch: Launch,
        deployed_at: DateTime<Utc>,
    ) -> bool {
        match self.deployments.write().await.get_mut(id) {
            Some(deployment) => {
                deployment.workload_id = Some(launch.workload_id);
                deployment.port_mappings = launch.port_mappings;
                deployment.build_file_path = Some(launch.build_file_path);
                deployment.last_revision = Some(launch.revision);
                deployment.last_deployed_at = deployed_at;
                true
            }
            None => false,
        }
    }

    /// Detaches the record from its workload, e.g. once that workload has been removed.
    pub async fn clear_workload(&self, id: &str) -> bool {
        match self.deployments.write().await.get_mut(id) {
            Some(deployment) => {
                deployment.workload_id = None;
                deployment.port_mappings.clear();
                true
            }
            None => false,
        }
    }

    /// Waits for exclusive redeploy rights on `id`.
    pub async fn lock(&self, id: &str) -> DeploymentLock<'_> {
        let lock = self
            .lock_table()
            .entry(id.to_string())
            .or_default()
            .clone();
        DeploymentLock {
            registry: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    // Poisoned only if a holder panicked mid-update; the map itself stays usable
    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.lock_table().len()
    }
}

/// Exclusive redeploy rights on one deployment id, released on drop.
pub struct DeploymentLock<'a> {
    registry: &'a DeploymentRegistry,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DeploymentLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.registry.lock_table();
        // Waiters hold their own clone, so a lone reference means nobody else wants it
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// Canonical form used to compare repository URLs: scheme and host lower-cased,
/// trailing `/` and `.git` dropped.
pub fn normalize_repository_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.find('/') {
                Some(index) => rest.split_at(index),
                None => (rest, ""),
            };
            format!("{}://{}{}", scheme.to_lowercase(), host.to_lowercase(), path)
        }
        None => trimmed.to_string(),
    }
}
