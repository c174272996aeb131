use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use git2::{build::RepoBuilder, FetchOptions, RemoteCallbacks, Repository};
use log::{info, warn};
use tokio::task;
use walkdir::WalkDir;

use crate::domain::port::SourceFetcher;

/// Root-level descriptor names, in order of preference.
const ROOT_DESCRIPTORS: [&str; 3] = ["Dockerfile", "dockerfile", "Dockerfile.dockerfile"];

pub struct GitSourceFetcher {
    pub checkout_directory: PathBuf,
}

impl GitSourceFetcher {
    pub fn new(checkout_directory: impl Into<PathBuf>) -> Self {
        Self {
            checkout_directory: checkout_directory.into(),
        }
    }

    /// Deletes checkouts left behind by fetches abandoned on timeout or crash.
    pub async fn purge_stale_checkouts(&self) -> Result<usize, Error> {
        let directory = self.checkout_directory.clone();
        task::spawn_blocking(move || -> Result<usize, Error> {
            std::fs::create_dir_all(&directory)
                .with_context(|| format!("Can't create checkout directory {}", directory.display()))?;
            let mut removed = 0;
            for entry in std::fs::read_dir(&directory)? {
                let path = entry?.path();
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Can't remove stale checkout {}: {}", path.display(), e),
                }
            }
            Ok(removed)
        })
        .await
        .context("Checkout purge task failed")?
    }
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch_source(&self, repository_url: &str, branch: &str) -> Result<PathBuf, Error> {
        let target = self
            .checkout_directory
            .join(repository_slug(repository_url))
            .join(uuid::Uuid::new_v4().to_string());
        info!(
            "Clone git repository {} (branch {}) into {}",
            repository_url,
            branch,
            target.display()
        );

        // Dropping this future (e.g. on timeout) aborts the clone and discards its checkout
        let mut guard = CloneGuard::new(target.clone());
        let cancelled = guard.cancelled.clone();

        let url = repository_url.to_string();
        let branch = branch.to_string();
        let cloned = task::spawn_blocking(move || {
            if cancelled.load(Ordering::SeqCst) {
                return Err(anyhow!("Clone of {} cancelled before it started", url));
            }
            let mut callbacks = RemoteCallbacks::new();
            let in_flight = cancelled.clone();
            callbacks.transfer_progress(move |_| !in_flight.load(Ordering::SeqCst));
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(callbacks);

            let outcome = RepoBuilder::new()
                .branch(&branch)
                .fetch_options(fetch_options)
                .clone(&url, &target)
                .with_context(|| format!("Can't clone {} (branch {})", url, branch));
            match outcome {
                Ok(_) if !cancelled.load(Ordering::SeqCst) => Ok(target),
                Ok(_) => {
                    remove_checkout(&target);
                    Err(anyhow!("Clone of {} cancelled", url))
                }
                Err(e) => {
                    remove_checkout(&target);
                    Err(e)
                }
            }
        })
        .await;
        guard.disarm();
        cloned.context("Clone task failed")?
    }

    async fn locate_build_descriptor(&self, checkout: &Path) -> Result<Option<PathBuf>, Error> {
        let checkout = checkout.to_path_buf();
        let found = task::spawn_blocking(move || find_build_descriptor(&checkout))
            .await
            .context("Build descriptor search failed")?;
        match &found {
            Some(path) => info!("Found build descriptor at {}", path.display()),
            None => warn!("No build descriptor found"),
        }
        Ok(found)
    }

    async fn latest_revision(&self, checkout: &Path) -> Result<String, Error> {
        let checkout = checkout.to_path_buf();
        task::spawn_blocking(move || -> Result<String, Error> {
            let repository = Repository::open(&checkout)
                .with_context(|| format!("Can't open repository {}", checkout.display()))?;
            let commit = repository
                .head()
                .and_then(|head| head.peel_to_commit())
                .context("Can't resolve HEAD commit")?;
            Ok(commit.id().to_string())
        })
        .await
        .context("Revision lookup task failed")?
    }

    async fn cleanup(&self, checkout: &Path) {
        let checkout = checkout.to_path_buf();
        let removed = task::spawn_blocking(move || {
            if checkout.exists() {
                std::fs::remove_dir_all(&checkout)
                    .with_context(|| format!("Can't remove checkout {}", checkout.display()))?;
            }
            Ok::<_, Error>(checkout)
        })
        .await;
        match removed {
            Ok(Ok(path)) => info!("Cleaned up checkout {}", path.display()),
            Ok(Err(e)) => warn!("{:#}", e),
            Err(e) => warn!("Checkout cleanup task failed: {}", e),
        }
    }
}

/// Cancels an in-flight clone when dropped, and discards its checkout unless the
/// result was handed to the caller.
struct CloneGuard {
    cancelled: Arc<AtomicBool>,
    checkout: Option<PathBuf>,
}

impl CloneGuard {
    fn new(checkout: PathBuf) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            checkout: Some(checkout),
        }
    }

    fn disarm(&mut self) {
        self.checkout = None;
    }
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(checkout) = self.checkout.take() {
            warn!("Clone into {} abandoned, discarding it", checkout.display());
            // A clone still running sees the flag and removes the checkout itself
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn_blocking(move || remove_checkout(&checkout));
            }
        }
    }
}

fn remove_checkout(target: &Path) {
    match std::fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Can't remove checkout {}: {}", target.display(), e),
    }
}

/// Root candidates first, then the first `Dockerfile*` found walking the tree
/// depth-first in file-name order. `.git` is never searched.
fn find_build_descriptor(checkout: &Path) -> Option<PathBuf> {
    ROOT_DESCRIPTORS
        .iter()
        .map(|name| checkout.join(name))
        .find(|path| path.is_file())
        .or_else(|| {
            WalkDir::new(checkout)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.file_name() != ".git")
                .filter_map(Result::ok)
                .find(|entry| {
                    entry.file_type().is_file()
                        && entry.file_name().to_string_lossy().starts_with("Dockerfile")
                })
                .map(|entry| entry.into_path())
        })
}

/// Directory-safe name for a repository, e.g. `org-app` for `https://host/org/app.git`.
fn repository_slug(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(rest),
        None => trimmed.rsplit_once(':').map(|(_, path)| path).unwrap_or(trimmed),
    };
    let slug: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "repository".to_string()
    } else {
        slug
    }
}
