//! Per-project exclusivity.
//!
//! Each project id maps to a single-permit semaphore. Holding the permit
//! means holding the right to step that project's workflow in this process.
//! The permit is released when the guard drops, so a paused workflow never
//! keeps its project locked. A project's entry is removed again once no
//! guard or contender refers to it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another caller is currently stepping this project.
    #[error("project '{0}' is busy")]
    Busy(String),
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        EngineError::Conflict(err.to_string())
    }
}

/// Lock service keyed by project id.
#[derive(Default)]
pub struct ProjectLocks {
    semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
}

/// Proof of exclusive access to one project. Released on drop.
#[derive(Debug)]
pub struct ProjectGuard {
    project_id: String,
    permit: Option<OwnedSemaphorePermit>,
    semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl ProjectGuard {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        // The permit holds a reference to the semaphore; release it first so
        // only the map's own reference is left when nobody else wants it.
        drop(self.permit.take());
        self.semaphores
            .remove_if(&self.project_id, |_, semaphore| Arc::strong_count(semaphore) == 1);
    }
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the project's lock without waiting.
    pub fn try_acquire(&self, project_id: &str) -> Result<ProjectGuard, LockError> {
        let semaphore = self
            .semaphores
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = semaphore
            .try_acquire_owned()
            .map_err(|_| LockError::Busy(project_id.to_string()))?;

        tracing::debug!(project_id, "project lock acquired");
        Ok(ProjectGuard {
            project_id: project_id.to_string(),
            permit: Some(permit),
            semaphores: Arc::clone(&self.semaphores),
        })
    }

    pub fn is_locked(&self, project_id: &str) -> bool {
        self.semaphores
            .get(project_id)
            .is_some_and(|s| s.available_permits() == 0)
    }
}
