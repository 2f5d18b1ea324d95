//! Bounded pool of sandbox slots
//!
//! Every process the judge spawns runs inside a leased slot, so the number of
//! concurrently running programs never exceeds the pool capacity.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use crate::sandbox::{SandboxError, ScratchDir};

/// Pool of execution slots shared by all in-flight requests
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// Directory under which leased scratch directories are created
    scratch_root: PathBuf,

    /// Owner handed each scratch directory, see [`IsolationOptions::scratch_owner`](crate::sandbox::IsolationOptions::scratch_owner)
    owner: Option<(u32, u32)>,

    /// Semaphore to limit concurrent executions
    semaphore: Arc<Semaphore>,

    /// Total number of slots
    capacity: usize,
}

impl WorkerPool {
    /// Create a new pool with `capacity` slots (at least one)
    pub fn new(capacity: usize, scratch_root: impl Into<PathBuf>) -> Self {
        let capacity = capacity.max(1);
        Self {
            scratch_root: scratch_root.into(),
            owner: None,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Hand leased directories to this uid/gid
    pub fn with_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.owner = owner;
        self
    }

    /// Wait for a free slot and create a fresh scratch directory for it
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<Lease, SandboxError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;

        let scratch = ScratchDir::create(&self.scratch_root, self.owner).await?;
        debug!(
            scratch = %scratch.id(),
            available = self.available(),
            "acquired slot from pool"
        );

        Ok(Lease {
            scratch,
            _permit: permit,
        })
    }

    /// Get the number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop handing out slots; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A pool slot together with its scratch directory
///
/// The slot is released when the lease is dropped.
#[derive(Debug)]
pub struct Lease {
    scratch: ScratchDir,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// The scratch directory owned by this lease
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Release the slot but keep the directory.
    ///
    /// Used for build directories that outlive the compile step: test runs
    /// copy artifacts out of them while holding their own slots.
    pub fn into_scratch(self) -> ScratchDir {
        self.scratch
    }

    /// Remove the scratch directory and release the slot
    pub async fn cleanup(mut self) -> Result<(), SandboxError> {
        self.scratch.cleanup().await
    }
}
