use arc_swap::ArcSwapOption;
use arcade_cache::{CacheStore, Partition, StorageError};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// The partitions one deployment of the gateway reads and writes.
///
/// Any partition in storage whose name is not in the current set is stale
/// and gets dropped on the next activation.
#[derive(Debug, Clone)]
pub struct GenerationSet {
    general: Partition,
    image: Partition,
}

impl GenerationSet {
    /// Resolve partition handles. Nothing is created until install.
    pub fn new(store: &CacheStore, general: &str, image: &str) -> Result<Self, StorageError> {
        Ok(Self {
            general: store.partition(general)?,
            image: store.partition(image)?,
        })
    }

    pub fn general(&self) -> &Partition {
        &self.general
    }

    pub fn image(&self) -> &Partition {
        &self.image
    }

    pub fn names(&self) -> [&str; 2] {
        [self.general.name(), self.image.name()]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No generation has been installed yet; requests go straight to the network.
    Idle,
    Installing,
    Installed,
    Activating,
    Activated,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ActivationReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns the existence of partitions: installs new generations, activates
/// them, and garbage-collects everything else.
///
/// The active generation is published through a shared `ArcSwapOption` that
/// the gateway reads on every request. Swapping it is how a new generation
/// claims every open client at once.
pub struct Lifecycle {
    store: CacheStore,
    active: Arc<ArcSwapOption<GenerationSet>>,
    waiting: Mutex<Option<Arc<GenerationSet>>>,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            active: Arc::new(ArcSwapOption::empty()),
            waiting: Mutex::new(None),
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    /// Handle the gateway uses to find the active generation.
    pub fn controller(&self) -> Arc<ArcSwapOption<GenerationSet>> {
        Arc::clone(&self.active)
    }

    pub fn active(&self) -> Option<Arc<GenerationSet>> {
        self.active.load_full()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
        tracing::debug!(?state, "lifecycle state changed");
    }

    /// Prepare a generation: create its partitions and park it as waiting.
    ///
    /// Requests still in flight against the previous generation are not
    /// waited for.
    pub async fn install(&self, generation: GenerationSet) -> Result<(), StorageError> {
        let previous = self.state();
        self.set_state(LifecycleState::Installing);

        for partition in [generation.general(), generation.image()] {
            if let Err(e) = self.store.open(partition.name()).await {
                tracing::error!(partition = partition.name(), error = %e, "install failed");
                self.set_state(previous);
                return Err(e);
            }
        }

        tracing::info!(
            general = generation.general().name(),
            image = generation.image().name(),
            "generation installed"
        );
        *self.waiting.lock() = Some(Arc::new(generation));
        self.set_state(LifecycleState::Installed);
        Ok(())
    }

    /// Promote the waiting generation (or re-run cleanup for the active one
    /// when nothing is waiting).
    ///
    /// The new generation claims all clients before old partitions are
    /// dropped, so superseded partitions stop receiving writes as early as
    /// possible.
    pub async fn activate(&self) -> Result<ActivationReport, StorageError> {
        let waiting = self.waiting.lock().take();
        let Some(generation) = waiting.or_else(|| self.active()) else {
            tracing::warn!("activate called with no installed generation");
            return Ok(ActivationReport::default());
        };

        self.set_state(LifecycleState::Activating);
        self.claim(Arc::clone(&generation));

        let report = self.cleanup(&generation).await;
        self.set_state(LifecycleState::Activated);
        report
    }

    /// Install and immediately activate, without waiting for the previous
    /// generation to go idle.
    pub async fn install_and_activate(
        &self,
        generation: GenerationSet,
    ) -> Result<ActivationReport, StorageError> {
        self.install(generation).await?;
        self.activate().await
    }

    fn claim(&self, generation: Arc<GenerationSet>) {
        let previous = self.active.swap(Some(Arc::clone(&generation)));
        tracing::info!(
            general = generation.general().name(),
            image = generation.image().name(),
            previous = ?previous.as_ref().map(|g| g.names()),
            "generation claimed all clients"
        );
    }

    /// Delete every stored partition that is not part of `current`.
    ///
    /// Deletions run concurrently and a failure on one partition never stops
    /// the others. Only a failure to list partitions is returned as an error.
    pub async fn cleanup(&self, current: &GenerationSet) -> Result<ActivationReport, StorageError> {
        let names = self.store.partition_names().await?;
        let (kept, stale): (Vec<String>, Vec<String>) =
            names.into_iter().partition(|name| current.contains(name));

        let results = join_all(stale.iter().map(|name| self.store.delete_partition(name))).await;

        let mut report = ActivationReport {
            kept,
            ..ActivationReport::default()
        };
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    metrics::counter!("gateway_partitions_deleted_total").increment(1);
                    report.deleted.push(name);
                }
                Err(e) => {
                    tracing::warn!(partition = %name, error = %e, "failed to delete stale partition");
                    metrics::counter!("gateway_storage_errors_total", "op" => "delete_partition")
                        .increment(1);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        tracing::info!(
            kept = ?report.kept,
            deleted = ?report.deleted,
            failed = report.failed.len(),
            "stale partitions cleaned up"
        );
        Ok(report)
    }
}
