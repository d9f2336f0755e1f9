//! Registry of projections rebuilt together.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use tracing::info;

use crate::entry::LogEntry;
use crate::error::{ProjectionError, TrajError, TrajResult};
use crate::storage::StepLog;

use super::engine::Run;
use super::{Freshness, Projection, Rebuilt};

/// A finished rebuild with its state type erased.
pub struct RebuiltEntry {
    pub name: &'static str,
    pub version: u32,
    pub hash: String,
    pub freshness: Freshness,
    pub entries: u64,
    state: Box<dyn Any + Send>,
}

impl fmt::Debug for RebuiltEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebuiltEntry")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("hash", &self.hash)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<S: Send + 'static> From<Rebuilt<S>> for RebuiltEntry {
    fn from(r: Rebuilt<S>) -> Self {
        Self {
            name: r.name,
            version: r.version,
            hash: r.hash,
            freshness: r.freshness,
            entries: r.entries,
            state: Box::new(r.state),
        }
    }
}

trait ProjectionRun: Send {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ProjectionError>;
    fn finish(self: Box<Self>) -> Result<RebuiltEntry, ProjectionError>;
}

impl<P: Projection> ProjectionRun for Run<'_, P> {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ProjectionError> {
        Run::apply(self, entry)
    }

    fn finish(self: Box<Self>) -> Result<RebuiltEntry, ProjectionError> {
        Run::finish(*self).map(RebuiltEntry::from)
    }
}

trait ErasedProjection: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self) -> Box<dyn ProjectionRun + '_>;
}

impl<P: Projection> ErasedProjection for P {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn start(&self) -> Box<dyn ProjectionRun + '_> {
        Box::new(Run::new(self))
    }
}

/// Results of a registry rebuild, keyed by projection name.
#[derive(Debug, Default)]
pub struct RebuildSet {
    entries: BTreeMap<&'static str, RebuiltEntry>,
}

impl RebuildSet {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RebuiltEntry> {
        self.entries.get(name)
    }

    /// Canonical hash of a rebuilt projection.
    #[must_use]
    pub fn hash(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|e| e.hash.as_str())
    }

    /// Projection names in the set, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns the typed result for `P`.
    pub fn take<P: Projection>(&mut self) -> Result<Rebuilt<P::State>, ProjectionError> {
        let entry = self
            .entries
            .remove(P::NAME)
            .ok_or_else(|| ProjectionError::NotRegistered {
                name: P::NAME.to_string(),
            })?;
        let RebuiltEntry {
            name,
            version,
            hash,
            freshness,
            entries,
            state,
        } = entry;
        let state = state
            .downcast::<P::State>()
            .map_err(|_| ProjectionError::NotRegistered {
                name: P::NAME.to_string(),
            })?;
        Ok(Rebuilt {
            name,
            version,
            state: *state,
            freshness,
            hash,
            entries,
        })
    }

    fn insert(&mut self, entry: RebuiltEntry) {
        self.entries.insert(entry.name, entry);
    }
}

/// Projections rebuilt together in one pass over the log.
#[derive(Default, Clone)]
pub struct ProjectionRegistry {
    projections: Vec<Arc<dyn ErasedProjection>>,
}

impl fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.projections.iter().map(|p| p.name()))
            .finish()
    }
}

impl ProjectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection. Names must be unique.
    pub fn register<P: Projection + 'static>(&mut self, projection: P) -> Result<(), ProjectionError> {
        if self.projections.iter().any(|p| p.name() == P::NAME) {
            return Err(ProjectionError::DuplicateRegistration {
                name: P::NAME.to_string(),
            });
        }
        self.projections.push(Arc::new(projection));
        Ok(())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.projections.iter().map(|p| p.name())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.projections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// Rebuilds every registered projection in a single pass over the log.
    pub fn rebuild_all(&self, log: &dyn StepLog) -> TrajResult<RebuildSet> {
        info!(projections = self.projections.len(), "rebuilding all projections");
        let mut runs: Vec<Box<dyn ProjectionRun + '_>> =
            self.projections.iter().map(|p| p.start()).collect();
        for entry in log.stream()? {
            let entry = entry?;
            for run in &mut runs {
                run.apply(&entry)?;
            }
        }

        let mut set = RebuildSet::default();
        for run in runs {
            let rebuilt = run.finish()?;
            info!(projection = rebuilt.name, entries = rebuilt.entries, hash = %rebuilt.hash, "projection rebuilt");
            set.insert(rebuilt);
        }
        Ok(set)
    }

    /// Rebuilds every registered projection on its own thread, each streaming
    /// the log independently. Produces the same hashes as [`Self::rebuild_all`].
    pub fn rebuild_all_parallel(&self, log: &dyn StepLog) -> TrajResult<RebuildSet> {
        info!(projections = self.projections.len(), "rebuilding all projections in parallel");
        let (tx, rx) = unbounded::<TrajResult<RebuiltEntry>>();

        std::thread::scope(|scope| {
            for projection in &self.projections {
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = (|| {
                        let mut run = projection.start();
                        for entry in log.stream()? {
                            run.apply(&entry?)?;
                        }
                        Ok::<_, TrajError>(run.finish()?)
                    })();
                    // The receiver outlives the scope.
                    let _ = tx.send(result);
                });
            }
        });
        drop(tx);

        let mut set = RebuildSet::default();
        for result in rx {
            let rebuilt = result?;
            info!(projection = rebuilt.name, entries = rebuilt.entries, hash = %rebuilt.hash, "projection rebuilt");
            set.insert(rebuilt);
        }
        if set.len() != self.projections.len() {
            return Err(TrajError::internal("a projection worker exited without a result"));
        }
        Ok(set)
    }
}
