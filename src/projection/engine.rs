//! Single-projection rebuild.

use chrono::Utc;
use tracing::info;

use crate::entry::LogEntry;
use crate::error::{ProjectionError, TrajResult};
use crate::storage::StepLog;

use super::{projection_hash, Projection, Rebuilt};

/// An in-progress fold of one projection.
pub(crate) struct Run<'a, P: Projection> {
    projection: &'a P,
    state: P::State,
    entries: u64,
}

impl<'a, P: Projection> Run<'a, P> {
    pub(crate) fn new(projection: &'a P) -> Self {
        Self {
            projection,
            state: projection.init(),
            entries: 0,
        }
    }

    pub(crate) fn apply(&mut self, entry: &LogEntry) -> Result<(), ProjectionError> {
        self.projection.apply(&mut self.state, entry)?;
        self.entries += 1;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Rebuilt<P::State>, ProjectionError> {
        self.projection.finalize(&mut self.state)?;
        let mut freshness = self.projection.freshness(&self.state);
        let hash = projection_hash(P::NAME, P::VERSION, &self.state, &freshness)?;
        freshness.rebuilt_at = Some(Utc::now());
        Ok(Rebuilt {
            name: P::NAME,
            version: P::VERSION,
            state: self.state,
            freshness,
            hash,
            entries: self.entries,
        })
    }
}

/// Rebuilds one projection by streaming the whole log once.
///
/// Entries are folded as they are read; the log is never buffered.
pub fn rebuild_one<P: Projection>(projection: &P, log: &dyn StepLog) -> TrajResult<Rebuilt<P::State>> {
    info!(projection = P::NAME, version = P::VERSION, "rebuilding projection");
    let mut run = Run::new(projection);
    for entry in log.stream()? {
        run.apply(&entry?)?;
    }
    let rebuilt = run.finish()?;
    info!(
        projection = P::NAME,
        entries = rebuilt.entries,
        hash = %rebuilt.hash,
        "projection rebuilt"
    );
    Ok(rebuilt)
}
