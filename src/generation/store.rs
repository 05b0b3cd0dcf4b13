//! Durable sled-backed generation history.
//!
//! Trees:
//! - `generations`: big-endian id -> `Generation` JSON
//! - `snapshots`: state hash -> `DesiredState` JSON
//! - `runs`: big-endian run id -> `RunRecord` JSON
//! - `meta`: `active` and `next_id` counters
//!
//! A commit writes the generation, its snapshot and both counters in one
//! multi-tree transaction, so a crash never leaves a partial generation.

use crate::action::Action;
use crate::descriptor::DesiredState;
use crate::diff::DiffEngine;
use crate::error::StorageError;
use crate::generation::{CommitRequest, Generation, RunRecord};
use crate::observed::ObservedState;
use crate::types::{short_hash, GenerationId, StateHash};
use chrono::Utc;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const TREE_GENERATIONS: &str = "generations";
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_RUNS: &str = "runs";
const TREE_META: &str = "meta";
const META_ACTIVE: &[u8] = b"active";
const META_NEXT_ID: &[u8] = b"next_id";

#[derive(Clone)]
pub struct GenerationStore {
    db: Db,
    generations: Tree,
    snapshots: Tree,
    runs: Tree,
    meta: Tree,
    busy: Arc<AtomicBool>,
}

/// Held for the duration of one reconciliation.
#[derive(Debug)]
pub struct StoreLock {
    busy: Arc<AtomicBool>,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Actions that take the active generation back to `target`.
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub target: Generation,
    pub state: DesiredState,
    pub active: Option<GenerationId>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub removed: Vec<GenerationId>,
    pub snapshots_pruned: usize,
}

/// Lazily decoded generations, most recent first.
pub struct GenerationIter {
    inner: std::iter::Rev<sled::Iter>,
}

impl Iterator for GenerationIter {
    type Item = Result<Generation, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.map_err(StorageError::from).and_then(|(_, value)| decode(&value)))
    }
}

impl GenerationStore {
    /// Open (or create) the store at `path`. Another process holding the
    /// database yields `StorageError::Locked`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let generations = db.open_tree(TREE_GENERATIONS)?;
        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        let runs = db.open_tree(TREE_RUNS)?;
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            generations,
            snapshots,
            runs,
            meta,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Serialize reconciliations against this store.
    pub fn lock(&self) -> Result<StoreLock, StorageError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StorageError::Locked("a reconciliation is already running".to_string()))?;
        Ok(StoreLock {
            busy: Arc::clone(&self.busy),
        })
    }

    /// Append a generation and make it active.
    pub fn commit(&self, request: CommitRequest<'_>) -> Result<Generation, StorageError> {
        let snapshot = serde_json::to_vec(request.state)?;
        let created_at = Utc::now();

        let result = (&self.generations, &self.snapshots, &self.meta).transaction(
            |(generations, snapshots, meta)| {
                let id = match meta.get(META_NEXT_ID)? {
                    Some(raw) => decode_id(&raw).map_err(ConflictableTransactionError::Abort)?,
                    None => 1,
                };
                let parent = match meta.get(META_ACTIVE)? {
                    Some(raw) => {
                        Some(decode_id(&raw).map_err(ConflictableTransactionError::Abort)?)
                    }
                    None => None,
                };
                let generation = Generation {
                    id,
                    parent,
                    desired_hash: request.hash,
                    created_at,
                    actions: request.actions.clone(),
                    success: true,
                    origin: request.origin,
                    descriptor: request.descriptor.clone(),
                };
                let value = serde_json::to_vec(&generation)
                    .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;

                generations.insert(id.to_be_bytes().to_vec(), value)?;
                snapshots.insert(&request.hash[..], snapshot.clone())?;
                meta.insert(META_NEXT_ID, (id + 1).to_be_bytes().to_vec())?;
                meta.insert(META_ACTIVE, id.to_be_bytes().to_vec())?;
                Ok(generation)
            },
        );

        let generation = result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StorageError::from(err),
        })?;
        self.db.flush()?;

        info!(
            generation = generation.id,
            parent = ?generation.parent,
            state_hash = %short_hash(&generation.desired_hash),
            actions = generation.actions.len(),
            origin = %generation.origin,
            "Generation committed"
        );
        Ok(generation)
    }

    pub fn get(&self, id: GenerationId) -> Result<Option<Generation>, StorageError> {
        let Some(raw) = self.generations.get(id.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw)?))
    }

    fn require(&self, id: GenerationId) -> Result<Generation, StorageError> {
        self.get(id)?.ok_or(StorageError::NotFound(id))
    }

    pub fn active_id(&self) -> Result<Option<GenerationId>, StorageError> {
        match self.meta.get(META_ACTIVE)? {
            Some(raw) => Ok(Some(decode_id(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn active(&self) -> Result<Option<Generation>, StorageError> {
        match self.active_id()? {
            Some(id) => Ok(Some(self.require(id)?)),
            None => Ok(None),
        }
    }

    /// Desired state stored with a generation.
    pub fn desired_state(&self, id: GenerationId) -> Result<DesiredState, StorageError> {
        let generation = self.require(id)?;
        self.snapshot(&generation.desired_hash)
    }

    fn snapshot(&self, hash: &StateHash) -> Result<DesiredState, StorageError> {
        let raw = self.snapshots.get(&hash[..])?.ok_or_else(|| {
            StorageError::Corrupt(format!("missing snapshot {}", short_hash(hash)))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every generation, most recent first.
    pub fn list(&self) -> GenerationIter {
        GenerationIter {
            inner: self.generations.iter().rev(),
        }
    }

    /// Generations older than `id`, most recent first.
    pub fn list_before(&self, id: GenerationId) -> GenerationIter {
        GenerationIter {
            inner: self.generations.range(..id.to_be_bytes()).rev(),
        }
    }

    /// Plan a rollback: the target's desired state plays "desired" and the
    /// active generation's state, as converged, plays "observed".
    pub fn rollback(
        &self,
        target: GenerationId,
        engine: &DiffEngine,
    ) -> Result<RollbackPlan, StorageError> {
        let generation = self.require(target)?;
        let state = self.snapshot(&generation.desired_hash)?;
        let active = self.active_id()?;
        let current = match active {
            Some(id) => ObservedState::converged(&self.desired_state(id)?),
            None => ObservedState::converged(&DesiredState::default()),
        };
        let actions = engine.diff(&state, &current);
        debug!(
            target,
            active = ?active,
            actions = actions.len(),
            "Rollback planned"
        );
        Ok(RollbackPlan {
            target: generation,
            state,
            active,
            actions,
        })
    }

    /// Keep the newest `keep` generations plus the active one; delete the rest
    /// and any snapshot no remaining generation references. All deletions
    /// happen in one transaction.
    pub fn gc(&self, keep: usize) -> Result<GcReport, StorageError> {
        let active = self.active_id()?;

        let mut removed = Vec::new();
        let mut referenced = BTreeSet::new();
        for (position, generation) in self.list().enumerate() {
            let generation = generation?;
            if position < keep || Some(generation.id) == active {
                referenced.insert(generation.desired_hash);
            } else {
                removed.push(generation.id);
            }
        }
        let orphaned: Vec<IVec> = self
            .snapshots
            .iter()
            .keys()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|key| !referenced.iter().any(|h| &h[..] == key.as_ref()))
            .collect();

        let result = (&self.generations, &self.snapshots, &self.meta).transaction(
            |(generations, snapshots, meta)| {
                // The active pointer is re-read so a concurrent commit is never pruned.
                let active = match meta.get(META_ACTIVE)? {
                    Some(raw) => {
                        Some(decode_id(&raw).map_err(ConflictableTransactionError::Abort)?)
                    }
                    None => None,
                };
                for id in &removed {
                    if Some(*id) == active {
                        return Err(ConflictableTransactionError::Abort(
                            StorageError::Corrupt(format!(
                                "generation {} became active during gc",
                                id
                            )),
                        ));
                    }
                    generations.remove(id.to_be_bytes().to_vec())?;
                }
                for key in &orphaned {
                    snapshots.remove(key.clone())?;
                }
                Ok(())
            },
        );
        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StorageError::from(err),
        })?;
        self.db.flush()?;

        removed.sort_unstable();
        let report = GcReport {
            removed,
            snapshots_pruned: orphaned.len(),
        };
        info!(
            removed = report.removed.len(),
            snapshots_pruned = report.snapshots_pruned,
            "Generation store collected"
        );
        Ok(report)
    }

    /// Store a failed or cancelled attempt, assigning its id.
    pub fn record_run(&self, mut record: RunRecord) -> Result<RunRecord, StorageError> {
        record.id = self.db.generate_id()? + 1;
        let value = serde_json::to_vec(&record)?;
        self.runs.insert(record.id.to_be_bytes(), value)?;
        self.db.flush()?;
        info!(
            run = %record.label(),
            outcome = %record.outcome,
            applied = record.applied.len(),
            pending = record.pending.len(),
            "Run recorded"
        );
        Ok(record)
    }

    /// Recorded runs, most recent first.
    pub fn runs(&self) -> Result<Vec<RunRecord>, StorageError> {
        self.runs
            .iter()
            .rev()
            .map(|entry| -> Result<RunRecord, StorageError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

fn decode(raw: &[u8]) -> Result<Generation, StorageError> {
    Ok(serde_json::from_slice(raw)?)
}

fn decode_id(raw: &[u8]) -> Result<GenerationId, StorageError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("invalid id of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
