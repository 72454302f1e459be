//! Per-query task lanes with leases.
//!
//! [`TaskPool`] is the synchronous core shared by both queue backends. Every query gets
//! a lane of entries in publish order; a claim picks, across all lanes, the oldest entry
//! the lane's ordering rule lets through:
//!
//! - CREATE is always claimable.
//! - NEXT waits until no earlier CREATE for the same delegate is outstanding. Each
//!   delegate of a composite query orders its own tasks.
//! - CLOSE waits until nothing published before it is outstanding.
//!
//! An entry stays outstanding until it is acknowledged, so a claimed CREATE still holds
//! back later NEXT tasks. Leases expire lazily: an entry whose lease has lapsed is simply
//! claimable again.

use super::types::{Claim, QueuedTask};
use crate::error::{QueryStorageError, Result};
use crate::storage::types::{QueryId, TaskKey, TaskKind};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    owner: String,
    expires_at: u64,
}

impl Lease {
    fn is_active(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    task: QueuedTask,
    /// Global publish order, for fairness across queries.
    order: u64,
    lease: Option<Lease>,
}

impl QueueEntry {
    fn is_leased(&self, now: u64) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_active(now))
    }
}

#[derive(Debug, Clone, Default)]
struct QueryLane {
    next_seq: u64,
    entries: BTreeMap<u64, QueueEntry>,
    close_published: bool,
}

impl QueryLane {
    fn position_of(&self, key: &TaskKey) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| &entry.task.key == key)
            .map(|(seq, _)| *seq)
    }

    /// Lowest-seq entry that is neither leased nor held back by the ordering rule.
    fn first_claimable(&self, now: u64) -> Option<u64> {
        let mut creates_before: HashSet<Option<&str>> = HashSet::new();
        let mut anything_before = false;

        for (seq, entry) in &self.entries {
            let delegate = entry.task.delegate.as_deref();
            let allowed = match entry.task.kind {
                TaskKind::Create => true,
                TaskKind::Next => !creates_before.contains(&delegate),
                TaskKind::Close => !anything_before,
            };
            if allowed && !entry.is_leased(now) {
                return Some(*seq);
            }
            anything_before = true;
            if entry.task.kind == TaskKind::Create {
                creates_before.insert(delegate);
            }
        }
        None
    }
}

/// A queue entry as replicated to backups: the task plus its lane position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledTask {
    pub seq: u64,
    pub task: QueuedTask,
}

#[derive(Debug, Default)]
pub struct TaskPool {
    lanes: HashMap<QueryId, QueryLane>,
    next_order: u64,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `task` to its query's lane and returns its position.
    ///
    /// Publishing a task that is already queued is a no-op; a second CLOSE for the same
    /// query is refused.
    pub fn publish(&mut self, task: QueuedTask) -> Result<PooledTask> {
        let lane = self.lanes.entry(task.query_id().clone()).or_default();

        if let Some(seq) = lane.position_of(&task.key) {
            return Ok(PooledTask { seq, task });
        }
        if task.kind == TaskKind::Close {
            if lane.close_published {
                return Err(QueryStorageError::InvalidTransition(format!(
                    "query {} already has a CLOSE task",
                    task.query_id()
                )));
            }
            lane.close_published = true;
        }

        let seq = lane.next_seq;
        lane.next_seq += 1;
        lane.entries.insert(
            seq,
            QueueEntry {
                task: task.clone(),
                order: self.next_order,
                lease: None,
            },
        );
        self.next_order += 1;
        Ok(PooledTask { seq, task })
    }

    /// Inserts a replicated entry at the position the primary gave it.
    pub fn restore(&mut self, pooled: PooledTask) {
        let lane = self
            .lanes
            .entry(pooled.task.query_id().clone())
            .or_default();
        if pooled.task.kind == TaskKind::Close {
            lane.close_published = true;
        }
        lane.next_seq = lane.next_seq.max(pooled.seq + 1);
        lane.entries.entry(pooled.seq).or_insert(QueueEntry {
            task: pooled.task,
            order: self.next_order,
            lease: None,
        });
        self.next_order += 1;
    }

    pub fn claim(&mut self, owner: &str, lease_ms: u64, now: u64) -> Option<Claim> {
        let (query_id, seq) = self
            .lanes
            .iter()
            .filter_map(|(query_id, lane)| {
                let seq = lane.first_claimable(now)?;
                Some((lane.entries[&seq].order, query_id, seq))
            })
            .min_by_key(|(order, _, _)| *order)
            .map(|(_, query_id, seq)| (query_id.clone(), seq))?;

        let entry = self.lanes.get_mut(&query_id)?.entries.get_mut(&seq)?;
        let lease = Lease {
            token: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            expires_at: now + lease_ms,
        };
        let claim = Claim {
            task: entry.task.clone(),
            token: lease.token.clone(),
            owner: lease.owner.clone(),
            expires_at: lease.expires_at,
        };
        entry.lease = Some(lease);
        Some(claim)
    }

    /// Finds the entry `claim` refers to, provided the claim still holds its lease.
    fn held_entry(&mut self, claim: &Claim, now: u64) -> Result<(&mut QueryLane, u64)> {
        let expired = || QueryStorageError::ClaimExpired(claim.task.key.to_string());

        let lane = self
            .lanes
            .get_mut(claim.task.query_id())
            .ok_or_else(expired)?;
        let seq = lane.position_of(&claim.task.key).ok_or_else(expired)?;
        let held = lane.entries[&seq]
            .lease
            .as_ref()
            .is_some_and(|lease| lease.token == claim.token && lease.is_active(now));
        if !held {
            return Err(expired());
        }
        Ok((lane, seq))
    }

    /// Removes the claimed entry for good.
    pub fn acknowledge(&mut self, claim: &Claim, now: u64) -> Result<()> {
        let (lane, seq) = self.held_entry(claim, now)?;
        lane.entries.remove(&seq);
        self.drop_lane_if_idle(claim.task.query_id());
        Ok(())
    }

    /// Gives the claimed entry back so another worker can take it.
    pub fn release(&mut self, claim: &Claim, now: u64) -> Result<()> {
        let (lane, seq) = self.held_entry(claim, now)?;
        if let Some(entry) = lane.entries.get_mut(&seq) {
            entry.lease = None;
        }
        Ok(())
    }

    /// Extends the lease and returns the new expiry.
    pub fn renew(&mut self, claim: &Claim, lease_ms: u64, now: u64) -> Result<u64> {
        let (lane, seq) = self.held_entry(claim, now)?;
        let expires_at = now + lease_ms;
        if let Some(lease) = lane
            .entries
            .get_mut(&seq)
            .and_then(|entry| entry.lease.as_mut())
        {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    /// Drops a query's lane. Returns how many entries were under an active lease.
    pub fn revoke_query(&mut self, query_id: &QueryId, now: u64) -> usize {
        self.lanes
            .remove(query_id)
            .map(|lane| lane.entries.values().filter(|e| e.is_leased(now)).count())
            .unwrap_or(0)
    }

    /// Removes one entry regardless of leases (replicated acknowledgement).
    pub fn remove(&mut self, key: &TaskKey) -> bool {
        let removed = self
            .lanes
            .get_mut(&key.query_id)
            .and_then(|lane| {
                let seq = lane.position_of(key)?;
                lane.entries.remove(&seq)
            })
            .is_some();
        self.drop_lane_if_idle(&key.query_id);
        removed
    }

    /// An empty lane is kept once a CLOSE went through it, so a second CLOSE stays refused.
    fn drop_lane_if_idle(&mut self, query_id: &QueryId) {
        if self
            .lanes
            .get(query_id)
            .is_some_and(|lane| lane.entries.is_empty() && !lane.close_published)
        {
            self.lanes.remove(query_id);
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes.values().map(|lane| lane.entries.len()).sum()
    }

    pub fn claimed(&self, now: u64) -> usize {
        self.lanes
            .values()
            .flat_map(|lane| lane.entries.values())
            .filter(|entry| entry.is_leased(now))
            .count()
    }

    pub fn owner_of(&self, key: &TaskKey, now: u64) -> Option<String> {
        let lane = self.lanes.get(&key.query_id)?;
        let seq = lane.position_of(key)?;
        lane.entries[&seq]
            .lease
            .as_ref()
            .filter(|lease| lease.is_active(now))
            .map(|lease| lease.owner.clone())
    }
}
