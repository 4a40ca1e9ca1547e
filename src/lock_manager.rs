//! Manages shared/exclusive locks on database resources.
//!
//! Every lockable resource has a queue of requests. Shared requests are
//! granted while no exclusive lock is held; an exclusive request needs the
//! queue to itself. Waiters block on the queue's condition variable with a
//! deadline. Fairness is not strict: a wake-up grants every compatible
//! shared waiter and at most one exclusive waiter, so writers can starve
//! under continuous reader traffic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};
use crate::wal::TxnId;
use crate::{PageId, SlotId, TableId};

/// Timeout used by the table/page/row shortcuts.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockStatus {
    Waiting,
    Granted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Table,
    Page,
    Row,
}

/// A lockable resource. The kind is part of the identity: a TABLE lock and
/// a PAGE lock over the same table id are independent. Sub-fields below
/// the kind's granularity are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resource {
    pub kind: ResourceKind,
    pub table_id: TableId,
    pub page_id: PageId,
    pub slot_id: SlotId,
}

impl Resource {
    pub fn table(table_id: TableId) -> Self {
        Self {
            kind: ResourceKind::Table,
            table_id,
            page_id: 0,
            slot_id: 0,
        }
    }

    pub fn page(table_id: TableId, page_id: PageId) -> Self {
        Self {
            kind: ResourceKind::Page,
            table_id,
            page_id,
            slot_id: 0,
        }
    }

    pub fn row(table_id: TableId, page_id: PageId, slot_id: SlotId) -> Self {
        Self {
            kind: ResourceKind::Row,
            table_id,
            page_id,
            slot_id,
        }
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    status: LockStatus,
}

struct LockQueue {
    requests: Vec<LockRequest>,
    shared_count: usize,
    has_exclusive: bool,
    cv: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            shared_count: 0,
            has_exclusive: false,
            cv: Arc::new(Condvar::new()),
        }
    }

    fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.has_exclusive,
            LockMode::Exclusive => self.shared_count == 0 && !self.has_exclusive,
        }
    }

    /// Grants every compatible shared waiter in order and at most one
    /// exclusive waiter.
    fn wake_waiters(&mut self) {
        for request in self.requests.iter_mut() {
            if request.status != LockStatus::Waiting {
                continue;
            }
            let compatible = match request.mode {
                LockMode::Shared => !self.has_exclusive,
                LockMode::Exclusive => self.shared_count == 0 && !self.has_exclusive,
            };
            if compatible {
                request.status = LockStatus::Granted;
                match request.mode {
                    LockMode::Shared => self.shared_count += 1,
                    LockMode::Exclusive => {
                        self.has_exclusive = true;
                        break;
                    }
                }
            }
        }
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct LockState {
    lock_table: HashMap<Resource, LockQueue>,
    txn_locks: HashMap<TxnId, Vec<Resource>>,
}

/// The lock manager. One mutex serializes the whole table; waiting happens
/// on per-queue condition variables against that mutex.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `resource`, blocking up to `timeout_ms`. A lock
    /// already held in a dominating mode is granted again immediately; a
    /// held shared lock with an exclusive request goes through the upgrade
    /// path. A timeout removes the request and fails with `LockTimeout`.
    pub fn acquire(
        &self,
        txn_id: TxnId,
        resource: Resource,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(queue) = state.lock_table.get(&resource) {
            if let Some(held) = queue
                .requests
                .iter()
                .find(|r| r.txn_id == txn_id && r.status == LockStatus::Granted)
            {
                if held.mode == LockMode::Exclusive || mode == LockMode::Shared {
                    return Ok(());
                }
                return Self::try_upgrade(&mut state, txn_id, resource);
            }
        }

        let queue = state
            .lock_table
            .entry(resource)
            .or_insert_with(LockQueue::new);
        if queue.compatible(mode) {
            queue.requests.push(LockRequest {
                txn_id,
                mode,
                status: LockStatus::Granted,
            });
            match mode {
                LockMode::Shared => queue.shared_count += 1,
                LockMode::Exclusive => queue.has_exclusive = true,
            }
            state.txn_locks.entry(txn_id).or_default().push(resource);
            return Ok(());
        }

        let cv = queue.cv.clone();
        queue.requests.push(LockRequest {
            txn_id,
            mode,
            status: LockStatus::Waiting,
        });
        state.txn_locks.entry(txn_id).or_default().push(resource);

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match state
                .lock_table
                .get(&resource)
                .and_then(|q| q.requests.iter().find(|r| r.txn_id == txn_id))
                .map(|r| r.status)
            {
                Some(LockStatus::Granted) => return Ok(()),
                Some(LockStatus::Waiting) => {}
                // The request disappeared underneath us (release_all).
                None => return Err(Error::LockTimeout { txn_id }),
            }

            if cv.wait_until(&mut state, deadline).timed_out() {
                let granted = state
                    .lock_table
                    .get(&resource)
                    .and_then(|q| q.requests.iter().find(|r| r.txn_id == txn_id))
                    .is_some_and(|r| r.status == LockStatus::Granted);
                if granted {
                    return Ok(());
                }
                Self::remove_request(&mut state, txn_id, resource);
                return Err(Error::LockTimeout { txn_id });
            }
        }
    }

    /// Releases one granted lock and hands the queue to eligible waiters.
    pub fn release(&self, txn_id: TxnId, resource: Resource) -> bool {
        let mut state = self.state.lock();
        let Some(queue) = state.lock_table.get_mut(&resource) else {
            return false;
        };
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id && r.status == LockStatus::Granted)
        else {
            return false;
        };
        let removed = queue.requests.remove(pos);
        match removed.mode {
            LockMode::Shared => queue.shared_count -= 1,
            LockMode::Exclusive => queue.has_exclusive = false,
        }
        queue.wake_waiters();
        if queue.requests.is_empty() {
            state.lock_table.remove(&resource);
        }
        if let Some(resources) = state.txn_locks.get_mut(&txn_id) {
            if let Some(pos) = resources.iter().position(|r| *r == resource) {
                resources.remove(pos);
            }
            if resources.is_empty() {
                state.txn_locks.remove(&txn_id);
            }
        }
        true
    }

    /// Releases every lock held or awaited by the transaction, typically at
    /// commit or abort.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut state = self.state.lock();
        let Some(resources) = state.txn_locks.remove(&txn_id) else {
            return;
        };
        for resource in resources {
            let Some(queue) = state.lock_table.get_mut(&resource) else {
                continue;
            };
            let mut released_shared = 0;
            let mut released_exclusive = false;
            queue.requests.retain(|r| {
                if r.txn_id != txn_id {
                    return true;
                }
                if r.status == LockStatus::Granted {
                    match r.mode {
                        LockMode::Shared => released_shared += 1,
                        LockMode::Exclusive => released_exclusive = true,
                    }
                }
                false
            });
            queue.shared_count -= released_shared;
            if released_exclusive {
                queue.has_exclusive = false;
            }
            queue.wake_waiters();
            if queue.requests.is_empty() {
                state.lock_table.remove(&resource);
            }
        }
    }

    /// Upgrades a shared lock to exclusive. Succeeds only when the
    /// transaction is the sole shared holder.
    pub fn upgrade(&self, txn_id: TxnId, resource: Resource) -> Result<()> {
        let mut state = self.state.lock();
        Self::try_upgrade(&mut state, txn_id, resource)
    }

    fn try_upgrade(state: &mut LockState, txn_id: TxnId, resource: Resource) -> Result<()> {
        let Some(queue) = state.lock_table.get_mut(&resource) else {
            return Err(Error::UpgradeConflict { txn_id });
        };
        let shared_count = queue.shared_count;
        let has_exclusive = queue.has_exclusive;
        let Some(request) = queue
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn_id && r.status == LockStatus::Granted)
        else {
            return Err(Error::UpgradeConflict { txn_id });
        };
        if request.mode == LockMode::Exclusive {
            return Ok(());
        }
        if shared_count == 1 && !has_exclusive {
            request.mode = LockMode::Exclusive;
            queue.shared_count -= 1;
            queue.has_exclusive = true;
            return Ok(());
        }
        Err(Error::UpgradeConflict { txn_id })
    }

    /// Whether the transaction holds a lock at least as strong as `mode`.
    pub fn holds(&self, txn_id: TxnId, resource: Resource, mode: LockMode) -> bool {
        let state = self.state.lock();
        let Some(queue) = state.lock_table.get(&resource) else {
            return false;
        };
        queue
            .requests
            .iter()
            .find(|r| r.txn_id == txn_id && r.status == LockStatus::Granted)
            .map(|r| mode == LockMode::Shared || r.mode == LockMode::Exclusive)
            .unwrap_or(false)
    }

    /// Builds the wait-for graph and reports whether it has a cycle. Every
    /// waiting request waits on every granted request in its queue. No
    /// victim is chosen.
    pub fn detect_deadlock(&self) -> bool {
        let state = self.state.lock();

        let mut wait_for: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        for queue in state.lock_table.values() {
            let holders: Vec<TxnId> = queue
                .requests
                .iter()
                .filter(|r| r.status == LockStatus::Granted)
                .map(|r| r.txn_id)
                .collect();
            for waiter in queue
                .requests
                .iter()
                .filter(|r| r.status == LockStatus::Waiting)
            {
                for &holder in &holders {
                    if holder != waiter.txn_id {
                        wait_for.entry(waiter.txn_id).or_default().push(holder);
                    }
                }
            }
        }

        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        wait_for
            .keys()
            .any(|&txn| !visited.contains(&txn) && has_cycle(&wait_for, txn, &mut visited, &mut path))
    }

    fn remove_request(state: &mut LockState, txn_id: TxnId, resource: Resource) {
        if let Some(queue) = state.lock_table.get_mut(&resource) {
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn_id) {
                let removed = queue.requests.remove(pos);
                if removed.status == LockStatus::Granted {
                    match removed.mode {
                        LockMode::Shared => queue.shared_count -= 1,
                        LockMode::Exclusive => queue.has_exclusive = false,
                    }
                }
            }
            queue.wake_waiters();
            if queue.requests.is_empty() {
                state.lock_table.remove(&resource);
            }
        }
        if let Some(resources) = state.txn_locks.get_mut(&txn_id) {
            if let Some(pos) = resources.iter().position(|r| *r == resource) {
                resources.remove(pos);
            }
            if resources.is_empty() {
                state.txn_locks.remove(&txn_id);
            }
        }
    }

    pub fn lock_table(&self, txn_id: TxnId, table_id: TableId, mode: LockMode) -> Result<()> {
        self.acquire(txn_id, Resource::table(table_id), mode, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn unlock_table(&self, txn_id: TxnId, table_id: TableId) -> bool {
        self.release(txn_id, Resource::table(table_id))
    }

    pub fn lock_page(
        &self,
        txn_id: TxnId,
        table_id: TableId,
        page_id: PageId,
        mode: LockMode,
    ) -> Result<()> {
        self.acquire(
            txn_id,
            Resource::page(table_id, page_id),
            mode,
            DEFAULT_LOCK_TIMEOUT_MS,
        )
    }

    pub fn unlock_page(&self, txn_id: TxnId, table_id: TableId, page_id: PageId) -> bool {
        self.release(txn_id, Resource::page(table_id, page_id))
    }

    pub fn lock_row(
        &self,
        txn_id: TxnId,
        table_id: TableId,
        page_id: PageId,
        slot_id: SlotId,
        mode: LockMode,
    ) -> Result<()> {
        self.acquire(
            txn_id,
            Resource::row(table_id, page_id, slot_id),
            mode,
            DEFAULT_LOCK_TIMEOUT_MS,
        )
    }

    pub fn unlock_row(
        &self,
        txn_id: TxnId,
        table_id: TableId,
        page_id: PageId,
        slot_id: SlotId,
    ) -> bool {
        self.release(txn_id, Resource::row(table_id, page_id, slot_id))
    }
}

fn has_cycle(
    wait_for: &HashMap<TxnId, Vec<TxnId>>,
    txn: TxnId,
    visited: &mut HashSet<TxnId>,
    path: &mut HashSet<TxnId>,
) -> bool {
    visited.insert(txn);
    path.insert(txn);
    if let Some(neighbors) = wait_for.get(&txn) {
        for &next in neighbors {
            if path.contains(&next) {
                return true;
            }
            if !visited.contains(&next) && has_cycle(wait_for, next, visited, path) {
                return true;
            }
        }
    }
    path.remove(&txn);
    false
}
