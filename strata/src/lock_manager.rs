//! Multi-granularity locking: IS/IX/S/SIX/X on tables and rows, strict
//! two-phase locking, no-wait conflict resolution.

use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::errors::{Result, StrataError};
use crate::transaction::{Transaction, TxnState};
use crate::{Rid, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// The join of all granted modes on one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupLockMode {
    #[default]
    NonLock,
    Is,
    Ix,
    S,
    Six,
    X,
}

impl GroupLockMode {
    fn from_mode(mode: LockMode) -> Self {
        match mode {
            LockMode::IntentionShared => GroupLockMode::Is,
            LockMode::IntentionExclusive => GroupLockMode::Ix,
            LockMode::Shared => GroupLockMode::S,
            LockMode::SharedIntentionExclusive => GroupLockMode::Six,
            LockMode::Exclusive => GroupLockMode::X,
        }
    }

    /// Supremum in the IS < IX,S < SIX < X lattice; IX and S are
    /// incomparable and join to SIX.
    fn join(self, other: GroupLockMode) -> Self {
        use GroupLockMode::*;
        match (self, other) {
            (NonLock, m) | (m, NonLock) => m,
            (X, _) | (_, X) => X,
            (Six, _) | (_, Six) => Six,
            (S, Ix) | (Ix, S) => Six,
            (S, _) | (_, S) => S,
            (Ix, _) | (_, Ix) => Ix,
            (Is, Is) => Is,
        }
    }
}

/// Identifies a lockable resource: a whole table, or one row of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub fd: i32,
    pub rid: Option<Rid>,
}

impl LockDataId {
    pub fn table(fd: i32) -> Self {
        Self { fd, rid: None }
    }

    pub fn row(fd: i32, rid: Rid) -> Self {
        Self { fd, rid: Some(rid) }
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    group_mode: GroupLockMode,
    shared_count: usize,
    ix_count: usize,
}

impl LockRequestQueue {
    fn position_of(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared | LockMode::SharedIntentionExclusive => self.shared_count += 1,
            _ => {}
        }
        if matches!(
            mode,
            LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        ) {
            self.ix_count += 1;
        }
        self.group_mode = self.group_mode.join(GroupLockMode::from_mode(mode));
        self.requests.push_back(LockRequest {
            txn_id,
            mode,
            granted: true,
        });
    }

    fn recompute(&mut self) {
        self.group_mode = self
            .requests
            .iter()
            .filter(|r| r.granted)
            .fold(GroupLockMode::NonLock, |acc, r| {
                acc.join(GroupLockMode::from_mode(r.mode))
            });
    }
}

/// The lock table. Acquisition is no-wait: any conflict raises
/// `DeadlockPrevention` and the transaction is expected to abort.
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

/// 2PL state gate run before every acquire. Terminal transactions are
/// denied, shrinking ones abort, a first acquire starts the growing phase.
fn check_lock(txn: &Transaction) -> Result<bool> {
    match txn.state() {
        TxnState::Committed | TxnState::Aborted => Ok(false),
        TxnState::Shrinking => Err(StrataError::LockOnShrinking(txn.id())),
        TxnState::Default => {
            txn.set_state(TxnState::Growing);
            Ok(true)
        }
        TxnState::Growing => Ok(true),
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::row(fd, rid);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        // A row lock of any mode this transaction already holds covers S.
        if queue.position_of(txn.id()).is_some() {
            return Ok(true);
        }
        if matches!(
            queue.group_mode,
            GroupLockMode::X | GroupLockMode::Ix | GroupLockMode::Six
        ) {
            debug!("txn {} denied row-S on {:?}", txn.id(), id);
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::Shared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_exclusive_on_record(&self, txn: &Transaction, rid: Rid, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::row(fd, rid);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            let mode = queue.requests[pos].mode;
            if mode == LockMode::Exclusive {
                return Ok(true);
            }
            // Upgrade is possible only when nobody else holds the row.
            if matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                && queue.requests.len() == 1
            {
                if mode == LockMode::Shared {
                    queue.shared_count -= 1;
                }
                queue.requests[pos].mode = LockMode::Exclusive;
                queue.group_mode = GroupLockMode::X;
                return Ok(true);
            }
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }

        if queue.group_mode != GroupLockMode::NonLock {
            debug!("txn {} denied row-X on {:?}", txn.id(), id);
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::Exclusive);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_is_on_table(&self, txn: &Transaction, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::table(fd);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        // Nothing is weaker than IS; any held mode covers it.
        if queue.position_of(txn.id()).is_some() {
            return Ok(true);
        }
        if queue.group_mode == GroupLockMode::X {
            debug!("txn {} denied table-IS on fd {fd}", txn.id());
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::IntentionShared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::table(fd);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            match queue.requests[pos].mode {
                LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
                | LockMode::Exclusive => return Ok(true),
                // The sole reader may add intent to write: S -> SIX.
                LockMode::Shared if queue.shared_count == 1 => {
                    queue.requests[pos].mode = LockMode::SharedIntentionExclusive;
                    queue.ix_count += 1;
                    queue.group_mode = GroupLockMode::Six;
                    return Ok(true);
                }
                LockMode::IntentionShared
                    if matches!(queue.group_mode, GroupLockMode::Is | GroupLockMode::Ix) =>
                {
                    queue.requests[pos].mode = LockMode::IntentionExclusive;
                    queue.ix_count += 1;
                    queue.group_mode = GroupLockMode::Ix;
                    return Ok(true);
                }
                _ => return Err(StrataError::DeadlockPrevention(txn.id())),
            }
        }

        if matches!(
            queue.group_mode,
            GroupLockMode::S | GroupLockMode::Six | GroupLockMode::X
        ) {
            debug!("txn {} denied table-IX on fd {fd}", txn.id());
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::IntentionExclusive);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::table(fd);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            match queue.requests[pos].mode {
                LockMode::Shared | LockMode::SharedIntentionExclusive | LockMode::Exclusive => {
                    return Ok(true)
                }
                LockMode::IntentionShared
                    if matches!(queue.group_mode, GroupLockMode::S | GroupLockMode::Is) =>
                {
                    queue.requests[pos].mode = LockMode::Shared;
                    queue.shared_count += 1;
                    queue.group_mode = GroupLockMode::S;
                    return Ok(true);
                }
                // The sole writer-intent may add a read of the whole table.
                LockMode::IntentionExclusive if queue.ix_count == 1 => {
                    queue.requests[pos].mode = LockMode::SharedIntentionExclusive;
                    queue.shared_count += 1;
                    queue.group_mode = GroupLockMode::Six;
                    return Ok(true);
                }
                _ => return Err(StrataError::DeadlockPrevention(txn.id())),
            }
        }

        if matches!(
            queue.group_mode,
            GroupLockMode::Ix | GroupLockMode::Six | GroupLockMode::X
        ) {
            debug!("txn {} denied table-S on fd {fd}", txn.id());
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::Shared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: i32) -> Result<bool> {
        if !check_lock(txn)? {
            return Ok(false);
        }
        let id = LockDataId::table(fd);
        let mut table = self.lock_table.lock();
        let queue = table.entry(id).or_default();

        if let Some(pos) = queue.position_of(txn.id()) {
            if queue.requests[pos].mode == LockMode::Exclusive {
                return Ok(true);
            }
            // Any mode upgrades to X when this is the only holder.
            if queue.requests.len() == 1 {
                match queue.requests[pos].mode {
                    LockMode::Shared | LockMode::SharedIntentionExclusive => {
                        queue.shared_count -= 1
                    }
                    _ => {}
                }
                if matches!(
                    queue.requests[pos].mode,
                    LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
                ) {
                    queue.ix_count -= 1;
                }
                queue.requests[pos].mode = LockMode::Exclusive;
                queue.group_mode = GroupLockMode::X;
                return Ok(true);
            }
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }

        if queue.group_mode != GroupLockMode::NonLock {
            debug!("txn {} denied table-X on fd {fd}", txn.id());
            return Err(StrataError::DeadlockPrevention(txn.id()));
        }
        queue.grant(txn.id(), LockMode::Exclusive);
        txn.add_lock(id);
        Ok(true)
    }

    /// Releases this transaction's request on `id`. The first release moves
    /// the transaction into its shrinking phase. Unknown ids succeed.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> Result<bool> {
        match txn.state() {
            TxnState::Committed | TxnState::Aborted => return Ok(false),
            TxnState::Growing => txn.set_state(TxnState::Shrinking),
            _ => {}
        }

        let mut table = self.lock_table.lock();
        let mut queue_emptied = false;
        if let Some(queue) = table.get_mut(&id) {
            let Some(pos) = queue.position_of(txn.id()) else {
                return Ok(true);
            };
            let mode = queue.requests[pos].mode;
            if matches!(mode, LockMode::Shared | LockMode::SharedIntentionExclusive) {
                queue.shared_count -= 1;
            }
            if matches!(
                mode,
                LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
            ) {
                queue.ix_count -= 1;
            }
            let _ = queue.requests.remove(pos);
            if queue.requests.is_empty() {
                queue_emptied = true;
            } else {
                queue.recompute();
            }
        }
        if queue_emptied {
            table.remove(&id);
        }
        Ok(true)
    }

    /// Test hook: the queue's aggregates for one resource.
    pub fn queue_state(&self, id: LockDataId) -> Option<(GroupLockMode, usize, usize)> {
        self.lock_table
            .lock()
            .get(&id)
            .map(|q| (q.group_mode, q.shared_count, q.ix_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn txn(id: TxnId) -> Arc<Transaction> {
        let t = Arc::new(Transaction::new(id, id));
        t.set_state(TxnState::Growing);
        t
    }

    #[test]
    fn group_mode_is_a_lattice_join() {
        use GroupLockMode::*;
        assert_eq!(S.join(Ix), Six);
        assert_eq!(Ix.join(S), Six);
        assert_eq!(Is.join(Ix), Ix);
        assert_eq!(NonLock.join(S), S);
        assert_eq!(Six.join(S), Six);
        assert_eq!(X.join(Is), X);
    }

    #[test]
    fn shared_locks_coexist_but_exclusive_conflicts() {
        let lm = LockManager::new();
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));
        let rid = Rid::new(0, 0);

        assert!(lm.lock_shared_on_record(&t1, rid, 0).unwrap());
        assert!(lm.lock_shared_on_record(&t2, rid, 0).unwrap());
        assert!(matches!(
            lm.lock_exclusive_on_record(&t3, rid, 0),
            Err(StrataError::DeadlockPrevention(3))
        ));

        let (mode, shared, ix) = lm.queue_state(LockDataId::row(0, rid)).unwrap();
        assert_eq!(mode, GroupLockMode::S);
        assert_eq!((shared, ix), (2, 0));
    }

    #[test]
    fn row_exclusive_blocks_row_shared() {
        let lm = LockManager::new();
        let (t1, t2) = (txn(1), txn(2));
        let rid = Rid::new(0, 0);

        assert!(lm.lock_exclusive_on_record(&t1, rid, 0).unwrap());
        assert!(matches!(
            lm.lock_shared_on_record(&t2, rid, 0),
            Err(StrataError::DeadlockPrevention(2))
        ));
        // After t1 releases, t2 can retry with a fresh transaction.
        lm.unlock(&t1, LockDataId::row(0, rid)).unwrap();
        let t2_retry = txn(4);
        assert!(lm.lock_shared_on_record(&t2_retry, rid, 0).unwrap());
    }

    #[test]
    fn sole_holder_upgrades_shared_to_exclusive() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let rid = Rid::new(1, 2);
        assert!(lm.lock_shared_on_record(&t1, rid, 0).unwrap());
        assert!(lm.lock_exclusive_on_record(&t1, rid, 0).unwrap());
        let (mode, shared, _) = lm.queue_state(LockDataId::row(0, rid)).unwrap();
        assert_eq!(mode, GroupLockMode::X);
        assert_eq!(shared, 0);
    }

    #[test]
    fn intention_hierarchy_on_tables() {
        let lm = LockManager::new();
        let (t1, t2, t3) = (txn(1), txn(2), txn(3));

        assert!(lm.lock_is_on_table(&t1, 5).unwrap());
        assert!(lm.lock_ix_on_table(&t2, 5).unwrap());
        // S conflicts with IX.
        assert!(matches!(
            lm.lock_shared_on_table(&t3, 5),
            Err(StrataError::DeadlockPrevention(3))
        ));
        // IS coexists with IX.
        assert!(lm.lock_is_on_table(&t3, 5).unwrap());
        let (mode, _, ix) = lm.queue_state(LockDataId::table(5)).unwrap();
        assert_eq!(mode, GroupLockMode::Ix);
        assert_eq!(ix, 1);
    }

    #[test]
    fn six_upgrade_paths() {
        let lm = LockManager::new();
        let t1 = txn(1);
        assert!(lm.lock_shared_on_table(&t1, 5).unwrap());
        assert!(lm.lock_ix_on_table(&t1, 5).unwrap());
        let (mode, shared, ix) = lm.queue_state(LockDataId::table(5)).unwrap();
        assert_eq!(mode, GroupLockMode::Six);
        assert_eq!((shared, ix), (1, 1));

        let t2 = txn(2);
        assert!(lm.lock_ix_on_table(&t2, 6).unwrap());
        assert!(lm.lock_shared_on_table(&t2, 6).unwrap());
        let (mode, shared, ix) = lm.queue_state(LockDataId::table(6)).unwrap();
        assert_eq!(mode, GroupLockMode::Six);
        assert_eq!((shared, ix), (1, 1));
    }

    #[test]
    fn acquire_after_release_raises_lock_on_shrinking() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let rid = Rid::new(0, 1);
        assert!(lm.lock_shared_on_record(&t1, rid, 0).unwrap());
        lm.unlock(&t1, LockDataId::row(0, rid)).unwrap();
        assert_eq!(t1.state(), TxnState::Shrinking);
        for result in [
            lm.lock_shared_on_record(&t1, rid, 0),
            lm.lock_exclusive_on_record(&t1, rid, 0),
            lm.lock_is_on_table(&t1, 0),
            lm.lock_ix_on_table(&t1, 0),
            lm.lock_shared_on_table(&t1, 0),
            lm.lock_exclusive_on_table(&t1, 0),
        ] {
            assert!(matches!(result, Err(StrataError::LockOnShrinking(1))));
        }
    }

    #[test]
    fn terminal_transactions_are_denied_without_error() {
        let lm = LockManager::new();
        let t1 = txn(1);
        t1.set_state(TxnState::Committed);
        assert!(!lm.lock_is_on_table(&t1, 0).unwrap());
        assert!(!lm.unlock(&t1, LockDataId::table(0)).unwrap());
    }

    #[test]
    fn unlock_recomputes_group_mode_from_survivors() {
        let lm = LockManager::new();
        let (t1, t2) = (txn(1), txn(2));
        assert!(lm.lock_is_on_table(&t1, 9).unwrap());
        assert!(lm.lock_ix_on_table(&t2, 9).unwrap());
        let (mode, _, _) = lm.queue_state(LockDataId::table(9)).unwrap();
        assert_eq!(mode, GroupLockMode::Ix);

        lm.unlock(&t2, LockDataId::table(9)).unwrap();
        let (mode, _, ix) = lm.queue_state(LockDataId::table(9)).unwrap();
        assert_eq!(mode, GroupLockMode::Is);
        assert_eq!(ix, 0);

        lm.unlock(&t1, LockDataId::table(9)).unwrap();
        assert!(lm.queue_state(LockDataId::table(9)).is_none());
    }
}
