// ============================================================================
// Ledger Store
// ============================================================================
//
// In-process tables of row-locked records. Every mutation happens inside a
// unit of work (`Tx`) that:
//
//   - takes row locks NOWAIT; contention surfaces as a transient conflict
//     that `Store::transaction` retries with backoff
//   - acquires locks in rank order: Market → Option → Wallet → Position →
//     Withdrawal → Record
//   - keeps a pre-image of every row it touches and restores them (and
//     removes rows it created) if it is dropped without committing
//   - stages domain events and publishes them only after commit
//
// Transaction bodies are synchronous closures, so no network call can ever
// run while a row lock is held.
//
// ============================================================================

mod unit_of_work;

pub use unit_of_work::RetryPolicy;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{EngineError, EngineResult};
use crate::events::{DomainEvent, EventBus};
use crate::models::{
    AlertKey, ApprovalKey, Dispute, IdempotencyClaim, LiquidityAlert, Market, MarketOption,
    MarketResolution, PositionKey, RecordKey, ResolutionApproval, ResolutionSubmission, UserPosition,
    Wallet, Withdrawal,
};

/// Global lock acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    Market,
    Option,
    Wallet,
    Position,
    Withdrawal,
    Record,
}

type Row<T> = Arc<Mutex<T>>;

// ============================================================================
// TABLE
// ============================================================================

pub struct Table<K, T> {
    rows: RwLock<HashMap<K, Row<T>>>,
}

impl<K: Clone + Eq + Hash + Ord, T> Table<K, T> {
    fn new() -> Self {
        Self { rows: RwLock::new(HashMap::new()) }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Row<T>>> {
        self.rows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Row<T>>> {
        self.rows.write().unwrap_or_else(|e| e.into_inner())
    }

    fn row(&self, key: &K) -> Option<Row<T>> {
        self.read().get(key).cloned()
    }

    /// Returns the new row, or None if the key is taken
    fn insert_if_absent(&self, key: K, value: T) -> Option<Row<T>> {
        let mut rows = self.write();
        if rows.contains_key(&key) {
            return None;
        }
        let row = Arc::new(Mutex::new(value));
        rows.insert(key, row.clone());
        Some(row)
    }

    fn remove(&self, key: &K) {
        self.write().remove(key);
    }

    /// Sorted so scans lock in a stable order
    fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// A row held by a unit of work
pub struct Held<T> {
    guard: OwnedMutexGuard<T>,
    /// None when the row was created by this unit of work
    pre_image: Option<T>,
}

pub trait Entity: Clone + Send + Sync + Sized + 'static {
    type Key: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync + 'static;
    const NAME: &'static str;
    const RANK: LockRank;

    fn key(&self) -> Self::Key;
    fn table(store: &Store) -> &Table<Self::Key, Self>;
    fn held<'t>(tx: &'t mut Tx<'_>) -> &'t mut HashMap<Self::Key, Held<Self>>;
}

macro_rules! entity {
    ($ty:ty, $key:ty, $name:literal, $rank:expr, $field:ident, |$v:ident| $key_expr:expr) => {
        impl Entity for $ty {
            type Key = $key;
            const NAME: &'static str = $name;
            const RANK: LockRank = $rank;

            fn key(&self) -> Self::Key {
                let $v = self;
                $key_expr
            }

            fn table(store: &Store) -> &Table<Self::Key, Self> {
                &store.$field
            }

            fn held<'t>(tx: &'t mut Tx<'_>) -> &'t mut HashMap<Self::Key, Held<Self>> {
                &mut tx.$field
            }
        }
    };
}

entity!(Market, String, "market", LockRank::Market, markets, |m| m.id.clone());
entity!(MarketOption, String, "option", LockRank::Option, options, |o| o.id.clone());
entity!(Wallet, String, "wallet", LockRank::Wallet, wallets, |w| w.user_id.clone());
entity!(UserPosition, PositionKey, "position", LockRank::Position, positions, |p| p.key());
entity!(Withdrawal, String, "withdrawal", LockRank::Withdrawal, withdrawals, |w| w.id.clone());
entity!(IdempotencyClaim, String, "idempotency_claim", LockRank::Withdrawal, claims, |c| c
    .idempotency_key
    .clone());
entity!(ResolutionSubmission, RecordKey, "submission", LockRank::Record, submissions, |s| s.key());
entity!(ResolutionApproval, ApprovalKey, "approval", LockRank::Record, approvals, |a| a.key());
entity!(MarketResolution, String, "resolution", LockRank::Record, resolutions, |r| r
    .option_id
    .clone());
entity!(Dispute, RecordKey, "dispute", LockRank::Record, disputes, |d| d.key());
entity!(LiquidityAlert, AlertKey, "liquidity_alert", LockRank::Record, alerts, |a| a.key());

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    markets: Table<String, Market>,
    options: Table<String, MarketOption>,
    wallets: Table<String, Wallet>,
    positions: Table<PositionKey, UserPosition>,
    withdrawals: Table<String, Withdrawal>,
    claims: Table<String, IdempotencyClaim>,
    submissions: Table<RecordKey, ResolutionSubmission>,
    approvals: Table<ApprovalKey, ResolutionApproval>,
    resolutions: Table<String, MarketResolution>,
    disputes: Table<RecordKey, Dispute>,
    alerts: Table<AlertKey, LiquidityAlert>,
    /// market id → option ids, fixed when the market is seeded
    market_options: RwLock<HashMap<String, Vec<String>>>,
    events: EventBus,
}

impl Store {
    pub fn new() -> Self {
        Self::with_events(EventBus::default())
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            markets: Table::new(),
            options: Table::new(),
            wallets: Table::new(),
            positions: Table::new(),
            withdrawals: Table::new(),
            claims: Table::new(),
            submissions: Table::new(),
            approvals: Table::new(),
            resolutions: Table::new(),
            disputes: Table::new(),
            alerts: Table::new(),
            market_options: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a market together with its options
    pub fn seed_market(&self, mut market: Market, options: Vec<MarketOption>) -> EngineResult<()> {
        if options.is_empty() {
            return Err(EngineError::Validation(format!("market {} has no options", market.id)));
        }
        if let Some(stray) = options.iter().find(|o| o.market_id != market.id) {
            return Err(EngineError::Validation(format!(
                "option {} belongs to market {}",
                stray.id, stray.market_id
            )));
        }
        market.option_count = options.len() as u32;
        market.resolved_options = options.iter().filter(|o| o.is_resolved).count() as u32;

        let market_id = market.id.clone();
        if self.markets.insert_if_absent(market_id.clone(), market).is_none() {
            return Err(EngineError::Conflict(format!("market {} already exists", market_id)));
        }
        let mut ids = Vec::with_capacity(options.len());
        for option in options {
            let id = option.id.clone();
            if self.options.insert_if_absent(id.clone(), option).is_none() {
                return Err(EngineError::Conflict(format!("option {} already exists", id)));
            }
            ids.push(id);
        }
        self.market_options
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(market_id, ids);
        Ok(())
    }

    pub fn create_wallet(&self, wallet: Wallet) -> EngineResult<()> {
        let user_id = wallet.user_id.clone();
        match self.wallets.insert_if_absent(user_id.clone(), wallet) {
            Some(_) => Ok(()),
            None => Err(EngineError::Conflict(format!("wallet for {} already exists", user_id))),
        }
    }

    pub fn option_ids(&self, market_id: &str) -> Vec<String> {
        self.market_options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn market_ids(&self) -> Vec<String> {
        self.markets.keys()
    }

    pub fn keys<E: Entity>(&self) -> Vec<E::Key> {
        E::table(self).keys()
    }

    /// Committed snapshot of one row; waits for any writer to finish
    pub async fn get<E: Entity>(&self, key: &E::Key) -> Option<E> {
        let row = E::table(self).row(key)?;
        let value = row.lock().await.clone();
        Some(value)
    }

    pub async fn all<E: Entity>(&self) -> Vec<E> {
        let mut out = Vec::new();
        for key in self.keys::<E>() {
            if let Some(value) = self.get::<E>(&key).await {
                out.push(value);
            }
        }
        out
    }

    /// Resolve a record id to its option-scoped key
    pub fn record_key<E: Entity<Key = RecordKey>>(&self, id: &str) -> EngineResult<RecordKey> {
        E::table(self)
            .keys()
            .into_iter()
            .find(|k| k.id == id)
            .ok_or_else(|| EngineError::not_found(E::NAME, id))
    }

    pub async fn require<E: Entity>(&self, key: &E::Key) -> EngineResult<E> {
        self.get::<E>(key).await.ok_or_else(|| EngineError::not_found(E::NAME, key))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

pub struct Tx<'s> {
    store: &'s Store,
    markets: HashMap<String, Held<Market>>,
    options: HashMap<String, Held<MarketOption>>,
    wallets: HashMap<String, Held<Wallet>>,
    positions: HashMap<PositionKey, Held<UserPosition>>,
    withdrawals: HashMap<String, Held<Withdrawal>>,
    claims: HashMap<String, Held<IdempotencyClaim>>,
    submissions: HashMap<RecordKey, Held<ResolutionSubmission>>,
    approvals: HashMap<ApprovalKey, Held<ResolutionApproval>>,
    resolutions: HashMap<String, Held<MarketResolution>>,
    disputes: HashMap<RecordKey, Held<Dispute>>,
    alerts: HashMap<AlertKey, Held<LiquidityAlert>>,
    highest_rank: Option<LockRank>,
    staged: Vec<DomainEvent>,
    committed: bool,
}

impl<'s> Tx<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        Self {
            store,
            markets: HashMap::new(),
            options: HashMap::new(),
            wallets: HashMap::new(),
            positions: HashMap::new(),
            withdrawals: HashMap::new(),
            claims: HashMap::new(),
            submissions: HashMap::new(),
            approvals: HashMap::new(),
            resolutions: HashMap::new(),
            disputes: HashMap::new(),
            alerts: HashMap::new(),
            highest_rank: None,
            staged: Vec::new(),
            committed: false,
        }
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    fn check_rank<E: Entity>(&self) -> EngineResult<()> {
        match self.highest_rank {
            Some(held) if E::RANK < held => Err(EngineError::Internal(format!(
                "lock order violation: {} ({:?}) requested after {:?}",
                E::NAME,
                E::RANK,
                held
            ))),
            _ => Ok(()),
        }
    }

    fn raise_rank<E: Entity>(&mut self) {
        self.highest_rank = Some(self.highest_rank.map_or(E::RANK, |r| r.max(E::RANK)));
    }

    /// Lock an existing row and return its current value
    pub fn lock<E: Entity>(&mut self, key: &E::Key) -> EngineResult<E> {
        if let Some(held) = E::held(self).get(key) {
            return Ok((*held.guard).clone());
        }
        self.check_rank::<E>()?;
        let row = E::table(self.store).row(key).ok_or_else(|| EngineError::not_found(E::NAME, key))?;
        let guard = row.try_lock_owned().map_err(|_| EngineError::lock_conflict(E::NAME, key))?;
        let value = (*guard).clone();
        E::held(self).insert(key.clone(), Held { guard, pre_image: Some(value.clone()) });
        self.raise_rank::<E>();
        Ok(value)
    }

    /// Like `lock`, but None when the row is missing
    pub fn find<E: Entity>(&mut self, key: &E::Key) -> EngineResult<Option<E>> {
        match self.lock::<E>(key) {
            Ok(value) => Ok(Some(value)),
            Err(EngineError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lock if free; None when another unit of work holds the row
    pub fn try_lock<E: Entity>(&mut self, key: &E::Key) -> EngineResult<Option<E>> {
        match self.lock::<E>(key) {
            Ok(value) => Ok(Some(value)),
            Err(EngineError::TransientConflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lock every row of a table whose key passes `filter`
    pub fn lock_where<E: Entity>(&mut self, filter: impl Fn(&E::Key) -> bool) -> EngineResult<Vec<E>> {
        let keys: Vec<E::Key> = E::table(self.store).keys().into_iter().filter(|k| filter(k)).collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.find::<E>(&key)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Create a row; a taken key is a conflict
    pub fn insert<E: Entity>(&mut self, value: E) -> EngineResult<()> {
        self.check_rank::<E>()?;
        let key = value.key();
        let row = E::table(self.store)
            .insert_if_absent(key.clone(), value)
            .ok_or_else(|| EngineError::Conflict(format!("{} {} already exists", E::NAME, key)))?;
        let guard = row.try_lock_owned().map_err(|_| EngineError::lock_conflict(E::NAME, &key))?;
        E::held(self).insert(key, Held { guard, pre_image: None });
        self.raise_rank::<E>();
        Ok(())
    }

    /// Write back a row this unit of work holds
    pub fn update<E: Entity>(&mut self, value: E) -> EngineResult<()> {
        let key = value.key();
        match E::held(self).get_mut(&key) {
            Some(held) => {
                *held.guard = value;
                Ok(())
            }
            None => Err(EngineError::Internal(format!("{} {} updated without a lock", E::NAME, key))),
        }
    }

    /// Insert or overwrite
    pub fn upsert<E: Entity>(&mut self, value: E) -> EngineResult<()> {
        let key = value.key();
        if self.find::<E>(&key)?.is_some() {
            self.update(value)
        } else {
            self.insert(value)
        }
    }

    /// Queue an event for publication after commit
    pub fn emit(&mut self, event: DomainEvent) {
        self.staged.push(event);
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
        let events = std::mem::take(&mut self.staged);
        let bus = self.store.events.clone();
        drop(self);
        for event in events {
            bus.publish(event);
        }
    }
}

fn restore<E: Entity>(store: &Store, held: &mut HashMap<E::Key, Held<E>>) {
    for (key, mut row) in held.drain() {
        match row.pre_image.take() {
            Some(pre_image) => *row.guard = pre_image,
            None => E::table(store).remove(&key),
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let store = self.store;
        restore(store, &mut self.alerts);
        restore(store, &mut self.disputes);
        restore(store, &mut self.resolutions);
        restore(store, &mut self.approvals);
        restore(store, &mut self.submissions);
        restore(store, &mut self.claims);
        restore(store, &mut self.withdrawals);
        restore(store, &mut self.positions);
        restore(store, &mut self.wallets);
        restore(store, &mut self.options);
        restore(store, &mut self.markets);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNIT;

    fn store_with_wallets() -> Store {
        let store = Store::new();
        store.create_wallet(Wallet::new("w-alice", "alice", 100 * UNIT)).unwrap();
        store.create_wallet(Wallet::new("w-bob", "bob", 50 * UNIT)).unwrap();
        store
    }

    #[tokio::test]
    async fn test_drop_without_commit_restores_rows() {
        let store = store_with_wallets();
        {
            let mut tx = Tx::new(&store);
            let mut wallet = tx.lock::<Wallet>(&"alice".to_string()).unwrap();
            wallet.debit(40 * UNIT).unwrap();
            tx.update(wallet).unwrap();
            tx.insert(UserPosition::new("alice", "o1", "m1")).unwrap();
        }
        let wallet = store.get::<Wallet>(&"alice".to_string()).await.unwrap();
        assert_eq!(wallet.balance_usdc, 100 * UNIT);
        assert!(store.keys::<UserPosition>().is_empty());
    }

    #[tokio::test]
    async fn test_commit_keeps_changes() {
        let store = store_with_wallets();
        let mut tx = Tx::new(&store);
        let mut wallet = tx.lock::<Wallet>(&"bob".to_string()).unwrap();
        wallet.credit(UNIT).unwrap();
        tx.update(wallet).unwrap();
        tx.commit();

        let wallet = store.get::<Wallet>(&"bob".to_string()).await.unwrap();
        assert_eq!(wallet.balance_usdc, 51 * UNIT);
    }

    #[test]
    fn test_contended_row_is_transient() {
        let store = store_with_wallets();
        let mut first = Tx::new(&store);
        first.lock::<Wallet>(&"alice".to_string()).unwrap();

        let mut second = Tx::new(&store);
        let err = second.lock::<Wallet>(&"alice".to_string()).unwrap_err();
        assert!(err.is_transient());
        assert!(second.try_lock::<Wallet>(&"alice".to_string()).unwrap().is_none());
        assert!(second.try_lock::<Wallet>(&"bob".to_string()).unwrap().is_some());
    }

    #[test]
    fn test_lock_order_is_enforced() {
        let store = store_with_wallets();
        let mut tx = Tx::new(&store);
        tx.lock::<Wallet>(&"alice".to_string()).unwrap();
        let err = tx.lock::<Market>(&"m1".to_string()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn test_duplicate_insert_conflicts() {
        let store = store_with_wallets();
        let mut tx = Tx::new(&store);
        tx.insert(UserPosition::new("alice", "o1", "m1")).unwrap();
        let err = tx.insert(UserPosition::new("alice", "o1", "m1")).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_update_requires_lock() {
        let store = store_with_wallets();
        let mut tx = Tx::new(&store);
        let err = tx.update(Wallet::new("w-alice", "alice", 0)).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
