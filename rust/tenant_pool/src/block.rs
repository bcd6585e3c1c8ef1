use crate::{
    algo::BlockSample,
    conn::{Conn, ConnError, ConnId, ConnResult, Connector},
    demand::{DemandEstimator, DemandEvent, EstimatorConfig},
    metrics::{BlockMetrics, MetricVariant, PoolMetrics, RawMetrics, VariantArray},
    time::Instant,
    waitqueue::{WaitQueue, WaiterId},
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{error, trace};

/// A cheaply cloneable name string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(Arc<str>);

impl Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl std::fmt::Debug for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name(Arc::from(value))
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name(Arc::from(value))
    }
}

#[cfg(test)]
impl From<usize> for Name {
    fn from(value: usize) -> Self {
        Name::from(format!("db-{value}"))
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for Name {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The lifecycle of a block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::AsRefStr, strum::Display,
)]
pub enum BlockState {
    /// Created, but no connection has been requested yet.
    #[default]
    Empty,
    /// The first connections are being opened.
    Warming,
    Active,
    /// Unused for long enough to be garbage collected. An acquire cancels the
    /// drain.
    Draining,
    /// No longer in the pool. Acquires must look the target up again.
    Removed,
}

/// What the pool should do with an acquire after inspecting the block.
pub enum Checkout<C: Connector> {
    /// An idle connection was checked out.
    Ready(Conn<C>),
    /// Capacity was reserved and the caller must open a connection.
    Open,
    /// The caller was queued. `no_quota` is set if the block had no quota.
    Wait {
        id: WaiterId,
        rx: oneshot::Receiver<Delivery<C>>,
        no_quota: bool,
    },
    /// The block was garbage collected before we got to it.
    Removed,
    /// The pool closed before we got to it.
    Closed,
}

/// The value delivered to a waiter.
pub type Delivery<C> = ConnResult<Conn<C>, <C as Connector>::Error>;

/// The global connection budget. Reservations are made with the owning
/// block's lock held, so the block's live count and the global count move
/// together.
#[derive(Debug)]
pub struct Capacity {
    max: usize,
    live: AtomicUsize,
}

impl Capacity {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            live: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live() >= self.max
    }

    /// Reserve one connection's worth of capacity.
    pub fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max).then_some(live + 1)
            })
            .is_ok()
    }

    /// Return one connection's worth of capacity.
    pub fn release<E: Clone>(&self) -> ConnResult<(), E> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_sub(1)
            })
            .map(drop)
            .map_err(|_| {
                error!("Global capacity released more times than it was reserved");
                ConnError::InvariantViolation("capacity underflow".into())
            })
    }
}

/// Bookkeeping for a single target. Only ever accessed with the block's lock
/// held, through [`Block::with`].
pub struct BlockInner<C: Connector> {
    state: BlockState,
    /// Idle connections, least recently used at the front.
    idle: VecDeque<Conn<C>>,
    /// Checked-out connections and when they were checked out.
    checked_out: HashMap<ConnId, Instant>,
    waiters: WaitQueue<Delivery<C>>,
    quota: usize,
    demand: DemandEstimator,
    metrics: RawMetrics,
    quiet_since: Option<Instant>,
    draining_since: Option<Instant>,
}

/// Which end of the idle set to take from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEnd {
    MostRecent,
    LeastRecent,
}

impl<C: Connector> BlockInner<C> {
    fn new(initial_demand: f64, now: Instant) -> Self {
        Self {
            state: BlockState::Empty,
            idle: VecDeque::new(),
            checked_out: HashMap::new(),
            waiters: WaitQueue::new(),
            quota: 0,
            demand: DemandEstimator::new(initial_demand, now),
            metrics: RawMetrics::default(),
            quiet_since: None,
            draining_since: None,
        }
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        self.state
    }

    /// Connections counted against capacity.
    #[inline]
    pub fn live(&self) -> usize {
        self.metrics.total()
    }

    #[inline]
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    #[inline]
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    #[inline]
    pub fn connecting(&self) -> usize {
        self.metrics.count(MetricVariant::Connecting)
    }

    #[inline]
    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn set_quota(&mut self, quota: usize) {
        if quota != self.quota {
            trace!("Quota {} -> {quota}", self.quota);
        }
        self.quota = quota;
    }

    /// Checked-out connections plus waiters.
    #[inline]
    pub fn need(&self) -> usize {
        self.checked_out.len() + self.waiters.len()
    }

    pub fn demand(&self) -> &DemandEstimator {
        &self.demand
    }

    pub fn observe(&mut self, event: DemandEvent, now: Instant, config: &EstimatorConfig) {
        let need = self.need();
        self.demand.observe(event, need, now, config);
    }

    pub fn tick(&mut self, now: Instant, config: &EstimatorConfig) {
        let need = self.need();
        self.demand.tick(need, now, config);
        self.metrics.reset_max();
    }

    /// Waiters that a new connection could serve while the pool is out of
    /// capacity.
    pub fn is_starved(&self) -> bool {
        self.waiters.len() > self.connecting() && self.live() < self.quota
    }

    /// How long the oldest waiter has been waiting.
    pub fn oldest_wait(&self) -> Duration {
        self.waiters.oldest()
    }

    pub fn is_checked_out(&self, id: ConnId) -> bool {
        self.checked_out.contains_key(&id)
    }

    /// How long the given connection has been checked out.
    pub fn held_for(&self, id: ConnId, now: Instant) -> Option<Duration> {
        self.checked_out
            .get(&id)
            .map(|since| now.saturating_duration_since(*since))
    }

    pub fn peek_idle(&self, end: IdleEnd) -> Option<&Conn<C>> {
        match end {
            IdleEnd::MostRecent => self.idle.back(),
            IdleEnd::LeastRecent => self.idle.front(),
        }
    }

    /// Remove an idle connection, either checking it out or marking it as
    /// disconnecting.
    pub fn take_idle(&mut self, end: IdleEnd, checkout: bool, now: Instant) -> Option<Conn<C>> {
        let conn = match end {
            IdleEnd::MostRecent => self.idle.pop_back(),
            IdleEnd::LeastRecent => self.idle.pop_front(),
        }?;
        let to = if checkout {
            self.checked_out.insert(conn.id(), now);
            MetricVariant::Active
        } else {
            MetricVariant::Disconnecting
        };
        self.metrics
            .transition(MetricVariant::Idle, to, conn.idle_for(now));
        Some(conn)
    }

    /// Account for a connection open that is about to start.
    pub fn begin_open(&mut self) {
        if self.state == BlockState::Empty {
            self.state = BlockState::Warming;
        }
        self.metrics.insert(MetricVariant::Connecting);
    }

    /// A connection open succeeded: the connection is checked out.
    pub fn finish_open(&mut self, conn: &Conn<C>, elapsed: Duration, now: Instant) {
        self.checked_out.insert(conn.id(), now);
        self.metrics
            .transition(MetricVariant::Connecting, MetricVariant::Active, elapsed);
    }

    /// A connection open failed or was abandoned.
    pub fn fail_open(&mut self, elapsed: Duration) {
        self.metrics
            .remove_time(MetricVariant::Connecting, elapsed);
        self.metrics.inc_all_time(MetricVariant::Failed);
    }

    /// A disconnect completed.
    pub fn finish_close(&mut self, elapsed: Duration) {
        self.metrics
            .remove_time(MetricVariant::Disconnecting, elapsed);
        self.metrics.inc_all_time(MetricVariant::Closed);
    }

    pub fn push_waiter(&mut self) -> (WaiterId, oneshot::Receiver<Delivery<C>>) {
        self.metrics.insert(MetricVariant::Waiting);
        self.waiters.queue()
    }

    /// Remove a waiter if it is still queued. Returns false if the waiter was
    /// already fulfilled.
    pub fn remove_waiter(&mut self, id: WaiterId) -> bool {
        if let Some(waiter) = self.waiters.remove(id) {
            self.metrics
                .remove_time(MetricVariant::Waiting, waiter.waited());
            true
        } else {
            false
        }
    }

    /// Hand a checked-out connection to the oldest waiter. The connection
    /// stays checked out. If there are no waiters left, the connection is
    /// handed back.
    pub fn hand_off(&mut self, mut conn: Conn<C>, now: Instant) -> Result<(), Conn<C>> {
        debug_assert!(self.is_checked_out(conn.id()));
        while let Some(waiter) = self.waiters.pop() {
            self.metrics
                .remove_time(MetricVariant::Waiting, waiter.waited());
            let id = conn.id();
            trace!("Handing {id} to {}", waiter.id);
            match waiter.send(Ok(conn)) {
                Ok(()) => {
                    self.checked_out.insert(id, now);
                    return Ok(());
                }
                Err(Ok(returned)) => conn = returned,
                Err(Err(_)) => unreachable!("sent a connection, got an error back"),
            }
        }
        Err(conn)
    }

    /// Fail the oldest waiter, if any.
    pub fn fail_waiter(&mut self, err: ConnError<C::Error>) {
        if let Some(waiter) = self.waiters.pop() {
            self.metrics
                .remove_time(MetricVariant::Waiting, waiter.waited());
            _ = waiter.send(Err(err));
        }
    }

    /// Fail every waiter.
    pub fn fail_all_waiters(&mut self, err: ConnError<C::Error>) {
        while !self.waiters.is_empty() {
            self.fail_waiter(err.clone());
        }
    }

    /// Check a connection in to the idle set.
    pub fn park(&mut self, mut conn: Conn<C>, now: Instant) {
        let held = self.check_in(conn.id(), now);
        conn.touch(now);
        self.idle.push_back(conn);
        self.metrics
            .transition(MetricVariant::Active, MetricVariant::Idle, held);
    }

    /// Check a connection in and mark it as disconnecting.
    pub fn retire(&mut self, conn: &Conn<C>, now: Instant) {
        let held = self.check_in(conn.id(), now);
        self.metrics
            .transition(MetricVariant::Active, MetricVariant::Disconnecting, held);
    }

    fn check_in(&mut self, id: ConnId, now: Instant) -> Duration {
        self.checked_out
            .remove(&id)
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }

    /// Verify that a connection is checked out before it is released. A
    /// second release of the same connection fails here.
    pub fn verify_checked_out(&self, id: ConnId) -> ConnResult<(), C::Error> {
        if self.is_checked_out(id) {
            Ok(())
        } else {
            error!("Connection {id} released but not checked out");
            Err(ConnError::InvariantViolation(
                format!("connection {id} is not checked out").into(),
            ))
        }
    }

    /// Mark the block for garbage collection if it is still unused.
    pub fn begin_drain(&mut self, now: Instant) -> bool {
        if matches!(self.state, BlockState::Draining | BlockState::Removed)
            || self.live() > 0
            || !self.waiters.is_empty()
            || !self.demand.is_zero()
        {
            return false;
        }
        self.state = BlockState::Draining;
        self.draining_since = Some(now);
        true
    }

    /// An acquire arrived while draining.
    pub fn cancel_drain(&mut self) {
        if self.state == BlockState::Draining {
            self.state = BlockState::Active;
            self.draining_since = None;
        }
    }

    /// Mark the block removed if it has finished draining.
    pub fn try_remove(&mut self, now: Instant, grace: Duration) -> bool {
        let drained = self
            .draining_since
            .is_some_and(|since| now.saturating_duration_since(since) >= grace);
        if self.state == BlockState::Draining
            && drained
            && self.live() == 0
            && self.waiters.is_empty()
        {
            self.state = BlockState::Removed;
            true
        } else {
            false
        }
    }

    fn refresh_state(&mut self, now: Instant) {
        if !matches!(self.state, BlockState::Draining | BlockState::Removed) {
            let established = self.idle.len() + self.checked_out.len();
            if established == 0 && self.connecting() > 0 {
                self.state = BlockState::Warming;
            } else if established > 0 || !self.waiters.is_empty() {
                self.state = BlockState::Active;
            } else if self.state == BlockState::Warming && self.live() == 0 {
                self.state = BlockState::Empty;
            }
        }
        if self.live() == 0 && self.waiters.is_empty() && self.demand.is_zero() {
            self.quiet_since.get_or_insert(now);
        } else {
            self.quiet_since = None;
        }
    }

    pub fn sample(
        &self,
        name: &Name,
        now: Instant,
        idle_timeout: Duration,
        max_lifetime: Option<Duration>,
        estimator: &EstimatorConfig,
    ) -> BlockSample {
        BlockSample {
            name: name.clone(),
            state: self.state,
            quota: self.quota,
            live: self.live(),
            idle: self.idle.len(),
            expired_idle: self
                .idle
                .iter()
                .filter(|conn| {
                    conn.idle_for(now) >= idle_timeout || conn.is_expired(max_lifetime, now)
                })
                .count(),
            waiting: self.waiters.len(),
            connecting: self.connecting(),
            demand: self.demand.effective(),
            oldest_wait: self.waiters.oldest(),
            quiet_for: self
                .quiet_since
                .map(|since| now.saturating_duration_since(since)),
            draining_for: self
                .draining_since
                .map(|since| now.saturating_duration_since(since)),
            in_backoff: self.demand.in_backoff(now, estimator),
            drain_locked: false,
        }
    }

    pub fn summary(&self) -> BlockMetrics {
        BlockMetrics {
            state: self.state,
            quota: self.quota,
            demand: self.demand.estimate(),
            failures: self.demand.failures(),
            ..self.metrics.summary()
        }
    }

    #[track_caller]
    fn check_consistency(&self, name: &Name) {
        if cfg!(debug_assertions) {
            assert_eq!(
                self.metrics.count(MetricVariant::Idle),
                self.idle.len(),
                "Block {name} failed consistency check: idle count was wrong"
            );
            assert_eq!(
                self.metrics.count(MetricVariant::Active),
                self.checked_out.len(),
                "Block {name} failed consistency check: checked-out count was wrong"
            );
            assert_eq!(
                self.metrics.count(MetricVariant::Waiting),
                self.waiters.len(),
                "Block {name} failed consistency check: waiter count was wrong"
            );
            assert!(
                self.idle.is_empty() || self.waiters.is_empty(),
                "Block {name} has both idle connections and waiters"
            );
            for conn in &self.idle {
                assert!(
                    !self.checked_out.contains_key(&conn.id()),
                    "Block {name}: {conn:?} is both idle and checked out"
                );
            }
        }
    }
}

/// Manages the connection state for a single target.
///
/// This is only a set of connections and waiters, and does not understand
/// policy, capacity or balancing. Higher layers make decisions and apply them
/// through [`Block::with`], which holds the block's lock for the duration of
/// the closure and keeps the block's derived state current.
pub struct Block<C: Connector> {
    pub name: Name,
    inner: Mutex<BlockInner<C>>,
    starved: AtomicBool,
    /// The number of starved blocks, shared by every block in the pool.
    starved_count: Arc<AtomicUsize>,
}

impl<C: Connector> Block<C> {
    fn new(name: Name, initial_demand: f64, starved_count: Arc<AtomicUsize>) -> Self {
        Self {
            name,
            inner: Mutex::new(BlockInner::new(initial_demand, Instant::now())),
            starved: AtomicBool::new(false),
            starved_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the block locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut BlockInner<C>) -> T) -> T {
        let mut inner = self.lock();
        let res = f(&mut inner);
        inner.refresh_state(Instant::now());
        let starved = inner.is_starved();
        if self.starved.swap(starved, Ordering::AcqRel) != starved {
            if starved {
                self.starved_count.fetch_add(1, Ordering::AcqRel);
            } else {
                self.starved_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        inner.check_consistency(&self.name);
        res
    }

    /// Does this block have waiters that are only blocked by global capacity?
    #[inline]
    pub fn is_starved(&self) -> bool {
        self.starved.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> BlockMetrics {
        self.with(|inner| inner.summary())
    }
}

/// The set of blocks in the pool, plus the pool-wide accounting shared
/// between them.
pub struct Blocks<C: Connector> {
    map: Mutex<HashMap<Name, Arc<Block<C>>>>,
    pub capacity: Capacity,
    starved_count: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
    /// All-time metrics of removed blocks.
    retired: Mutex<VariantArray<usize>>,
}

impl<C: Connector> Blocks<C> {
    pub fn new(max: usize) -> Self {
        Self {
            map: Mutex::default(),
            capacity: Capacity::new(max),
            starved_count: Arc::default(),
            next_conn_id: AtomicU64::new(0),
            retired: Mutex::default(),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Name, Arc<Block<C>>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a block, creating it if needed. Returns true if the block was
    /// created by this call.
    pub fn block(&self, name: &str, initial_demand: f64) -> (Arc<Block<C>>, bool) {
        let mut map = self.map();
        if let Some(block) = map.get(name) {
            return (block.clone(), false);
        }
        let name = Name::from(name);
        trace!("Creating block {name}");
        let block = Arc::new(Block::new(
            name.clone(),
            initial_demand,
            self.starved_count.clone(),
        ));
        map.insert(name, block.clone());
        (block, true)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Block<C>>> {
        self.map().get(name).cloned()
    }

    /// A snapshot of all blocks, sorted by name.
    pub fn snapshot(&self) -> Vec<Arc<Block<C>>> {
        let mut blocks: Vec<_> = self.map().values().cloned().collect();
        blocks.sort_by(|a, b| a.name.cmp(&b.name));
        blocks
    }

    pub fn block_count(&self) -> usize {
        self.map().len()
    }

    /// Remove a block if `f` agrees, with both the map and the block locked.
    pub fn remove_if(&self, name: &str, f: impl FnOnce(&mut BlockInner<C>) -> bool) -> bool {
        let mut map = self.map();
        let Some(block) = map.get(name).cloned() else {
            return false;
        };
        let all_time = block.with(|inner| f(inner).then(|| inner.metrics.all_time()));
        if let Some(all_time) = all_time {
            trace!("Removing block {name}");
            map.remove(name);
            *self.retired.lock().unwrap_or_else(PoisonError::into_inner) += all_time;
            true
        } else {
            false
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The number of blocks with waiters that are only blocked by global
    /// capacity.
    #[inline]
    pub fn starved(&self) -> usize {
        self.starved_count.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            capacity: self.capacity.max(),
            live: self.capacity.live(),
            all_time: *self.retired.lock().unwrap_or_else(PoisonError::into_inner),
            ..Default::default()
        };
        for block in self.snapshot() {
            let summary = block.summary();
            metrics.pool += summary.value;
            metrics.all_time += summary.all_time;
            metrics.blocks.insert(block.name.clone(), summary);
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use test_log::test;

    /// Tiny DSL to make the tests more readable.
    macro_rules! assert_block {
        ($block:ident has $($count:literal $type:ident),+) => {
            assert_eq!(
                $block.summary().value(),
                [$(VariantArray::with(MetricVariant::$type, $count)),+].into_iter().sum(),
                stringify!(Expected block has $($count $type),+)
            );
        };
        ($block:ident is empty) => {
            assert_eq!($block.summary().value(), VariantArray::default(), stringify!(Expected block is empty));
        };
    }

    fn block() -> (Blocks<BasicConnector>, Arc<Block<BasicConnector>>) {
        let blocks = Blocks::new(10);
        let (block, created) = blocks.block("db", 1.0);
        assert!(created);
        (blocks, block)
    }

    /// Open a connection through the block's accounting.
    fn open(blocks: &Blocks<BasicConnector>, block: &Block<BasicConnector>) -> Conn<BasicConnector> {
        let conn = Conn::new(blocks.next_conn_id(), 0, Instant::now());
        block.with(|inner| {
            assert!(blocks.capacity.try_reserve());
            inner.begin_open();
            inner.finish_open(&conn, Duration::ZERO, Instant::now());
        });
        conn
    }

    #[test]
    fn test_capacity() {
        let capacity = Capacity::new(2);
        assert!(capacity.try_reserve());
        assert!(capacity.try_reserve());
        assert!(!capacity.try_reserve());
        assert!(capacity.is_full());
        capacity.release::<()>().unwrap();
        assert!(capacity.try_reserve());
        capacity.release::<()>().unwrap();
        capacity.release::<()>().unwrap();
        assert!(matches!(
            capacity.release::<()>(),
            Err(ConnError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_block_lifecycle() -> Result<()> {
        let (blocks, block) = block();
        assert_block!(block is empty);
        assert_eq!(block.with(|inner| inner.state()), BlockState::Empty);
        block.with(|inner| inner.begin_open());
        assert_block!(block has 1 Connecting);
        assert_eq!(block.with(|inner| inner.state()), BlockState::Warming);
        let conn = Conn::new(blocks.next_conn_id(), 0, Instant::now());
        block.with(|inner| inner.finish_open(&conn, Duration::ZERO, Instant::now()));
        assert_block!(block has 1 Active);
        assert_eq!(block.with(|inner| inner.state()), BlockState::Active);
        block.with(|inner| inner.park(conn, Instant::now()));
        assert_block!(block has 1 Idle);
        let conn = block
            .with(|inner| inner.take_idle(IdleEnd::MostRecent, false, Instant::now()))
            .unwrap();
        assert_block!(block has 1 Disconnecting);
        drop(conn);
        block.with(|inner| inner.finish_close(Duration::ZERO));
        assert_block!(block is empty);
        assert_eq!(
            block.summary().all_time(),
            [
                VariantArray::with(MetricVariant::Connecting, 1),
                VariantArray::with(MetricVariant::Active, 1),
                VariantArray::with(MetricVariant::Idle, 1),
                VariantArray::with(MetricVariant::Disconnecting, 1),
                VariantArray::with(MetricVariant::Closed, 1),
            ]
            .into_iter()
            .sum()
        );
        Ok(())
    }

    #[test]
    fn test_double_release_rejected() {
        let (blocks, block) = block();
        let conn = open(&blocks, &block);
        let id = conn.id();
        block.with(|inner| {
            assert!(inner.verify_checked_out(id).is_ok());
            inner.park(conn, Instant::now());
            assert!(matches!(
                inner.verify_checked_out(id),
                Err(ConnError::InvariantViolation(_))
            ));
        });
        assert_block!(block has 1 Idle);
    }

    #[test]
    fn test_hand_off_fifo() -> Result<()> {
        let (blocks, block) = block();
        let conn = open(&blocks, &block);
        let (_, mut rx1) = block.with(|inner| inner.push_waiter());
        let (_, mut rx2) = block.with(|inner| inner.push_waiter());
        assert_block!(block has 2 Waiting, 1 Active);
        let id = conn.id();
        block.with(|inner| inner.hand_off(conn, Instant::now())).unwrap();
        assert_block!(block has 1 Waiting, 1 Active);
        let conn = rx1.try_recv()??;
        assert_eq!(conn.id(), id);
        assert!(rx2.try_recv().is_err());
        block.with(|inner| inner.hand_off(conn, Instant::now())).unwrap();
        let conn = rx2.try_recv()??;
        assert_block!(block has 1 Active);
        assert!(block.with(|inner| inner.hand_off(conn, Instant::now())).is_err());
        Ok(())
    }

    #[test]
    fn test_hand_off_skips_departed_waiter() -> Result<()> {
        let (blocks, block) = block();
        let conn = open(&blocks, &block);
        let (_, rx1) = block.with(|inner| inner.push_waiter());
        let (_, mut rx2) = block.with(|inner| inner.push_waiter());
        drop(rx1);
        block.with(|inner| inner.hand_off(conn, Instant::now())).unwrap();
        assert!(rx2.try_recv()?.is_ok());
        assert_block!(block has 1 Active);
        Ok(())
    }

    #[test]
    fn test_remove_waiter() {
        let (_blocks, block) = block();
        let (id, _rx) = block.with(|inner| inner.push_waiter());
        assert_block!(block has 1 Waiting);
        assert!(block.with(|inner| inner.remove_waiter(id)));
        assert!(!block.with(|inner| inner.remove_waiter(id)));
        assert_block!(block is empty);
    }

    #[test]
    fn test_fail_waiters() -> Result<()> {
        let (_blocks, block) = block();
        let (_, mut rx1) = block.with(|inner| inner.push_waiter());
        let (_, mut rx2) = block.with(|inner| inner.push_waiter());
        block.with(|inner| inner.fail_all_waiters(ConnError::PoolClosed));
        assert!(matches!(rx1.try_recv()?, Err(ConnError::PoolClosed)));
        assert!(matches!(rx2.try_recv()?, Err(ConnError::PoolClosed)));
        assert_block!(block is empty);
        Ok(())
    }

    #[test]
    fn test_starved_tracking() {
        let (blocks, block) = block();
        let (_, _rx) = block.with(|inner| inner.push_waiter());
        assert!(!block.is_starved());
        block.with(|inner| inner.set_quota(1));
        assert!(block.is_starved());
        assert_eq!(blocks.starved(), 1);
        block.with(|inner| inner.set_quota(0));
        assert_eq!(blocks.starved(), 0);
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_gc_lifecycle() {
        let config = EstimatorConfig::default();
        let (blocks, block) = block();
        block.with(|inner| inner.tick(Instant::now(), &config));
        // Still has its initial demand
        assert!(!block.with(|inner| inner.begin_drain(Instant::now())));
        tokio::time::sleep(Duration::from_secs(60)).await;
        block.with(|inner| inner.tick(Instant::now(), &config));
        assert!(block.with(|inner| inner.begin_drain(Instant::now())));
        assert_eq!(block.with(|inner| inner.state()), BlockState::Draining);

        // An acquire cancels the drain
        block.with(|inner| inner.cancel_drain());
        assert_eq!(block.with(|inner| inner.state()), BlockState::Active);
        assert!(block.with(|inner| inner.begin_drain(Instant::now())));

        let grace = Duration::from_secs(1);
        assert!(!blocks.remove_if("db", |inner| inner.try_remove(Instant::now(), grace)));
        tokio::time::sleep(grace).await;
        assert!(blocks.remove_if("db", |inner| inner.try_remove(Instant::now(), grace)));
        assert_eq!(block.with(|inner| inner.state()), BlockState::Removed);
        assert!(blocks.get("db").is_none());
        assert_eq!(blocks.block_count(), 0);
    }

    #[test]
    fn test_summary_includes_removed() {
        let (blocks, block) = block();
        let conn = open(&blocks, &block);
        block.with(|inner| {
            inner.retire(&conn, Instant::now());
            inner.finish_close(Duration::ZERO);
        });
        blocks.capacity.release::<()>().unwrap();
        assert!(blocks.remove_if("db", |_| true));
        let summary = blocks.summary();
        assert_eq!(summary.blocks.len(), 0);
        assert_eq!(summary.all_time[MetricVariant::Closed], 1);
        assert_eq!(summary.live, 0);
    }
}
