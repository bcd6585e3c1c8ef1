use crate::{
    algo::{GcPolicy, PoolConstraints, RebalanceOp, ReleaseOp, ReleaseState, ReleaseType},
    block::{Block, BlockInner, BlockState, Blocks, Checkout, Delivery, IdleEnd},
    conn::{Conn, ConnError, ConnId, ConnResult, Connector},
    demand::{DemandEvent, EstimatorConfig},
    drain::Drain,
    metrics::{BlockMetrics, MetricVariant, PoolMetrics},
    time::Instant,
    waitqueue::WaiterId,
};
use consume_on_drop::{Consume, ConsumeOnDrop};
use itertools::Itertools;
use scopeguard::ScopeGuard;
use std::{
    cell::Cell,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, trace, warn};

/// How often `drain` and `shutdown` poll for progress.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Acquire timeouts are capped at roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Pool capacity must be greater than zero")]
    ZeroCapacity,
    #[error("Minimum quota must be greater than zero")]
    ZeroMinQuota,
    #[error("Minimum quota {min_quota} exceeds pool capacity {max}")]
    MinQuotaExceedsCapacity { min_quota: usize, max: usize },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{name} must be within (0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub constraints: PoolConstraints,
    /// How often the balancer runs when nothing wakes it.
    pub adjustment_interval: Duration,
    /// How long a target must go unused before it is garbage collected.
    pub min_idle_time_for_gc: Duration,
    /// How long a garbage-collected target lingers in the draining state.
    pub gc_grace: Duration,
    /// Idle connections unused for this long are closed.
    pub idle_timeout: Duration,
    /// Connections older than this are closed rather than reused. The
    /// connector's own limit applies as well.
    pub max_lifetime: Option<Duration>,
    /// A hard cap on idle connections per target.
    pub max_idle_per_block: Option<usize>,
    /// Without a hard cap, a target keeps at most this many times its quota
    /// idle.
    pub idle_multiplier: usize,
    pub estimator: EstimatorConfig,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let PoolConstraints { max, min_quota } = self.constraints;
        if max == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if min_quota == 0 {
            return Err(ConfigError::ZeroMinQuota);
        }
        if min_quota > max {
            return Err(ConfigError::MinQuotaExceedsCapacity { min_quota, max });
        }
        for (name, duration) in [
            ("adjustment_interval", self.adjustment_interval),
            ("idle_timeout", self.idle_timeout),
            ("estimator.decay_half_life", self.estimator.decay_half_life),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        for (name, value) in [
            ("estimator.rise", self.estimator.rise),
            ("estimator.short_hold_decay", self.estimator.short_hold_decay),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange { name, value });
            }
        }
        Ok(())
    }

    pub fn assert_valid(&self) {
        if let Err(err) = self.validate() {
            panic!("Invalid pool configuration: {err}");
        }
    }

    /// Generate suggested default configurations for the expected number of
    /// connections.
    pub fn suggested_default_for(connections: usize) -> Self {
        Self {
            constraints: PoolConstraints {
                max: connections,
                min_quota: 1,
            },
            adjustment_interval: Duration::from_millis(10),
            min_idle_time_for_gc: Duration::from_secs(120),
            gc_grace: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: None,
            max_idle_per_block: None,
            idle_multiplier: 2,
            estimator: EstimatorConfig::default(),
        }
    }

    pub fn with_min_quota(mut self, min_quota: usize) -> Self {
        self.constraints.min_quota = min_quota;
        self
    }

    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    pub fn with_min_idle_time_for_gc(mut self, min_idle_time_for_gc: Duration) -> Self {
        self.min_idle_time_for_gc = min_idle_time_for_gc;
        self
    }

    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = Some(max_lifetime);
        self
    }

    pub fn with_max_idle_per_block(mut self, max_idle: usize) -> Self {
        self.max_idle_per_block = Some(max_idle);
        self
    }

    pub fn with_estimator(mut self, estimator: EstimatorConfig) -> Self {
        self.estimator = estimator;
        self
    }

    /// The most idle connections a target with the given quota may keep.
    pub fn idle_cap(&self, quota: usize) -> usize {
        self.max_idle_per_block
            .unwrap_or_else(|| (quota * self.idle_multiplier).max(1))
    }

    fn gc_policy(&self) -> GcPolicy {
        GcPolicy {
            min_idle_time_for_gc: self.min_idle_time_for_gc,
            grace: self.gc_grace,
        }
    }
}

struct HandleAndPool<C: Connector> {
    conn: Conn<C>,
    block: Arc<Block<C>>,
    pool: Arc<Pool<C>>,
    poisoned: Cell<bool>,
}

impl<C: Connector> Consume for HandleAndPool<C> {
    fn consume(self) {
        let HandleAndPool {
            conn,
            block,
            pool,
            poisoned,
        } = self;
        pool.release_conn(&block, conn, poisoned.get())
    }
}

/// An exclusive lease on a pooled connection. Dropping the handle returns
/// the connection to the pool, so a connection can only be released once.
pub struct PoolHandle<C: Connector> {
    conn: ConsumeOnDrop<HandleAndPool<C>>,
}

impl<C: Connector> std::fmt::Debug for PoolHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PoolHandle({}, {:?})", self.conn.block.name, self.conn.conn))
    }
}

impl<C: Connector> PoolHandle<C> {
    fn new(conn: Conn<C>, block: Arc<Block<C>>, pool: Arc<Pool<C>>) -> Self {
        Self {
            conn: ConsumeOnDrop::new(HandleAndPool {
                conn,
                block,
                pool,
                poisoned: Cell::new(false),
            }),
        }
    }

    /// Mark this connection as broken. It will be closed rather than reused
    /// when the handle is dropped.
    pub fn poison(&self) {
        self.conn.poisoned.set(true)
    }

    pub fn is_poisoned(&self) -> bool {
        self.conn.poisoned.get()
    }

    pub fn id(&self) -> ConnId {
        self.conn.conn.id()
    }

    /// The target this connection belongs to.
    pub fn target(&self) -> &str {
        &self.conn.block.name
    }

    pub fn with_handle<T>(&self, f: impl FnOnce(&C::Conn) -> T) -> T {
        f(self.conn.conn.handle())
    }
}

impl<C: Connector> PoolHandle<C>
where
    C::Conn: Copy,
{
    pub fn handle(&self) -> C::Conn {
        *self.conn.conn.handle()
    }
}

impl<C: Connector> PoolHandle<C>
where
    C::Conn: Clone,
{
    pub fn handle_clone(&self) -> C::Conn {
        self.conn.conn.handle().clone()
    }
}

/// A multi-tenant connection pool.
///
/// Every target gets a block of connections. The pool enforces a hard cap on
/// live connections across all blocks and divides that cap between the
/// blocks in proportion to their estimated demand, so that a busy target
/// cannot permanently starve a quiet one.
///
/// Acquires are served from the block's idle connections, or by opening a
/// new connection while the block is under its quota. Otherwise the caller
/// waits in the block's FIFO queue until a connection is released to it or
/// the balancer moves capacity in its direction.
///
/// The balancer (see [`Pool::run`]) periodically recomputes quotas, trims
/// idle connections, moves capacity from blocks over quota to starved
/// blocks and garbage collects unused blocks. Quotas are also recomputed
/// inline whenever a block appears or a waiter finds itself without quota.
#[derive(derive_more::Debug)]
pub struct Pool<C: Connector> {
    connector: C,
    config: PoolConfig,
    #[debug(skip)]
    blocks: Blocks<C>,
    drain: Drain,
    #[debug(skip)]
    rebalance: Notify,
    /// Serializes quota updates so the quotas of a snapshot never overlap
    /// with another.
    #[debug(skip)]
    quotas: Mutex<()>,
}

impl<C: Connector> Pool<C> {
    pub fn new(config: PoolConfig, connector: C) -> Arc<Self> {
        config.assert_valid();
        debug!("Creating pool with {} connections", config.constraints.max);
        Arc::new(Self {
            blocks: Blocks::new(config.constraints.max),
            config,
            connector,
            drain: Drain::default(),
            rebalance: Notify::new(),
            quotas: Mutex::default(),
        })
    }

    /// Like [`Pool::new`], but reports an invalid configuration instead of
    /// panicking.
    pub fn try_new(config: PoolConfig, connector: C) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::new(config, connector))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_closed(&self) -> bool {
        self.drain.in_shutdown()
    }

    /// Has the pool closed every connection?
    pub fn idle(&self) -> bool {
        self.blocks.capacity.live() == 0
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.blocks.summary()
    }

    pub fn target_metrics(&self, target: &str) -> Option<BlockMetrics> {
        self.blocks.get(target).map(|block| block.summary())
    }

    fn estimator(&self) -> &EstimatorConfig {
        &self.config.estimator
    }

    fn max_lifetime(&self) -> Option<Duration> {
        match (self.config.max_lifetime, self.connector.max_lifetime()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn release_capacity(&self) {
        // Underflow is logged by the capacity itself.
        _ = self.blocks.capacity.release::<C::Error>();
    }

    /// Run the balancer until the pool is closed and every connection has
    /// been closed.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.adjustment_interval) => {}
                _ = self.rebalance.notified() => {}
            }
            if self.is_closed() && self.idle() {
                debug!("Pool closed and idle, stopping balancer");
                break;
            }
            self.run_once();
        }
    }

    /// Run a single balancer pass.
    pub fn run_once(self: &Arc<Self>) {
        if self.blocks.block_count() == 0 {
            return;
        }
        let now = Instant::now();
        let max_lifetime = self.max_lifetime();
        let blocks = self.recalculate_quotas(true);
        let samples = blocks
            .iter()
            .map(|block| {
                let mut sample = block.with(|inner| {
                    inner.sample(
                        &block.name,
                        now,
                        self.config.idle_timeout,
                        max_lifetime,
                        self.estimator(),
                    )
                });
                sample.drain_locked =
                    self.drain.are_any_draining() && self.drain.is_draining(&block.name);
                sample
            })
            .collect_vec();

        if tracing::enabled!(tracing::Level::TRACE) {
            let s = samples
                .iter()
                .map(|s| format!("{}={}/{}", s.name, s.live, s.quota))
                .join(" ");
            trace!(
                "Blocks {}/{}: {s}",
                self.blocks.capacity.live(),
                self.blocks.capacity.max()
            );
        }

        let ops = self.config.constraints.plan_rebalance(
            &samples,
            self.blocks.capacity.live(),
            &self.config.gc_policy(),
        );
        let mut removed = false;
        for op in ops {
            trace!("Rebalance: {op:?}");
            match op {
                RebalanceOp::Admit(name) => {
                    if let Some(block) = self.blocks.get(&name) {
                        self.try_admit(&block);
                    }
                }
                RebalanceOp::CloseIdle(name) => {
                    if let Some(block) = self.blocks.get(&name) {
                        self.close_idle(&block, 1);
                    }
                }
                RebalanceOp::Drain(name) => {
                    if let Some(block) = self.blocks.get(&name) {
                        if block.with(|inner| inner.begin_drain(now)) {
                            debug!("Garbage collecting {name}");
                        }
                    }
                }
                RebalanceOp::Remove(name) => {
                    let grace = self.config.gc_grace;
                    if self
                        .blocks
                        .remove_if(&name, |inner| inner.try_remove(now, grace))
                    {
                        debug!("Removed {name}");
                        removed = true;
                    }
                }
            }
        }
        if removed {
            self.recalculate_quotas(false);
            self.admit_waiters();
        }
    }

    /// Divide capacity between the blocks by their current demand. If `tick`
    /// is set, the demand estimators are advanced first.
    fn recalculate_quotas(&self, tick: bool) -> Vec<Arc<Block<C>>> {
        let _lock = self.quotas.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let blocks = self.blocks.snapshot();
        let demands = blocks
            .iter()
            .map(|block| {
                let demand = block.with(|inner| {
                    if tick {
                        inner.tick(now, self.estimator());
                    }
                    inner.demand().effective()
                });
                (block.name.clone(), demand)
            })
            .collect_vec();
        let quotas = self.config.constraints.allocate(&demands);
        for (block, quota) in blocks.iter().zip(quotas) {
            block.with(|inner| inner.set_quota(quota));
        }
        blocks
    }

    /// Acquire a connection to `target`, waiting at most `timeout`.
    pub async fn acquire(
        self: &Arc<Self>,
        target: &str,
        timeout: Duration,
    ) -> ConnResult<PoolHandle<C>, C::Error> {
        let deadline = Instant::now() + timeout.min(FAR_FUTURE);
        loop {
            if self.is_closed() {
                return Err(ConnError::PoolClosed);
            }
            let (block, created) = self
                .blocks
                .block(target, self.estimator().initial_demand);
            if created {
                self.recalculate_quotas(false);
            }
            let now = Instant::now();
            let mut stale = vec![];
            let checkout = block.with(|inner| self.checkout(inner, now, &mut stale));
            for conn in stale {
                self.close_conn(&block, conn);
            }
            match checkout {
                Checkout::Removed => {
                    trace!("Block {target} was removed, retrying");
                    continue;
                }
                Checkout::Closed => return Err(ConnError::PoolClosed),
                Checkout::Ready(conn) => {
                    trace!("Acquired idle {conn:?} for {target}");
                    return Ok(PoolHandle::new(conn, block, self.clone()));
                }
                Checkout::Open => {
                    trace!("Opening a connection for {target}");
                    return self.open(block, deadline).await;
                }
                Checkout::Wait { id, rx, no_quota } => {
                    trace!("Waiting for a connection for {target}");
                    if no_quota {
                        self.recalculate_quotas(false);
                        self.admit_waiters();
                    } else {
                        while self.try_admit(&block) {}
                        self.rebalance.notify_one();
                    }
                    return self.wait(block, id, rx, deadline).await;
                }
            }
        }
    }

    /// Equivalent to dropping the handle.
    pub fn release(&self, handle: PoolHandle<C>) {
        drop(handle)
    }

    fn checkout(
        &self,
        inner: &mut BlockInner<C>,
        now: Instant,
        stale: &mut Vec<Conn<C>>,
    ) -> Checkout<C> {
        if self.is_closed() {
            return Checkout::Closed;
        }
        match inner.state() {
            BlockState::Removed => return Checkout::Removed,
            BlockState::Draining => {
                debug!("Acquire cancelled garbage collection");
                inner.cancel_drain();
            }
            _ => {}
        }
        let max_lifetime = self.max_lifetime();
        while let Some(conn) = inner.peek_idle(IdleEnd::MostRecent) {
            let reusable =
                !conn.is_expired(max_lifetime, now) && self.connector.is_healthy(conn.handle());
            let Some(conn) = inner.take_idle(IdleEnd::MostRecent, reusable, now) else {
                break;
            };
            if reusable {
                inner.observe(DemandEvent::Immediate, now, self.estimator());
                return Checkout::Ready(conn);
            }
            trace!("Discarding stale {conn:?}");
            stale.push(conn);
        }
        // Older waiters come first. The caller queues behind them and
        // admission opens connections on their behalf.
        if inner.waiting() == 0
            && inner.live() < inner.quota()
            && self.blocks.capacity.try_reserve()
        {
            inner.begin_open();
            return Checkout::Open;
        }
        let no_quota = inner.quota() == 0;
        let (id, rx) = inner.push_waiter();
        inner.observe(DemandEvent::Waited, now, self.estimator());
        Checkout::Wait { id, rx, no_quota }
    }

    /// Open a connection on behalf of the caller. Capacity has already been
    /// reserved.
    async fn open(
        self: &Arc<Self>,
        block: Arc<Block<C>>,
        deadline: Instant,
    ) -> ConnResult<PoolHandle<C>, C::Error> {
        let started = Instant::now();
        let guard = scopeguard::guard((), |_| {
            trace!("Abandoned open for {}", block.name);
            self.abandon_open(&block, started.elapsed(), None);
        });
        let res = tokio::time::timeout(
            deadline.saturating_duration_since(started),
            self.connector.connect(&block.name),
        )
        .await;
        ScopeGuard::into_inner(guard);

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(started);
        match res {
            Ok(Ok(handle)) => {
                let conn = Conn::new(self.blocks.next_conn_id(), handle, now);
                trace!("Opened {conn:?} for {}", block.name);
                block.with(|inner| {
                    inner.finish_open(&conn, elapsed, now);
                    inner.observe(DemandEvent::Connected, now, self.estimator());
                    inner.observe(DemandEvent::Immediate, now, self.estimator());
                });
                let handle = PoolHandle::new(conn, block, self.clone());
                if self.is_closed() {
                    return Err(ConnError::PoolClosed);
                }
                Ok(handle)
            }
            Ok(Err(err)) => {
                debug!("Failed to connect to {}: {err:?}", block.name);
                self.abandon_open(&block, elapsed, Some(DemandEvent::Failed));
                Err(ConnError::BackendUnavailable(err))
            }
            Err(_) => {
                trace!("Timed out connecting to {}", block.name);
                self.abandon_open(&block, elapsed, Some(DemandEvent::TimedOut));
                Err(ConnError::PoolTimeout)
            }
        }
    }

    fn abandon_open(
        self: &Arc<Self>,
        block: &Arc<Block<C>>,
        elapsed: Duration,
        event: Option<DemandEvent>,
    ) {
        let now = Instant::now();
        block.with(|inner| {
            inner.fail_open(elapsed);
            if let Some(event) = event {
                inner.observe(event, now, self.estimator());
            }
            self.release_capacity();
        });
        self.admit_waiters();
    }

    async fn wait(
        self: &Arc<Self>,
        block: Arc<Block<C>>,
        id: WaiterId,
        rx: oneshot::Receiver<Delivery<C>>,
        deadline: Instant,
    ) -> ConnResult<PoolHandle<C>, C::Error> {
        let mut guard = scopeguard::guard(rx, |rx| self.abandon_wait(&block, id, rx));
        let remaining = deadline.saturating_duration_since(Instant::now());
        let res = tokio::time::timeout(remaining, &mut *guard).await;
        let mut rx = ScopeGuard::into_inner(guard);

        let delivery = match res {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => return Err(self.lost_waiter(&block)),
            Err(_) => {
                let now = Instant::now();
                // Fulfillment happens under the block lock, so once we hold
                // the lock either the waiter is still queued or the value is
                // already in the channel.
                let timed_out = block.with(|inner| {
                    let removed = inner.remove_waiter(id);
                    if removed {
                        inner.observe(DemandEvent::TimedOut, now, self.estimator());
                    }
                    removed
                });
                if timed_out {
                    trace!("Timed out waiting for {}", block.name);
                    self.rebalance.notify_one();
                    return Err(ConnError::PoolTimeout);
                }
                match rx.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => return Err(self.lost_waiter(&block)),
                }
            }
        };
        delivery.map(|conn| PoolHandle::new(conn, block, self.clone()))
    }

    fn lost_waiter(&self, block: &Block<C>) -> ConnError<C::Error> {
        error!("Waiter for {} was dropped without a value", block.name);
        ConnError::InvariantViolation("waiter dropped without a value".into())
    }

    /// The caller went away while waiting. If a connection was delivered in
    /// the meantime, it goes back to the pool.
    fn abandon_wait(
        self: &Arc<Self>,
        block: &Arc<Block<C>>,
        id: WaiterId,
        mut rx: oneshot::Receiver<Delivery<C>>,
    ) {
        if block.with(|inner| inner.remove_waiter(id)) {
            trace!("Cancelled waiter for {}", block.name);
            return;
        }
        if let Ok(Ok(conn)) = rx.try_recv() {
            trace!("Returning {conn:?} delivered to a cancelled waiter");
            self.release_conn(block, conn, false);
        }
    }

    fn release_conn(self: &Arc<Self>, block: &Arc<Block<C>>, conn: Conn<C>, poisoned: bool) {
        let now = Instant::now();
        let held = block.with(|inner| {
            inner.verify_checked_out(conn.id())?;
            Ok::<_, ConnError<C::Error>>(inner.held_for(conn.id(), now).unwrap_or_default())
        });
        let Ok(held) = held else {
            // Already logged. The connection is not ours to account for.
            return;
        };

        let release_type = if self.drain.is_draining(&block.name) {
            ReleaseType::Drain
        } else if poisoned
            || conn.is_expired(self.max_lifetime(), now)
            || !self.connector.is_healthy(conn.handle())
        {
            ReleaseType::Poison
        } else {
            ReleaseType::Normal
        };
        trace!("Releasing {conn:?} to {} ({release_type:?})", block.name);
        self.settle(block, conn, release_type, Some(held));
    }

    /// Decide the fate of a checked-out connection that nobody holds: hand it
    /// to a waiter, park it or close it.
    fn settle(
        self: &Arc<Self>,
        block: &Arc<Block<C>>,
        conn: Conn<C>,
        release_type: ReleaseType,
        held: Option<Duration>,
    ) {
        let now = Instant::now();
        let pool_full = self.blocks.capacity.is_full();
        let to_close = block.with(|inner| {
            let mut conn = conn;
            let to_close = loop {
                let state = ReleaseState {
                    waiting: inner.waiting(),
                    live: inner.live(),
                    quota: inner.quota(),
                    idle: inner.idle(),
                    idle_cap: self.config.idle_cap(inner.quota()),
                    starving_elsewhere: self.blocks.starved() > usize::from(block.is_starved()),
                    pool_full,
                };
                match self.config.constraints.plan_release(release_type, &state) {
                    ReleaseOp::HandOff => match inner.hand_off(conn, now) {
                        Ok(()) => break None,
                        Err(returned) => conn = returned,
                    },
                    ReleaseOp::Keep => {
                        inner.park(conn, now);
                        break None;
                    }
                    ReleaseOp::Close => {
                        inner.retire(&conn, now);
                        break Some(conn);
                    }
                }
            };
            if let Some(held) = held {
                inner.observe(DemandEvent::Released { held }, now, self.estimator());
            }
            to_close
        });
        if let Some(conn) = to_close {
            self.close_conn(block, conn);
        }
    }

    /// Close a connection that is already accounted as disconnecting.
    fn close_conn(self: &Arc<Self>, block: &Arc<Block<C>>, conn: Conn<C>) {
        trace!("Closing {conn:?} for {}", block.name);
        let started = Instant::now();
        let disconnect = self.connector.disconnect(conn.into_handle());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.clone();
                let block = block.clone();
                runtime.spawn(async move {
                    if let Err(err) = disconnect.await {
                        debug!("Failed to disconnect from {}: {err:?}", block.name);
                    }
                    pool.finish_close(&block, started.elapsed());
                });
            }
            Err(_) => {
                warn!(
                    "No runtime to close a connection for {}, dropping it",
                    block.name
                );
                drop(disconnect);
                self.finish_close(block, Duration::ZERO);
            }
        }
    }

    fn finish_close(self: &Arc<Self>, block: &Arc<Block<C>>, elapsed: Duration) {
        block.with(|inner| {
            inner.finish_close(elapsed);
            self.release_capacity();
        });
        self.admit_waiters();
    }

    /// Close up to `max` idle connections of a block, least recently used
    /// first.
    fn close_idle(self: &Arc<Self>, block: &Arc<Block<C>>, max: usize) -> usize {
        let now = Instant::now();
        let conns = block.with(|inner| {
            std::iter::from_fn(|| inner.take_idle(IdleEnd::LeastRecent, false, now))
                .take(max)
                .collect_vec()
        });
        let count = conns.len();
        for conn in conns {
            self.close_conn(block, conn);
        }
        count
    }

    /// Capacity was freed: open connections for starved blocks, oldest
    /// waiter first.
    fn admit_waiters(self: &Arc<Self>) {
        if self.blocks.starved() == 0 || self.is_closed() {
            return;
        }
        let starved = self
            .blocks
            .snapshot()
            .into_iter()
            .filter(|block| block.is_starved())
            .map(|block| (block.with(|inner| inner.oldest_wait()), block))
            .sorted_by(|a, b| b.0.cmp(&a.0))
            .collect_vec();
        for (_, block) in starved {
            while self.try_admit(&block) {}
        }
    }

    /// Reserve capacity and start opening a connection for one of the
    /// block's waiters. Returns false if the block is not starved or there is
    /// no capacity.
    fn try_admit(self: &Arc<Self>, block: &Arc<Block<C>>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let now = Instant::now();
        let admitted = block.with(|inner| {
            if self.is_closed()
                || inner.state() == BlockState::Removed
                || !inner.is_starved()
                || inner.demand().in_backoff(now, self.estimator())
                || !self.blocks.capacity.try_reserve()
            {
                return false;
            }
            inner.begin_open();
            true
        });
        if admitted {
            trace!("Opening a connection for a waiter on {}", block.name);
            let connect = self.connector.connect(&block.name);
            let pool = self.clone();
            let block = block.clone();
            runtime.spawn(async move {
                let res = connect.await;
                let elapsed = now.elapsed();
                pool.finish_admit(&block, res, elapsed);
            });
        }
        admitted
    }

    fn finish_admit(
        self: &Arc<Self>,
        block: &Arc<Block<C>>,
        res: Result<C::Conn, C::Error>,
        elapsed: Duration,
    ) {
        let now = Instant::now();
        match res {
            Ok(handle) => {
                let conn = Conn::new(self.blocks.next_conn_id(), handle, now);
                trace!("Opened {conn:?} for a waiter on {}", block.name);
                block.with(|inner| {
                    inner.finish_open(&conn, elapsed, now);
                    inner.observe(DemandEvent::Connected, now, self.estimator());
                });
                let release_type = if self.is_closed() {
                    ReleaseType::Drain
                } else {
                    ReleaseType::Normal
                };
                self.settle(block, conn, release_type, None);
            }
            Err(err) => {
                debug!("Failed to connect to {}: {err:?}", block.name);
                block.with(|inner| {
                    inner.fail_open(elapsed);
                    inner.observe(DemandEvent::Failed, now, self.estimator());
                    inner.fail_waiter(ConnError::BackendUnavailable(err));
                    self.release_capacity();
                });
                self.admit_waiters();
            }
        }
    }

    /// Close the pool. Waiters fail with [`ConnError::PoolClosed`], idle
    /// connections are closed and checked-out connections are closed when
    /// they are released.
    pub fn close(self: &Arc<Self>) {
        if !self.drain.shutdown() {
            return;
        }
        debug!("Closing pool");
        let now = Instant::now();
        for block in self.blocks.snapshot() {
            let idle = block.with(|inner| {
                inner.fail_all_waiters(ConnError::PoolClosed);
                std::iter::from_fn(|| inner.take_idle(IdleEnd::LeastRecent, false, now))
                    .collect_vec()
            });
            for conn in idle {
                self.close_conn(&block, conn);
            }
        }
        self.rebalance.notify_one();
    }

    /// Close the pool and wait for every connection to be closed. This waits
    /// for outstanding handles to be released.
    pub async fn shutdown(self: Arc<Self>) {
        self.close();
        while !self.idle() {
            self.run_once();
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if cfg!(debug_assertions) {
            let all_time = self.metrics().all_time;
            assert_eq!(
                all_time[MetricVariant::Connecting],
                all_time[MetricVariant::Closed] + all_time[MetricVariant::Failed],
                "Every connection should have been closed or failed"
            );
        }
    }

    /// Close the idle connections of a target without waiting for the ones
    /// in use. Returns the number of connections closed.
    pub fn drain_idle(self: &Arc<Self>, target: &str) -> usize {
        self.blocks
            .get(target)
            .map(|block| self.close_idle(&block, usize::MAX))
            .unwrap_or_default()
    }

    /// Close every connection of a target. Connections in use are closed
    /// when they are released. Resolves once the target has no connections.
    pub async fn drain(self: &Arc<Self>, target: &str) {
        let Some(block) = self.blocks.get(target) else {
            return;
        };
        let _lock = self.drain.lock(block.name.clone());
        debug!("Draining {target}");
        loop {
            self.close_idle(&block, usize::MAX);
            if block.with(|inner| inner.live()) == 0 {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Drain every target.
    pub async fn drain_all(self: &Arc<Self>) {
        let _lock = self.drain.lock_all();
        let targets = self
            .blocks
            .snapshot()
            .into_iter()
            .map(|block| block.name.clone())
            .collect_vec();
        futures::future::join_all(targets.iter().map(|target| self.drain(target))).await;
        while !self.idle() {
            for block in self.blocks.snapshot() {
                self.close_idle(&block, usize::MAX);
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}
