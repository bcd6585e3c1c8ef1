use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;
use strum::EnumCount;
use strum::IntoEnumIterator;

use crate::block::{BlockState, Name};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumCount, strum::EnumIter, strum::AsRefStr,
)]
pub enum MetricVariant {
    Connecting,
    Disconnecting,
    Idle,
    Active,
    Failed,
    Closed,
    Waiting,
}

impl MetricVariant {
    /// Does a connection in this state count against block and pool capacity?
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(
            self,
            MetricVariant::Connecting
                | MetricVariant::Disconnecting
                | MetricVariant::Idle
                | MetricVariant::Active
        )
    }
}

/// Maintains a rolling average of `u32` values. Note that this struct attempts
/// to optimize `SIZE == 1`.
#[derive(Debug, PartialEq, Eq)]
pub struct RollingAverageU32<const SIZE: usize> {
    values: [u32; SIZE],
    cumulative: u64,
    ptr: u8,
    /// If we've never rolled over, we cannot divide the entire array by `SIZE`
    /// and have to use `ptr` instead.
    rollover: bool,
}

impl<const SIZE: usize> Default for RollingAverageU32<SIZE> {
    fn default() -> Self {
        assert!(SIZE <= u8::MAX as _);
        Self {
            values: [0; SIZE],
            ptr: 0,
            cumulative: 0,
            rollover: false,
        }
    }
}

impl<const SIZE: usize> RollingAverageU32<SIZE> {
    pub fn accum(&mut self, new: u32) {
        if SIZE == 1 {
            self.values[0] = new;
        } else {
            let size = SIZE as u8;
            let old = std::mem::replace(&mut self.values[self.ptr as usize], new);
            self.cumulative -= old as u64;
            self.cumulative += new as u64;
            self.ptr = (self.ptr + 1) % size;
            if self.ptr == 0 {
                self.rollover = true;
            }
        }
    }

    #[inline]
    pub fn avg(&self) -> u32 {
        if SIZE == 1 {
            self.values[0]
        } else if self.rollover {
            (self.cumulative / SIZE as u64) as u32
        } else if self.ptr == 0 {
            0
        } else {
            (self.cumulative / self.ptr as u64) as u32
        }
    }
}

/// A point-in-time view of the whole pool.
#[derive(Debug, Default, Serialize)]
pub struct PoolMetrics {
    /// Global capacity.
    pub capacity: usize,
    /// Live connections across all targets.
    pub live: usize,
    /// Connection counts per state, summed across targets.
    pub pool: VariantArray<usize>,
    /// All-time transitions, including targets that have since been removed.
    pub all_time: VariantArray<usize>,
    pub blocks: BTreeMap<Name, BlockMetrics>,
}

impl PoolMetrics {
    /// Sum of all quotas currently assigned.
    pub fn total_quota(&self) -> usize {
        self.blocks.values().map(|block| block.quota).sum()
    }
}

/// An array indexed by [`MetricVariant`].
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct VariantArray<T>([T; MetricVariant::COUNT]);

impl<T> Serialize for VariantArray<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> std::ops::Index<MetricVariant> for VariantArray<T> {
    type Output = T;
    fn index(&self, index: MetricVariant) -> &Self::Output {
        &self.0[index as usize]
    }
}

impl<T> std::ops::IndexMut<MetricVariant> for VariantArray<T> {
    fn index_mut(&mut self, index: MetricVariant) -> &mut Self::Output {
        &mut self.0[index as usize]
    }
}

impl<T: Copy + std::ops::AddAssign> std::ops::Add for VariantArray<T> {
    type Output = VariantArray<T>;
    fn add(self, rhs: Self) -> Self::Output {
        let mut out = self;
        out += rhs;
        out
    }
}

impl<T: Copy + std::ops::AddAssign> std::ops::AddAssign for VariantArray<T> {
    fn add_assign(&mut self, rhs: Self) {
        for i in MetricVariant::iter() {
            self[i] += rhs[i];
        }
    }
}

impl<T: Default + Copy + std::ops::AddAssign> std::iter::Sum for VariantArray<T> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let mut sum = Default::default();
        for i in iter {
            sum += i;
        }
        sum
    }
}

impl<T: std::fmt::Debug + std::cmp::Eq + Default> std::fmt::Debug for VariantArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("");
        for variant in MetricVariant::iter() {
            if self[variant] != T::default() {
                d.field(variant.as_ref(), &self[variant]);
            }
        }
        d.finish()
    }
}

impl<T: Copy + Default> VariantArray<T> {
    #[cfg(test)]
    pub fn with(variant: MetricVariant, count: T) -> Self {
        let mut summary = Self::default();
        summary[variant] = count;
        summary
    }
}

/// A point-in-time view of a single target.
#[derive(Default, Serialize)]
pub struct BlockMetrics {
    pub state: BlockState,
    /// Connections counted against capacity.
    pub live: usize,
    pub idle: usize,
    /// Checked-out connections.
    pub active: usize,
    pub connecting: usize,
    pub disconnecting: usize,
    pub waiting: usize,
    pub quota: usize,
    /// The current demand estimate.
    pub demand: f64,
    /// Consecutive backend failures.
    pub failures: u32,
    pub(crate) value: VariantArray<usize>,
    pub(crate) all_time: VariantArray<usize>,
    pub(crate) max: VariantArray<usize>,
    pub(crate) avg_time: VariantArray<u32>,
}

impl BlockMetrics {
    pub fn value(&self) -> VariantArray<usize> {
        self.value
    }

    pub fn all_time(&self) -> VariantArray<usize> {
        self.all_time
    }

    pub fn max(&self) -> VariantArray<usize> {
        self.max
    }
}

impl std::fmt::Debug for BlockMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "BlockMetrics {{ {}, quota={}, demand={:.2}, failures={}\n",
            self.state.as_ref(),
            self.quota,
            self.demand,
            self.failures
        ))?;
        for variant in MetricVariant::iter() {
            f.write_fmt(format_args!(
                "    {variant:?}: {} (max={}, avg={}ms)\n",
                self.value[variant], self.max[variant], self.avg_time[variant]
            ))?;
        }
        f.write_str("}")?;
        Ok(())
    }
}

/// Per-block connection accounting. Owned by the block and only touched
/// under the block's lock.
#[derive(Debug, Default)]
pub struct RawMetrics {
    /// The total number of live (non-waiting) connections.
    total: usize,
    /// The number of connections per state.
    counts: VariantArray<usize>,
    /// The total number of transitions into this state for all time.
    all_time: VariantArray<usize>,
    /// The max number of connections per state since the last reset.
    max: VariantArray<usize>,
    /// The time spent in each state.
    times: VariantArray<RollingAverageU32<32>>,
}

impl RawMetrics {
    #[inline(always)]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline(always)]
    pub fn count(&self, variant: MetricVariant) -> usize {
        self.counts[variant]
    }

    #[inline(always)]
    pub fn all_time(&self) -> VariantArray<usize> {
        self.all_time
    }

    #[inline(always)]
    pub fn reset_max(&mut self) {
        self.max = self.counts;
    }

    #[inline(always)]
    pub fn inc_all_time(&mut self, to: MetricVariant) {
        self.all_time[to] += 1;
    }

    #[inline(always)]
    fn inc(&mut self, to: MetricVariant) {
        self.counts[to] += 1;
        self.max[to] = self.max[to].max(self.counts[to]);
        self.inc_all_time(to);
        if to.is_live() {
            self.total += 1;
        }
    }

    #[inline(always)]
    fn dec(&mut self, from: MetricVariant, time: Duration) {
        debug_assert!(self.counts[from] > 0, "{from:?} underflow");
        self.counts[from] = self.counts[from].saturating_sub(1);
        self.times[from].accum(u32::try_from(time.as_millis()).unwrap_or(u32::MAX));
        if from.is_live() {
            self.total = self.total.saturating_sub(1);
        }
    }

    #[inline]
    pub fn insert(&mut self, to: MetricVariant) {
        self.inc(to);
    }

    #[inline]
    pub fn transition(&mut self, from: MetricVariant, to: MetricVariant, time: Duration) {
        self.dec(from, time);
        self.inc(to);
    }

    #[inline]
    pub fn remove_time(&mut self, from: MetricVariant, time: Duration) {
        self.dec(from, time);
    }

    pub fn summary(&self) -> BlockMetrics {
        let mut avg_time = VariantArray::default();
        for i in MetricVariant::iter() {
            avg_time[i] = self.times[i].avg();
        }
        BlockMetrics {
            live: self.total,
            idle: self.counts[MetricVariant::Idle],
            active: self.counts[MetricVariant::Active],
            connecting: self.counts[MetricVariant::Connecting],
            disconnecting: self.counts[MetricVariant::Disconnecting],
            waiting: self.counts[MetricVariant::Waiting],
            value: self.counts,
            all_time: self.all_time,
            max: self.max,
            avg_time,
            ..Default::default()
        }
    }
}
