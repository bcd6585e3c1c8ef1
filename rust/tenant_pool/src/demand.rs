//! Per-target demand estimation.
//!
//! The estimate tracks the concurrent need of a target (checked-out
//! connections plus waiters). It rises quickly toward observed need and decays
//! slowly when need falls, so a brief spike is absorbed without permanently
//! inflating the target's share and a sustained load is recognized within a
//! few observations.
use crate::time::Instant;
use std::time::Duration;

/// Estimates under this value with no observed need are treated as zero.
const ZERO_DEMAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, smart_default::SmartDefault)]
pub struct EstimatorConfig {
    /// Fraction of the gap closed when observed need exceeds the estimate.
    #[default = 0.5]
    pub rise: f64,
    /// Time for the excess of the estimate over observed need to halve.
    #[default(Duration::from_secs(1))]
    pub decay_half_life: Duration,
    /// Connections held for less than this count as short holds.
    #[default(Duration::from_millis(5))]
    pub short_hold: Duration,
    /// Fraction of the excess shed on a short-hold release.
    #[default = 0.1]
    pub short_hold_decay: f64,
    /// Added to the estimate each time a waiter times out.
    #[default = 1.0]
    pub timeout_boost: f64,
    /// After a backend failure, the balancer will not open connections for the
    /// target on behalf of waiters until this much time has passed.
    #[default(Duration::from_millis(100))]
    pub failure_backoff: Duration,
    /// The demand a target starts with when first seen.
    #[default = 1.0]
    pub initial_demand: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DemandEvent {
    /// An acquire had to wait.
    Waited,
    /// An acquire was satisfied without waiting.
    Immediate,
    /// A connection was returned after being held for the given time.
    Released { held: Duration },
    /// A waiter gave up.
    TimedOut,
    /// The backend accepted a new connection.
    Connected,
    /// The backend refused a new connection.
    Failed,
}

#[derive(Debug, Clone)]
pub struct DemandEstimator {
    estimate: f64,
    last: Instant,
    failures: u32,
    last_failure: Option<Instant>,
}

impl DemandEstimator {
    pub fn new(initial: f64, now: Instant) -> Self {
        Self {
            estimate: initial.max(0.0),
            last: now,
            failures: 0,
            last_failure: None,
        }
    }

    /// The raw estimate of concurrent need.
    #[inline]
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// The demand reported to the balancer. Consecutive backend failures
    /// depress it so that a dead target stops attracting capacity.
    pub fn effective(&self) -> f64 {
        self.estimate / (1 + self.failures) as f64
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.estimate == 0.0
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn in_backoff(&self, now: Instant, config: &EstimatorConfig) -> bool {
        self.last_failure.is_some_and(|last| {
            self.failures > 0 && now.saturating_duration_since(last) < config.failure_backoff
        })
    }

    /// Record an event, given the need (checked out + waiting) observed after
    /// the event took effect.
    pub fn observe(
        &mut self,
        event: DemandEvent,
        need: usize,
        now: Instant,
        config: &EstimatorConfig,
    ) {
        let need = need as f64;
        self.decay_toward(need, now, config);
        match event {
            DemandEvent::Waited | DemandEvent::Immediate => self.rise_toward(need, config),
            DemandEvent::Released { held } => {
                if held < config.short_hold && self.estimate > need {
                    self.estimate = need + (self.estimate - need) * (1.0 - config.short_hold_decay);
                }
            }
            DemandEvent::TimedOut => {
                self.estimate = self.estimate.max(need) + config.timeout_boost;
            }
            DemandEvent::Connected => {
                self.failures = 0;
            }
            DemandEvent::Failed => {
                self.failures = self.failures.saturating_add(1);
                self.last_failure = Some(now);
            }
        }
        self.snap(need);
    }

    /// Periodic update from the balancer.
    pub fn tick(&mut self, need: usize, now: Instant, config: &EstimatorConfig) {
        let need = need as f64;
        self.decay_toward(need, now, config);
        self.rise_toward(need, config);
        self.snap(need);
    }

    fn rise_toward(&mut self, need: f64, config: &EstimatorConfig) {
        if need > self.estimate {
            self.estimate += config.rise * (need - self.estimate);
        }
    }

    fn decay_toward(&mut self, need: f64, now: Instant, config: &EstimatorConfig) {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        if self.estimate > need {
            let half_life = config.decay_half_life.as_secs_f64().max(f64::EPSILON);
            let halves = elapsed.as_secs_f64() / half_life;
            self.estimate = need + (self.estimate - need) * 0.5_f64.powf(halves);
        }
    }

    fn snap(&mut self, need: f64) {
        if need == 0.0 && self.estimate < ZERO_DEMAND {
            self.estimate = 0.0;
        }
    }
}
