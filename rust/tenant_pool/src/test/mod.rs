//! Test utilities.
use itertools::Itertools;
use rand::random;
use statrs::statistics::{Data, Distribution, OrderStatistics, Statistics};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::conn::Connector;

pub use workload::*;

/// Counters and failure switches shared between a [`BasicConnector`] and the
/// connections it opens.
#[derive(Debug, Default)]
pub struct ConnectorState {
    next_id: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_next_connect: AtomicBool,
    fail_next_disconnect: AtomicBool,
    failing: Mutex<HashSet<String>>,
    unhealthy: Mutex<HashSet<u64>>,
}

impl ConnectorState {
    /// Connections currently open on the backend.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// The most connections ever open on the backend at once.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_disconnect(&self) {
        self.fail_next_disconnect.store(true, Ordering::SeqCst);
    }

    /// Make every connect to `target` fail until cleared.
    pub fn fail_target(&self, target: &str, failing: bool) {
        let mut targets = self.failing.lock().unwrap();
        if failing {
            targets.insert(target.to_owned());
        } else {
            targets.remove(target);
        }
    }

    pub fn mark_unhealthy(&self, conn: u64) {
        self.unhealthy.lock().unwrap().insert(conn);
    }

    fn is_failing(&self, target: &str) -> bool {
        self.failing.lock().unwrap().contains(target)
    }

    fn connected(&self) -> u64 {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn disconnected(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A connector for tests. Connections are plain ids, and connect and
/// disconnect take as long as the optional delay function says.
#[derive(derive_more::Debug)]
pub struct BasicConnector {
    #[allow(clippy::type_complexity)]
    #[debug(skip)]
    delay: Option<Arc<dyn Fn(bool) -> Result<Duration, ()> + Send + Sync>>,
    state: Arc<ConnectorState>,
}

impl BasicConnector {
    pub fn no_delay() -> Self {
        BasicConnector {
            delay: None,
            state: Default::default(),
        }
    }

    pub fn delay(f: impl Fn(bool) -> Result<Duration, ()> + Send + Sync + 'static) -> Self {
        BasicConnector {
            delay: Some(Arc::new(f)),
            state: Default::default(),
        }
    }

    pub fn state(&self) -> &ConnectorState {
        &self.state
    }

    fn duration(&self, disconnect: bool) -> Result<Option<Duration>, String> {
        if disconnect && self.state.fail_next_disconnect.swap(false, Ordering::SeqCst) {
            return Err("failed".to_string());
        }
        if !disconnect && self.state.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err("failed".to_string());
        }
        if let Some(f) = &self.delay {
            Ok(Some(f(disconnect).map_err(|_| "failed".to_string())?))
        } else {
            Ok(None)
        }
    }
}

impl Connector for BasicConnector {
    type Conn = u64;
    type Error = String;

    fn connect(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<Self::Conn, Self::Error>> + Send + 'static {
        let connect = if self.state.is_failing(target) {
            Err(format!("{target} is down"))
        } else {
            self.duration(false)
        };
        let state = self.state.clone();
        async move {
            if let Some(f) = connect? {
                tokio::time::sleep(f).await;
            }
            Ok(state.connected())
        }
    }

    fn disconnect(
        &self,
        _conn: Self::Conn,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let disconnect = self.duration(true);
        let state = self.state.clone();
        async move {
            // The connection is gone whether or not the disconnect was clean.
            let delay = disconnect.inspect_err(|_| state.disconnected())?;
            if let Some(f) = delay {
                tokio::time::sleep(f).await;
            }
            state.disconnected();
            Ok(())
        }
    }

    fn is_healthy(&self, conn: &Self::Conn) -> bool {
        !self.state.unhealthy.lock().unwrap().contains(conn)
    }
}

/// Per-target latencies, in seconds.
#[derive(Clone, Default)]
pub struct Latencies {
    data: Arc<Mutex<HashMap<String, Vec<f64>>>>,
}

/// Helper function for [`Stats`] [`Debug`] impl.
#[allow(unused)]
fn m(v: &f64) -> Duration {
    if *v <= 0.000_001 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(*v)
    }
}

#[derive(derive_more::Debug)]
#[allow(unused)]
#[debug(
    "#{count} %{{1,25,50,75,99}}: {:?}/{:?}/{:?}/{:?}/{:?}, x̄: {:?} Πx: {:?}",
    m(p01),
    m(p25),
    m(p50),
    m(p75),
    m(p99),
    m(mean),
    m(geometric_mean)
)]
pub struct Stats {
    pub p01: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p99: f64,
    pub geometric_mean: f64,
    pub mean: f64,
    pub count: usize,
}

impl Latencies {
    pub fn mark(&self, target: &str, latency: f64) {
        self.data
            .lock()
            .unwrap()
            .entry(target.to_owned())
            .or_default()
            .push(latency.max(0.000_001));
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, target: &str) -> Option<Stats> {
        let mut data = self.data.lock().unwrap();
        data.get_mut(target)
            .filter(|data| !data.is_empty())
            .map(|data| stats(data))
    }
}

impl std::fmt::Debug for Latencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Latencies");
        let mut data = self.data.lock().unwrap();
        let mut all = vec![];
        for key in data.keys().cloned().sorted() {
            let data = data.get_mut(&key).unwrap();
            all.extend_from_slice(data);
            let stats = stats(data);
            s.field(&key, &stats);
        }
        if !all.is_empty() {
            let stats = stats(&mut all);
            s.field("all", &stats);
        }
        s.finish()
    }
}

fn stats(data: &mut [f64]) -> Stats {
    let geometric_mean = data.geometric_mean();
    let mut data = Data::new(data);
    let mean = data.mean().unwrap();

    Stats {
        p01: data.percentile(1),
        p25: data.percentile(25),
        p50: data.percentile(50),
        p75: data.percentile(75),
        p99: data.percentile(99),
        geometric_mean,
        mean,
        count: data.len(),
    }
}

#[derive(Default, derive_more::Debug, Clone, Copy)]
#[debug("{0:?}±{1:?}", Duration::from_secs_f64(self.0), Duration::from_secs_f64(self.1))]
pub struct Triangle(pub f64, pub f64);

impl Triangle {
    pub fn random(&self) -> f64 {
        self.0 + (random::<f64>() * 2.0 - 1.0) * self.1
    }

    pub fn random_duration(&self) -> Duration {
        let r = self.random();
        if r <= 0.001 {
            Duration::from_millis(1)
        } else {
            Duration::from_secs_f64(r)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn connector_counts() {
        let connector = BasicConnector::no_delay();
        let a = connector.connect("a").await.unwrap();
        let b = connector.connect("a").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(connector.state().live(), 2);
        connector.disconnect(a).await.unwrap();
        assert_eq!(connector.state().live(), 1);
        assert_eq!(connector.state().max_live(), 2);

        connector.state().fail_next_disconnect();
        assert!(connector.disconnect(b).await.is_err());
        assert_eq!(connector.state().live(), 0);
        assert_eq!(connector.state().closed(), 2);

        connector.state().fail_target("b", true);
        assert!(connector.connect("b").await.is_err());
        connector.state().fail_target("b", false);
        assert!(connector.connect("b").await.is_ok());
    }

    #[test]
    fn latency_stats() {
        let latencies = Latencies::default();
        for i in 1..=100 {
            latencies.mark("a", i as f64 / 1000.0);
        }
        assert_eq!(latencies.len(), 100);
        let stats = latencies.stats("a").unwrap();
        assert_eq!(stats.count, 100);
        assert!(stats.p50 > 0.049 && stats.p50 < 0.052, "{stats:?}");
        assert!(latencies.stats("b").is_none());
    }
}
