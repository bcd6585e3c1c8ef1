use crate::time::Instant;
use std::{borrow::Cow, future::Future, time::Duration};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError<E: Clone> {
    /// The caller's deadline passed before a connection became available.
    #[error("Timed out waiting for a connection")]
    PoolTimeout,
    #[error("Pool is closed")]
    PoolClosed,
    /// The connection factory failed to open a connection. This is never
    /// retried by the pool.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(E),
    /// Internal accounting detected an impossible state.
    #[error("Invariant violation: {0}")]
    InvariantViolation(Cow<'static, str>),
}

pub type ConnResult<T, E> = Result<T, ConnError<E>>;

/// The connection factory used by the pool to open and close backend
/// connections for a target.
pub trait Connector: std::fmt::Debug + Send + Sync + 'static {
    /// The type of connection associated with this [`Connector`].
    type Conn: Send + 'static;
    /// The type of error returned from this [`Connector`]. The error must be
    /// `Clone`able as it may be delivered to a waiter other than the caller
    /// that triggered the connection.
    type Error: Into<Box<dyn std::error::Error + Send + Sync>>
        + Clone
        + std::fmt::Debug
        + Send
        + 'static;

    /// Open a connection to the given target.
    fn connect(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<Self::Conn, Self::Error>> + Send + 'static;

    /// Perform a graceful disconnect operation on the given connection.
    fn disconnect(
        &self,
        conn: Self::Conn,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static;

    /// A cheap liveness check, run before an idle connection is handed out
    /// and before a released connection is pooled.
    fn is_healthy(&self, _conn: &Self::Conn) -> bool {
        true
    }

    /// The maximum age of a connection before it is retired.
    fn max_lifetime(&self) -> Option<Duration> {
        None
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
#[display("#{_0}")]
pub struct ConnId(pub(crate) u64);

/// A backend connection owned by the pool.
pub struct Conn<C: Connector> {
    id: ConnId,
    handle: C::Conn,
    created: Instant,
    last_used: Instant,
}

impl<C: Connector> std::fmt::Debug for Conn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Conn({}, age={:?})",
            self.id,
            self.created.elapsed()
        ))
    }
}

impl<C: Connector> Conn<C> {
    pub fn new(id: ConnId, handle: C::Conn, now: Instant) -> Self {
        Self {
            id,
            handle,
            created: now,
            last_used: now,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn handle(&self) -> &C::Conn {
        &self.handle
    }

    pub fn into_handle(self) -> C::Conn {
        self.handle
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn is_expired(&self, max_lifetime: Option<Duration>, now: Instant) -> bool {
        max_lifetime.is_some_and(|lifetime| now.saturating_duration_since(self.created) >= lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::BasicConnector;

    #[test]
    fn expiry() {
        let now = Instant::now();
        let conn = Conn::<BasicConnector>::new(ConnId(1), 1, now);
        assert!(!conn.is_expired(None, now + Duration::from_secs(1000)));
        assert!(!conn.is_expired(Some(Duration::from_secs(10)), now + Duration::from_secs(9)));
        assert!(conn.is_expired(Some(Duration::from_secs(10)), now + Duration::from_secs(10)));
    }

    #[test]
    fn idle_time() {
        let now = Instant::now();
        let mut conn = Conn::<BasicConnector>::new(ConnId(1), 1, now);
        assert_eq!(conn.idle_for(now + Duration::from_secs(3)), Duration::from_secs(3));
        conn.touch(now + Duration::from_secs(2));
        assert_eq!(conn.idle_for(now + Duration::from_secs(3)), Duration::from_secs(1));
        // Clock skew never underflows
        assert_eq!(conn.idle_for(now), Duration::ZERO);
    }
}
