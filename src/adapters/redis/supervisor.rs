//! Reconnect state machine shared by every Redis operation.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (probe failure) -> Reconnecting
//!                                    ^                              |
//!                                    +---------- success -----------+
//!                                                failure x N -> Disconnected
//! ```

use std::future::Future;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::errors::{Backend, StoreError};
use crate::retry::RetryPolicy;

// =============================================================================
// Connector
// =============================================================================

/// Opens and probes connections for a [`ConnectionSupervisor`].
pub trait Connector: Send + Sync {
    /// Cheap handle to one live connection.
    type Connection: Clone + Send;

    /// Backend named in errors and logs.
    fn target(&self) -> Backend;

    /// Opens a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, StoreError>> + Send;

    /// Checks that `connection` is still usable.
    fn probe(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// =============================================================================
// ConnectionState
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Slot<T> {
    connection: Option<T>,
    /// Bumped on every successful (re)connect.
    generation: u64,
}

// =============================================================================
// ConnectionSupervisor
// =============================================================================

/// Owns the current connection and runs operations against it.
///
/// Each call to [`run`](Self::run) probes the connection first. A failed
/// probe triggers a bounded reconnect before the operation runs; a transport
/// error from the operation triggers one reconnect and one retry. Callers that
/// saw the same dead connection share a single reconnect: the slot mutex is
/// held for the whole reconnect and the generation tells late callers that
/// the work is already done.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    slot: Mutex<Slot<C::Connection>>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// Creates a supervisor. No connection is opened until first use.
    #[must_use]
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            slot: Mutex::new(Slot {
                connection: None,
                generation: 0,
            }),
            state: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Opens the connection now instead of on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionLost`] once every attempt failed.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.current().await.map(|_| ())
    }

    /// Drops the current connection.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        slot.connection = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Runs `operation` on a live connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionLost`] if no connection could be
    /// (re)established, in which case `operation` never ran, or the error of
    /// `operation` itself.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut(C::Connection) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (mut connection, mut generation) = self.current().await?;

        if let Err(error) = self.connector.probe(&connection).await {
            warn!(
                "{} liveness probe failed, reconnecting: {}",
                self.connector.target(),
                error
            );
            (connection, generation) = self.reconnect(generation).await?;
        }

        match operation(connection).await {
            Err(error) if error.is_connection() => {
                warn!(
                    "{} operation lost its connection, retrying once: {}",
                    self.connector.target(),
                    error
                );
                let (connection, _) = self.reconnect(generation).await?;
                operation(connection).await
            }
            result => result,
        }
    }

    async fn current(&self) -> Result<(C::Connection, u64), StoreError> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = &slot.connection {
            return Ok((connection.clone(), slot.generation));
        }
        self.establish(&mut slot, ConnectionState::Connecting).await
    }

    /// Replaces the connection of generation `observed`. If another caller
    /// already replaced it, its connection is returned instead.
    async fn reconnect(&self, observed: u64) -> Result<(C::Connection, u64), StoreError> {
        let mut slot = self.slot.lock().await;
        if slot.generation != observed
            && let Some(connection) = &slot.connection
        {
            debug!(
                "{} already reconnected (generation {})",
                self.connector.target(),
                slot.generation
            );
            return Ok((connection.clone(), slot.generation));
        }
        self.establish(&mut slot, ConnectionState::Reconnecting).await
    }

    async fn establish(
        &self,
        slot: &mut Slot<C::Connection>,
        phase: ConnectionState,
    ) -> Result<(C::Connection, u64), StoreError> {
        let target = self.connector.target();
        let attempts = self.policy.max_attempts();
        slot.connection = None;
        self.state.send_replace(phase);

        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(connection) => {
                    slot.generation += 1;
                    slot.connection = Some(connection.clone());
                    self.state.send_replace(ConnectionState::Connected);
                    info!("Connected to {} (attempt {}/{})", target, attempt, attempts);
                    return Ok((connection, slot.generation));
                }
                Err(error) => {
                    error!(
                        "Failed to connect to {} (attempt {}/{}): {}",
                        target, attempt, attempts, error
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay()).await;
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        Err(StoreError::connection_lost(target, attempts))
    }
}

impl<C: Connector + std::fmt::Debug> std::fmt::Debug for ConnectionSupervisor<C> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionSupervisor")
            .field("connector", &self.connector)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Hands out connections numbered by connect attempt.
    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicU32,
        failing_connects: AtomicU32,
        failing_probes: AtomicU32,
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl Connector for FakeConnector {
        type Connection = u32;

        fn target(&self) -> Backend {
            Backend::Redis
        }

        async fn connect(&self) -> Result<u32, StoreError> {
            let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if take_one(&self.failing_connects) {
                Err(StoreError::connection(Backend::Redis, "connection refused"))
            } else {
                Ok(id)
            }
        }

        async fn probe(&self, _connection: &u32) -> Result<(), StoreError> {
            if take_one(&self.failing_probes) {
                Err(StoreError::connection(Backend::Redis, "broken pipe"))
            } else {
                Ok(())
            }
        }
    }

    fn supervisor() -> ConnectionSupervisor<FakeConnector> {
        ConnectionSupervisor::new(
            FakeConnector::default(),
            RetryPolicy::new(3, Duration::from_secs(2)),
        )
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn first_run_connects_lazily() {
            let supervisor = supervisor();
            assert_eq!(supervisor.state(), ConnectionState::Disconnected);

            let connection = supervisor.run(|c| async move { Ok(c) }).await.unwrap();

            assert_eq!(connection, 1);
            assert_eq!(supervisor.state(), ConnectionState::Connected);
            assert_eq!(supervisor.connector().connects.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn healthy_connection_is_reused() {
            let supervisor = supervisor();
            supervisor.connect().await.unwrap();
            for _ in 0..3 {
                assert_eq!(supervisor.run(|c| async move { Ok(c) }).await.unwrap(), 1);
            }
            assert_eq!(supervisor.connector().connects.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn disconnect_forces_a_new_connection() {
            let supervisor = supervisor();
            supervisor.connect().await.unwrap();
            supervisor.disconnect().await;
            assert_eq!(supervisor.state(), ConnectionState::Disconnected);
            assert_eq!(supervisor.run(|c| async move { Ok(c) }).await.unwrap(), 2);
        }
    }

    mod reconnect_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn probe_failure_reconnects_then_runs_once() {
            let supervisor = supervisor();
            supervisor.connect().await.unwrap();
            supervisor.connector().failing_probes.store(1, Ordering::SeqCst);
            let calls = AtomicU32::new(0);

            let connection = supervisor
                .run(|c| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(c) }
                })
                .await
                .unwrap();

            assert_eq!(connection, 2);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(supervisor.state(), ConnectionState::Connected);
        }

        #[tokio::test(start_paused = true)]
        async fn exhausted_reconnect_is_connection_lost_and_skips_operation() {
            let supervisor = supervisor();
            supervisor.connect().await.unwrap();
            supervisor.connector().failing_probes.store(1, Ordering::SeqCst);
            supervisor.connector().failing_connects.store(3, Ordering::SeqCst);
            let calls = AtomicU32::new(0);
            let started = tokio::time::Instant::now();

            let error = supervisor
                .run(|c| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(c) }
                })
                .await
                .unwrap_err();

            assert!(matches!(
                error,
                StoreError::ConnectionLost {
                    target: Backend::Redis,
                    attempts: 3
                }
            ));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert_eq!(supervisor.state(), ConnectionState::Disconnected);
            assert!(started.elapsed() >= Duration::from_secs(4));
        }

        #[tokio::test(start_paused = true)]
        async fn recovers_on_next_run_after_exhaustion() {
            let supervisor = supervisor();
            supervisor.connector().failing_connects.store(3, Ordering::SeqCst);
            assert!(supervisor.connect().await.unwrap_err().is_connection_lost());

            assert_eq!(supervisor.run(|c| async move { Ok(c) }).await.unwrap(), 4);
        }

        #[tokio::test(start_paused = true)]
        async fn transport_error_retries_once_on_fresh_connection() {
            let supervisor = supervisor();
            let calls = AtomicU32::new(0);

            let connection = supervisor
                .run(|c| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            Err(StoreError::connection(Backend::Redis, "reset by peer"))
                        } else {
                            Ok(c)
                        }
                    }
                })
                .await
                .unwrap();

            assert_eq!(connection, 2);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn other_errors_are_not_retried() {
            let supervisor = supervisor();
            let calls = AtomicU32::new(0);

            let error = supervisor
                .run(|_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StoreError::backend(Backend::Redis, "WRONGTYPE")) }
                })
                .await
                .unwrap_err();

            assert!(!error.is_connection());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(supervisor.connector().connects.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_reconnects_coalesce() {
            let supervisor = supervisor();
            supervisor.connect().await.unwrap();

            let (first, second) = tokio::join!(supervisor.reconnect(1), supervisor.reconnect(1));

            assert_eq!(first.unwrap(), (2, 2));
            assert_eq!(second.unwrap(), (2, 2));
            assert_eq!(supervisor.connector().connects.load(Ordering::SeqCst), 2);
        }
    }

    mod state_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn watch_state_sees_transitions() {
            let supervisor = supervisor();
            let mut receiver = supervisor.watch_state();
            supervisor.connect().await.unwrap();
            assert!(receiver.has_changed().unwrap());
            assert_eq!(*receiver.borrow_and_update(), ConnectionState::Connected);
        }
    }
}
