//! Set, list, key and pub/sub operations over a supervised connection.

use std::sync::Arc;
use std::time::Duration;

use redis::{Cmd, FromRedisValue, Pipeline, ToRedisArgs};
use tracing::{error, info};

use super::config::RedisConfig;
use super::connection::RedisConnector;
use super::pubsub::{self, PubSubMessage, Subscription};
use super::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::errors::StoreError;

/// Members fetched per `SSCAN` step of [`RedisStore::set_clear`].
const CLEAR_SCAN_COUNT: usize = 500;

// =============================================================================
// Batch Atomicity
// =============================================================================

/// Guarantee given by the pipelined batch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAtomicity {
    /// `MULTI`/`EXEC`: all commands apply together.
    Atomic,
    /// Ordered pipeline without cross-shard atomicity (cluster).
    BestEffort,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

impl KeyTtl {
    /// Interprets a `PTTL` reply.
    #[must_use]
    pub fn from_millis(reply: i64) -> Self {
        match reply {
            -2 => Self::Missing,
            millis if millis < 0 => Self::NoExpiry,
            millis => Self::ExpiresIn(Duration::from_millis(millis.unsigned_abs())),
        }
    }
}

/// Number of elements a pop may take: never more than are available.
#[must_use]
pub fn clamp_pop_count(requested: usize, available: u64) -> usize {
    usize::try_from(available).map_or(requested, |available| requested.min(available))
}

/// An empty pipeline, wrapped in `MULTI`/`EXEC` unless `atomicity` is
/// [`BatchAtomicity::BestEffort`].
fn batch_pipeline(atomicity: BatchAtomicity) -> Pipeline {
    let mut pipeline = redis::pipe();
    if atomicity == BatchAtomicity::Atomic {
        pipeline.atomic();
    }
    pipeline
}

/// How a pop of an already clamped `count` is sent.
enum PopRequest {
    Empty,
    Single(Cmd),
    Batch(Pipeline),
}

fn pop_request(atomicity: BatchAtomicity, command: &str, key: &str, count: usize) -> PopRequest {
    match count {
        0 => PopRequest::Empty,
        1 => {
            let mut cmd = redis::cmd(command);
            cmd.arg(key);
            PopRequest::Single(cmd)
        }
        _ => {
            let mut pipeline = batch_pipeline(atomicity);
            for _ in 0..count {
                pipeline.cmd(command).arg(key);
            }
            PopRequest::Batch(pipeline)
        }
    }
}

// =============================================================================
// RedisStore
// =============================================================================

/// Redis client that survives server restarts.
///
/// Every call probes the connection and reconnects with the configured
/// [`RetryPolicy`](crate::retry::RetryPolicy) before running. Clones share one
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    supervisor: Arc<ConnectionSupervisor<RedisConnector>>,
}

impl RedisStore {
    /// Connects to the configured topology.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an invalid topology and
    /// [`StoreError::ConnectionLost`] when every connect attempt failed.
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        let store = Self::lazy(config)?;
        store.supervisor.connect().await?;
        info!(
            "Redis store ready ({:?}, {:?})",
            store.config().topology,
            store.batch_atomicity()
        );
        Ok(store)
    }

    /// Creates a store that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an invalid topology.
    pub fn lazy(config: RedisConfig) -> Result<Self, StoreError> {
        let policy = config.reconnect;
        let connector = RedisConnector::new(config)?;
        Ok(Self {
            supervisor: Arc::new(ConnectionSupervisor::new(connector, policy)),
        })
    }

    /// Connects with [`RedisConfig::from_env`].
    ///
    /// # Errors
    ///
    /// See [`RedisConfig::from_env`] and [`RedisStore::connect`].
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::connect(RedisConfig::from_env()?).await
    }

    #[must_use]
    pub fn config(&self) -> &RedisConfig {
        self.supervisor.connector().config()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Guarantee of the pipelined batch operations on this topology.
    #[must_use]
    pub fn batch_atomicity(&self) -> BatchAtomicity {
        if self.config().topology.is_cluster() {
            BatchAtomicity::BestEffort
        } else {
            BatchAtomicity::Atomic
        }
    }

    /// Drops the connection. A later call reconnects.
    pub async fn close(&self) {
        self.supervisor.disconnect().await;
        info!("Redis store closed");
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.query::<String>("ping", "", &redis::cmd("PING"))
            .await
            .map(|_| ())
    }
}

// =============================================================================
// Sets
// =============================================================================

impl RedisStore {
    pub async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        self.query("set_len", key, redis::cmd("SCARD").arg(key))
            .await
    }

    /// Adds one member. Returns `true` if it was not present.
    pub async fn set_add<V: ToRedisArgs>(&self, key: &str, member: V) -> Result<bool, StoreError> {
        let added: u64 = self
            .query("set_add", key, redis::cmd("SADD").arg(key).arg(member))
            .await?;
        Ok(added > 0)
    }

    /// Adds members in one pipelined batch. Returns how many were new.
    pub async fn set_add_many<V: ToRedisArgs>(
        &self,
        key: &str,
        members: &[V],
    ) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut pipeline = batch_pipeline(self.batch_atomicity());
        for member in members {
            pipeline.cmd("SADD").arg(key).arg(member);
        }
        let added: Vec<u64> = self.query_pipeline("set_add_many", key, &pipeline).await?;
        Ok(added.iter().sum())
    }

    /// Removes and returns up to `count` random members.
    ///
    /// The set size is read first and `count` clamped to it, so a short set
    /// yields fewer members instead of an error.
    pub async fn set_pop<T: FromRedisValue>(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<T>, StoreError> {
        let count = clamp_pop_count(count, self.set_len(key).await?);
        self.pop_batch("set_pop", "SPOP", key, count).await
    }

    /// Returns up to `count` distinct random members without removing them.
    pub async fn set_random_members<T: FromRedisValue>(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<T>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.query(
            "set_random_members",
            key,
            redis::cmd("SRANDMEMBER").arg(key).arg(count),
        )
        .await
    }

    /// Removes one member. Returns `true` if it was present.
    pub async fn set_remove<V: ToRedisArgs>(
        &self,
        key: &str,
        member: V,
    ) -> Result<bool, StoreError> {
        let removed: u64 = self
            .query("set_remove", key, redis::cmd("SREM").arg(key).arg(member))
            .await?;
        Ok(removed > 0)
    }

    /// Removes members in one pipelined batch. Returns how many were present.
    pub async fn set_remove_many<V: ToRedisArgs>(
        &self,
        key: &str,
        members: &[V],
    ) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut pipeline = batch_pipeline(self.batch_atomicity());
        for member in members {
            pipeline.cmd("SREM").arg(key).arg(member);
        }
        let removed: Vec<u64> = self
            .query_pipeline("set_remove_many", key, &pipeline)
            .await?;
        Ok(removed.iter().sum())
    }

    /// Empties a set step by step with `SSCAN` + `SREM`, so a large set never
    /// blocks the server. Returns how many members were removed.
    pub async fn set_clear(&self, key: &str) -> Result<u64, StoreError> {
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, members): (u64, Vec<Vec<u8>>) = self
                .query(
                    "set_clear",
                    key,
                    redis::cmd("SSCAN")
                        .arg(key)
                        .arg(cursor)
                        .arg("COUNT")
                        .arg(CLEAR_SCAN_COUNT),
                )
                .await?;

            if !members.is_empty() {
                let mut pipeline = redis::pipe();
                for member in &members {
                    pipeline.cmd("SREM").arg(key).arg(member);
                }
                let counts: Vec<u64> = self.query_pipeline("set_clear", key, &pipeline).await?;
                removed += counts.iter().sum::<u64>();
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    pub async fn set_contains<V: ToRedisArgs>(
        &self,
        key: &str,
        member: V,
    ) -> Result<bool, StoreError> {
        self.query(
            "set_contains",
            key,
            redis::cmd("SISMEMBER").arg(key).arg(member),
        )
        .await
    }
}

// =============================================================================
// Lists
// =============================================================================

impl RedisStore {
    pub async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.query("list_len", key, redis::cmd("LLEN").arg(key))
            .await
    }

    /// Pushes one value to the head. Returns the new length.
    pub async fn list_push_left<V: ToRedisArgs>(
        &self,
        key: &str,
        value: V,
    ) -> Result<u64, StoreError> {
        self.query("list_push_left", key, redis::cmd("LPUSH").arg(key).arg(value))
            .await
    }

    /// Pushes values to the head in one pipelined batch, in order, so the
    /// last value ends up first. Returns the final length.
    pub async fn list_push_left_many<V: ToRedisArgs>(
        &self,
        key: &str,
        values: &[V],
    ) -> Result<u64, StoreError> {
        if values.is_empty() {
            return self.list_len(key).await;
        }
        let mut pipeline = batch_pipeline(self.batch_atomicity());
        for value in values {
            pipeline.cmd("LPUSH").arg(key).arg(value);
        }
        let lengths: Vec<u64> = self
            .query_pipeline("list_push_left_many", key, &pipeline)
            .await?;
        Ok(lengths.last().copied().unwrap_or_default())
    }

    /// Pops up to `count` values from the head, clamped to the list length.
    pub async fn list_pop_left<T: FromRedisValue>(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<T>, StoreError> {
        let count = clamp_pop_count(count, self.list_len(key).await?);
        self.pop_batch("list_pop_left", "LPOP", key, count).await
    }

    /// Moves the tail of `source` to the head of `destination` (or of
    /// `source` itself) and returns it.
    pub async fn list_rotate<T: FromRedisValue>(
        &self,
        source: &str,
        destination: Option<&str>,
    ) -> Result<Option<T>, StoreError> {
        self.query(
            "list_rotate",
            source,
            redis::cmd("RPOPLPUSH")
                .arg(source)
                .arg(destination.unwrap_or(source)),
        )
        .await
    }

    /// Removes occurrences of `value` (`count` semantics of `LREM`: 0 for
    /// all, positive from the head, negative from the tail).
    pub async fn list_remove<V: ToRedisArgs>(
        &self,
        key: &str,
        value: V,
        count: isize,
    ) -> Result<u64, StoreError> {
        self.query(
            "list_remove",
            key,
            redis::cmd("LREM").arg(key).arg(count).arg(value),
        )
        .await
    }

    pub async fn list_range<T: FromRedisValue>(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<T>, StoreError> {
        self.query(
            "list_range",
            key,
            redis::cmd("LRANGE").arg(key).arg(start).arg(stop),
        )
        .await
    }
}

// =============================================================================
// Keys and Pub/Sub
// =============================================================================

impl RedisStore {
    /// Sets a time to live. Returns `false` if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.query("expire", key, redis::cmd("PEXPIRE").arg(key).arg(millis))
            .await
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let reply: i64 = self.query("ttl", key, redis::cmd("PTTL").arg(key)).await?;
        Ok(KeyTtl::from_millis(reply))
    }

    /// Publishes a message. Returns the number of receivers.
    pub async fn publish<M: ToRedisArgs>(
        &self,
        channel: &str,
        message: M,
    ) -> Result<u64, StoreError> {
        self.query(
            "publish",
            channel,
            redis::cmd("PUBLISH").arg(channel).arg(message),
        )
        .await
    }

    /// Subscribes to `channels` on a dedicated connection and task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty channel list, or the
    /// connection error if the subscription could not be set up.
    pub async fn subscribe<H>(
        &self,
        channels: &[&str],
        handler: H,
    ) -> Result<Subscription, StoreError>
    where
        H: FnMut(PubSubMessage) + Send + 'static,
    {
        pubsub::subscribe(self.supervisor.connector(), channels, handler).await
    }
}

// =============================================================================
// Command Execution
// =============================================================================

impl RedisStore {
    async fn pop_batch<T: FromRedisValue>(
        &self,
        operation: &str,
        command: &str,
        key: &str,
        count: usize,
    ) -> Result<Vec<T>, StoreError> {
        match pop_request(self.batch_atomicity(), command, key, count) {
            PopRequest::Empty => Ok(Vec::new()),
            PopRequest::Single(cmd) => {
                let value: Option<T> = self.query(operation, key, &cmd).await?;
                Ok(value.into_iter().collect())
            }
            PopRequest::Batch(pipeline) => {
                let values: Vec<Option<T>> =
                    self.query_pipeline(operation, key, &pipeline).await?;
                Ok(values.into_iter().flatten().collect())
            }
        }
    }

    async fn query<T: FromRedisValue>(
        &self,
        operation: &str,
        key: &str,
        cmd: &Cmd,
    ) -> Result<T, StoreError> {
        self.supervisor
            .run(|mut connection| async move {
                cmd.query_async::<T>(&mut connection)
                    .await
                    .map_err(StoreError::from)
            })
            .await
            .inspect_err(|error| error!("Redis {} on '{}' failed: {}", operation, key, error))
    }

    async fn query_pipeline<T: FromRedisValue>(
        &self,
        operation: &str,
        key: &str,
        pipeline: &Pipeline,
    ) -> Result<T, StoreError> {
        self.supervisor
            .run(|mut connection| async move {
                pipeline
                    .query_async::<T>(&mut connection)
                    .await
                    .map_err(StoreError::from)
            })
            .await
            .inspect_err(|error| error!("Redis {} on '{}' failed: {}", operation, key, error))
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RedisStore")
            .field("config", self.config())
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
    use proptest::prelude::*;
    use rstest::rstest;

    mod ttl_tests {
        use super::*;

        #[rstest]
        #[case(-2, KeyTtl::Missing)]
        #[case(-1, KeyTtl::NoExpiry)]
        #[case(0, KeyTtl::ExpiresIn(Duration::ZERO))]
        #[case(1500, KeyTtl::ExpiresIn(Duration::from_millis(1500)))]
        fn from_millis_reads_pttl_reply(#[case] reply: i64, #[case] expected: KeyTtl) {
            assert_eq!(KeyTtl::from_millis(reply), expected);
        }
    }

    mod atomicity_tests {
        use super::*;

        #[rstest]
        #[case(RedisConfig::single("h:6379"), BatchAtomicity::Atomic)]
        #[case(
            RedisConfig::sentinel(vec!["s:26379".to_string()], "mymaster"),
            BatchAtomicity::Atomic
        )]
        #[case(
            RedisConfig::cluster(vec!["a:7000".to_string(), "b:7001".to_string()]),
            BatchAtomicity::BestEffort
        )]
        fn depends_on_topology(#[case] config: RedisConfig, #[case] expected: BatchAtomicity) {
            let store = RedisStore::lazy(config).unwrap();
            assert_eq!(store.batch_atomicity(), expected);
            assert_eq!(store.state(), ConnectionState::Disconnected);
        }
    }

    mod clamp_tests {
        use super::*;

        #[rstest]
        #[case(5, 2, 2)]
        #[case(2, 5, 2)]
        #[case(3, 0, 0)]
        fn clamps_to_available(#[case] requested: usize, #[case] available: u64, #[case] expected: usize) {
            assert_eq!(clamp_pop_count(requested, available), expected);
        }

        proptest! {
            #[test]
            fn never_exceeds_request_or_supply(requested in 0_usize..10_000, available in 0_u64..10_000) {
                let count = clamp_pop_count(requested, available);
                prop_assert!(count <= requested);
                prop_assert!(count as u64 <= available);
                prop_assert!(count == requested || count as u64 == available);
            }
        }
    }

    mod pipeline_tests {
        use super::*;

        fn contains(packed: &[u8], word: &[u8]) -> bool {
            packed.windows(word.len()).any(|window| window == word)
        }

        #[rstest]
        #[case(BatchAtomicity::Atomic, true)]
        #[case(BatchAtomicity::BestEffort, false)]
        fn transaction_wraps_only_atomic_batches(
            #[case] atomicity: BatchAtomicity,
            #[case] transactional: bool,
        ) {
            let mut pipeline = batch_pipeline(atomicity);
            pipeline.cmd("SADD").arg("k").arg("m");
            let packed = pipeline.get_packed_pipeline();
            assert_eq!(contains(&packed, b"MULTI"), transactional);
            assert_eq!(contains(&packed, b"EXEC"), transactional);
        }

        #[rstest]
        fn zero_count_sends_nothing() {
            assert!(matches!(
                pop_request(BatchAtomicity::Atomic, "SPOP", "k", 0),
                PopRequest::Empty
            ));
        }

        #[rstest]
        fn single_count_is_one_plain_command() {
            let PopRequest::Single(cmd) = pop_request(BatchAtomicity::Atomic, "LPOP", "k", 1)
            else {
                panic!("expected a single command");
            };
            assert_eq!(
                cmd.get_packed_command(),
                redis::cmd("LPOP").arg("k").get_packed_command()
            );
        }

        #[rstest]
        #[case(BatchAtomicity::Atomic, true)]
        #[case(BatchAtomicity::BestEffort, false)]
        fn larger_count_is_one_pop_per_element(
            #[case] atomicity: BatchAtomicity,
            #[case] transactional: bool,
        ) {
            let PopRequest::Batch(pipeline) = pop_request(atomicity, "SPOP", "k", 3) else {
                panic!("expected a pipeline");
            };
            assert_eq!(pipeline.len(), 3);
            assert_eq!(contains(&pipeline.get_packed_pipeline(), b"MULTI"), transactional);
        }

        proptest! {
            #[test]
            fn clamped_pop_never_requests_more_than_available(
                requested in 0_usize..50,
                available in 0_u64..50,
            ) {
                let count = clamp_pop_count(requested, available);
                let queued = match pop_request(BatchAtomicity::BestEffort, "SPOP", "k", count) {
                    PopRequest::Empty => 0,
                    PopRequest::Single(_) => 1,
                    PopRequest::Batch(pipeline) => pipeline.len(),
                };
                prop_assert_eq!(queued, count);
                prop_assert!(queued as u64 <= available);
            }
        }
    }

    mod clone_tests {
        use super::*;

        #[rstest]
        fn store_is_clone() {
            fn assert_clone<T: Clone>() {}
            assert_clone::<RedisStore>();
        }
    }
}
