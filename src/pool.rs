//! Bounded pool of externally created resources.
//!
//! Idle handles wait in a [`RingBuffer`]. Creation and health checks run
//! under the pool's circuit breaker keys (`<name>:create`, `<name>:health`)
//! and failed creations are retried with backoff.
//!
//! Every decision that hands out a handle, or reserves room for a new one,
//! is made and recorded inside a single critical section. No lock is held
//! across an `.await`.
//!
//! Waiters blocked in [`ResourcePool::acquire`] are all woken on release and
//! race for the returned handle; there is no FIFO fairness between them.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffScheduler;
use crate::breaker::CircuitBreaker;
use crate::config::{PoolBuilder, PoolConfig, RetryPolicy};
use crate::error::{BreakerError, PoolError, PoolResult};
use crate::metrics::MetricSink;
use crate::retry;
use crate::ring::RingBuffer;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks that open, check and close the pooled resource.
pub trait ResourceManager: Send + Sync + 'static {
    /// The pooled resource, e.g. a database connection.
    type Resource: Send + Sync + 'static;

    /// Error returned by [`create`](Self::create) and [`check`](Self::check).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new resource.
    fn create(&self) -> BoxFuture<'_, Result<Self::Resource, Self::Error>>;

    /// Reports whether `resource` is still usable.
    fn check<'a>(&'a self, _resource: &'a Self::Resource) -> BoxFuture<'a, Result<bool, Self::Error>> {
        Box::pin(std::future::ready(Ok(true)))
    }

    /// Closes `resource`. Called once per handle, when it leaves the pool.
    fn destroy<'a>(&'a self, _resource: &'a Self::Resource) -> BoxFuture<'a, ()> {
        Box::pin(std::future::ready(()))
    }
}

struct HandleInner<R> {
    id: u64,
    pool_id: u64,
    created_at: Instant,
    resource: R,
}

/// A reference to a pooled resource.
///
/// Handles are cheap to clone; all clones refer to the same pool entry and
/// the pool tracks whether that entry is checked out. Return it with
/// [`ResourcePool::release`].
pub struct Handle<R> {
    inner: Arc<HandleInner<R>>,
}

impl<R> Handle<R> {
    fn new(id: u64, pool_id: u64, resource: R) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                pool_id,
                created_at: Instant::now(),
                resource,
            }),
        }
    }

    /// Identifier, unique within the issuing pool.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// When the underlying resource was created.
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }
}

impl<R> Clone for Handle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Deref for Handle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner.resource
    }
}

impl<R: fmt::Debug> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("resource", &self.inner.resource)
            .finish()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles waiting in the idle queue.
    pub idle: usize,
    /// Handles checked out.
    pub in_use: usize,
    /// Live handles (idle and checked out).
    pub total: usize,
    /// Creations in progress.
    pub pending: usize,
    /// Configured minimum.
    pub min_size: usize,
    /// Configured maximum.
    pub max_size: usize,
}

/// What [`ResourcePool::shutdown`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Idle handles destroyed immediately.
    pub idle_destroyed: usize,
    /// Checked-out handles returned during the grace period, then destroyed.
    pub drained: usize,
    /// Checked-out handles destroyed after the grace period expired.
    pub forced: usize,
}

struct Member<R> {
    handle: Handle<R>,
    in_use: bool,
}

struct PoolState<R> {
    idle: RingBuffer<Handle<R>>,
    members: AHashMap<u64, Member<R>>,
    in_use: usize,
    pending: usize,
    closed: bool,
}

impl<R> PoolState<R> {
    fn total(&self) -> usize {
        self.members.len()
    }
}

struct PoolInner<M: ResourceManager> {
    id: u64,
    manager: M,
    config: PoolConfig,
    create_key: String,
    health_key: String,
    state: Mutex<PoolState<M::Resource>>,
    released: Notify,
    breaker: CircuitBreaker,
    scheduler: BackoffScheduler,
    metric_sink: Arc<dyn MetricSink>,
    next_handle_id: AtomicU64,
}

/// Room reserved for one handle that is being created.
///
/// Dropped without [`commit`](Reservation::commit) (creation failed or the
/// caller gave up), it hands the room back and wakes waiters.
struct Reservation<'a, M: ResourceManager> {
    pool: &'a PoolInner<M>,
    committed: bool,
}

impl<M: ResourceManager> Reservation<'_, M> {
    fn commit(mut self, state: &mut PoolState<M::Resource>) {
        state.pending -= 1;
        self.committed = true;
    }
}

impl<M: ResourceManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.state.lock().pending -= 1;
            self.pool.released.notify_waiters();
        }
    }
}

enum Take<'a, M: ResourceManager> {
    Ready(Handle<M::Resource>),
    Create(Reservation<'a, M>),
    Wait,
    Closed,
}

/// A bounded pool of resources guarded by a circuit breaker.
pub struct ResourcePool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ResourceManager> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    /// Creates a new builder for a pool managed by `manager`.
    pub fn builder(manager: M) -> PoolBuilder<M> {
        PoolBuilder::new(manager)
    }

    pub(crate) fn new(
        manager: M,
        config: PoolConfig,
        breaker: CircuitBreaker,
        scheduler: BackoffScheduler,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        let inner = PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            create_key: format!("{}:create", config.name),
            health_key: format!("{}:health", config.name),
            state: Mutex::new(PoolState {
                idle: RingBuffer::new(config.max_size),
                members: AHashMap::with_capacity(config.max_size),
                in_use: 0,
                pending: 0,
                closed: false,
            }),
            manager,
            config,
            released: Notify::new(),
            breaker,
            scheduler,
            metric_sink,
            next_handle_id: AtomicU64::new(1),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The breaker registry guarding this pool.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            total: state.total(),
            pending: state.pending,
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has started.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Checks out a handle, waiting up to `timeout` for one to be released
    /// if the pool is at `max_size`.
    ///
    /// An idle handle is returned immediately. Otherwise, if there is room, a
    /// new resource is created (retried with backoff under the
    /// `<name>:create` breaker). Dropping the returned future gives back any
    /// room it had reserved.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<Handle<M::Resource>, M::Error> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Register before looking so a release in between is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let handle = match self.try_take() {
                Take::Ready(handle) => handle,
                Take::Create(reservation) => self.create_handle(reservation, true).await?,
                Take::Closed => return Err(PoolError::Closed),
                Take::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(pool = %self.inner.config.name, ?timeout, "acquire timed out");
                        self.inner.metric_sink.record_exhausted(&self.inner.config.name);
                        return Err(PoolError::Exhausted { timeout });
                    }
                    continue;
                }
            };

            debug!(pool = %self.inner.config.name, handle_id = handle.id(), "handle acquired");
            self.inner
                .metric_sink
                .record_acquire(&self.inner.config.name, started.elapsed());
            return Ok(handle);
        }
    }

    fn try_take(&self) -> Take<'_, M> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if state.closed {
            return Take::Closed;
        }
        if let Some(handle) = state.idle.pop() {
            if let Some(member) = state.members.get_mut(&handle.id()) {
                member.in_use = true;
            }
            state.in_use += 1;
            return Take::Ready(handle);
        }
        if state.total() + state.pending < self.inner.config.max_size {
            state.pending += 1;
            return Take::Create(Reservation {
                pool: &*self.inner,
                committed: false,
            });
        }
        Take::Wait
    }

    /// Returns a checked-out handle to the idle queue.
    ///
    /// Fails with [`PoolError::HandleNotOwned`] if the handle came from
    /// another pool, was already released, or was removed by a failed
    /// health check.
    pub fn release(&self, handle: &Handle<M::Resource>) -> PoolResult<(), M::Error> {
        let id = handle.id();
        if handle.pool_id() != self.inner.id {
            return Err(PoolError::HandleNotOwned { id });
        }

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.members.get_mut(&id) {
                Some(member) if member.in_use => member.in_use = false,
                _ => return Err(PoolError::HandleNotOwned { id }),
            }
            state.in_use -= 1;

            // While shutting down, returned handles stay out of the idle
            // queue and are destroyed by `shutdown`.
            if !state.closed && state.idle.try_push(handle.clone()).is_err() {
                state.members.remove(&id);
                warn!(
                    pool = %self.inner.config.name,
                    handle_id = id,
                    "idle queue full on release; dropping handle"
                );
            }
        }

        debug!(pool = %self.inner.config.name, handle_id = id, "handle released");
        self.inner.released.notify_waiters();
        Ok(())
    }

    /// Checks `handle` with the manager under the `<name>:health` breaker.
    ///
    /// Returns `Ok(true)` if healthy. An unhealthy verdict or a failed check
    /// removes the handle from the pool, destroys it, recreates handles up to
    /// `min_size`, and returns `Ok(false)`. If the health breaker is open,
    /// nothing is checked and the handle is left alone.
    pub async fn health_check(&self, handle: &Handle<M::Resource>) -> PoolResult<bool, M::Error> {
        let id = handle.id();
        let known = handle.pool_id() == self.inner.id
            && self.inner.state.lock().members.contains_key(&id);
        if !known {
            return Err(PoolError::HandleNotOwned { id });
        }

        let outcome = self
            .inner
            .breaker
            .execute(&self.inner.health_key, || self.inner.manager.check(handle))
            .await;

        match outcome {
            Ok(true) => return Ok(true),
            Ok(false) => {
                warn!(pool = %self.inner.config.name, handle_id = id, "handle reported unhealthy");
            }
            Err(BreakerError::Operation(error)) => {
                warn!(pool = %self.inner.config.name, handle_id = id, %error, "health check failed");
            }
            Err(BreakerError::Open { key }) => return Err(PoolError::CircuitOpen { key }),
        }

        if self.remove(handle) {
            self.destroy(handle).await;
            self.inner.released.notify_waiters();
            self.ensure_min_size().await;
        }
        Ok(false)
    }

    /// Takes `handle` out of the pool. Returns false if it was not a member.
    fn remove(&self, handle: &Handle<M::Resource>) -> bool {
        let id = handle.id();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        match state.members.remove(&id) {
            Some(member) if member.in_use => {
                state.in_use -= 1;
                true
            }
            Some(_) => {
                state.idle.retain(|idle| idle.id() != id);
                true
            }
            None => false,
        }
    }

    /// Health-checks each handle that is idle when the call starts.
    /// Returns how many were removed.
    pub async fn check_idle(&self) -> usize {
        let rounds = self.inner.state.lock().idle.len();
        let mut removed = 0;

        for _ in 0..rounds {
            let handle = match self.try_take_idle() {
                Some(handle) => handle,
                None => break,
            };

            match self.health_check(&handle).await {
                Ok(true) => {
                    let _ = self.release(&handle);
                }
                Ok(false) => removed += 1,
                Err(err) => {
                    let _ = self.release(&handle);
                    debug!(pool = %self.inner.config.name, error = %err, "idle check stopped");
                    break;
                }
            }
        }

        removed
    }

    fn try_take_idle(&self) -> Option<Handle<M::Resource>> {
        match self.try_take() {
            Take::Ready(handle) => Some(handle),
            // Dropping a reservation returns the room it took.
            Take::Create(_) | Take::Wait | Take::Closed => None,
        }
    }

    /// Spawns a task that runs [`check_idle`](Self::check_idle) every
    /// `interval` until the pool is shut down.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                let removed = pool.check_idle().await;
                if removed > 0 {
                    info!(pool = %pool.inner.config.name, removed, "maintenance removed unhealthy handles");
                }
            }
        })
    }

    /// Creates idle handles until the pool holds `min_size`. Creation errors
    /// are logged and stop the refill. Returns how many were created.
    pub async fn ensure_min_size(&self) -> usize {
        match self.fill_to_min().await {
            Ok(created) => created,
            Err((created, err)) => {
                warn!(pool = %self.inner.config.name, error = %err, "could not restore min_size");
                created
            }
        }
    }

    pub(crate) async fn warm_up(&self) -> PoolResult<(), M::Error> {
        let created = self.fill_to_min().await.map_err(|(_, err)| err)?;
        info!(
            pool = %self.inner.config.name,
            created,
            max_size = self.inner.config.max_size,
            "pool ready"
        );
        Ok(())
    }

    async fn fill_to_min(&self) -> Result<usize, (usize, PoolError<M::Error>)> {
        let mut created = 0;
        loop {
            let reservation = {
                let mut state = self.inner.state.lock();
                if state.closed || state.total() + state.pending >= self.inner.config.min_size {
                    None
                } else {
                    state.pending += 1;
                    Some(Reservation {
                        pool: &*self.inner,
                        committed: false,
                    })
                }
            };
            let Some(reservation) = reservation else {
                return Ok(created);
            };
            match self.create_handle(reservation, false).await {
                Ok(_) => created += 1,
                Err(err) => return Err((created, err)),
            }
        }
    }

    async fn create_handle(
        &self,
        reservation: Reservation<'_, M>,
        in_use: bool,
    ) -> PoolResult<Handle<M::Resource>, M::Error> {
        let inner = &self.inner;
        let resource = retry::retry_operation(
            &inner.breaker,
            &inner.scheduler,
            &inner.create_key,
            &inner.config.retry,
            || inner.manager.create(),
        )
        .await
        .map_err(|err| match err {
            PoolError::Operation { attempts, source } => PoolError::Create { attempts, source },
            other => other,
        })?;

        let id = inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let handle = Handle::new(id, inner.id, resource);

        let closed = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            reservation.commit(state);
            if state.closed {
                true
            } else {
                state.members.insert(
                    id,
                    Member {
                        handle: handle.clone(),
                        in_use,
                    },
                );
                if in_use {
                    state.in_use += 1;
                } else if state.idle.try_push(handle.clone()).is_err() {
                    state.members.remove(&id);
                }
                false
            }
        };

        if closed {
            inner.manager.destroy(&handle).await;
            return Err(PoolError::Closed);
        }

        debug!(pool = %inner.config.name, handle_id = id, in_use, "handle created");
        inner.metric_sink.record_created(&inner.config.name);
        if !in_use {
            inner.released.notify_waiters();
        }
        Ok(handle)
    }

    async fn destroy(&self, handle: &Handle<M::Resource>) {
        self.inner.manager.destroy(handle).await;
        debug!(pool = %self.inner.config.name, handle_id = handle.id(), "handle destroyed");
        self.inner.metric_sink.record_destroyed(&self.inner.config.name);
    }

    /// Runs `op` under the `<name>:<op_name>` breaker, retrying failures
    /// with this pool's backoff scheduler.
    pub async fn retry_operation<F, Fut, T, E>(
        &self,
        op_name: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> PoolResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let key = format!("{}:{}", self.inner.config.name, op_name);
        retry::retry_operation(&self.inner.breaker, &self.inner.scheduler, &key, policy, op).await
    }

    /// Stops handing out handles and destroys them all.
    ///
    /// Idle handles are destroyed at once. Checked-out handles are waited
    /// for up to `grace`, then destroyed whether returned or not. Pending
    /// and future `acquire` calls fail with [`PoolError::Closed`].
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let idle: Vec<_> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.closed = true;
            let drained: Vec<_> = state.idle.drain().collect();
            for handle in &drained {
                state.members.remove(&handle.id());
            }
            drained
        };
        self.inner.released.notify_waiters();
        info!(pool = %self.inner.config.name, idle = idle.len(), "pool shutting down");

        let mut report = ShutdownReport {
            idle_destroyed: idle.len(),
            ..ShutdownReport::default()
        };
        for handle in &idle {
            self.destroy(handle).await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().in_use == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let remaining: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.in_use = 0;
            state.members.drain().map(|(_, member)| member).collect()
        };
        for member in remaining {
            if member.in_use {
                warn!(
                    pool = %self.inner.config.name,
                    handle_id = member.handle.id(),
                    "handle still checked out after grace period; destroying"
                );
                report.forced += 1;
            } else {
                report.drained += 1;
            }
            self.destroy(&member.handle).await;
        }

        info!(
            pool = %self.inner.config.name,
            idle_destroyed = report.idle_destroyed,
            drained = report.drained,
            forced = report.forced,
            "pool shut down"
        );
        report
    }

    /// [`shutdown`](Self::shutdown) with the configured `shutdown_grace`.
    pub async fn close(&self) -> ShutdownReport {
        self.shutdown(self.inner.config.shutdown_grace).await
    }
}
