//! # Connection Pool
//!
//! Fixed-size pool of handles to an external resource (typically a database connection),
//! used to serialise access from many connection threads.
//!
//! ## Guarantees
//! - Every handle is opened up front; a failure to open any of them fails the pool
//! - A handle is either in the free set or owned by exactly one [`PooledConnection`]
//! - The handle goes back to the free set when its `PooledConnection` is dropped, on
//!   every exit path including unwinding, and one waiter is woken
//!
//! ## Usage
//! ```rust,no_run
//! use aether::utils::pool::ConnectionPool;
//!
//! let pool = ConnectionPool::open(5, |_| Ok(Vec::<u8>::new())).unwrap();
//! let mut conn = pool.acquire(); // blocks while all handles are out
//! conn.push(42);
//! // handle returned to the pool on drop
//! ```
//!
//! [`acquire`](ConnectionPool::acquire) waits as long as it takes.
//! [`acquire_timeout`](ConnectionPool::acquire_timeout) and
//! [`try_acquire`](ConnectionPool::try_acquire) are the bounded alternatives.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};

struct Shared<R> {
    free: Mutex<VecDeque<R>>,
    returned: Condvar,
    size: usize,
}

impl<R> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<R>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, handle: R) {
        self.lock().push_back(handle);
        self.returned.notify_one();
    }
}

/// A handle checked out of the pool; returns itself on drop.
pub struct PooledConnection<R> {
    handle: Option<R>,
    pool: Arc<Shared<R>>,
}

impl<R> Deref for PooledConnection<R> {
    type Target = R;

    fn deref(&self) -> &R {
        // Only `Drop` takes the handle out
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<R> DerefMut for PooledConnection<R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<R> Drop for PooledConnection<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
            trace!("Pooled handle released");
        }
    }
}

/// Thread-safe fixed-size pool
pub struct ConnectionPool<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for ConnectionPool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R> ConnectionPool<R> {
    /// Open `size` handles through `factory`, called with the handle index.
    pub fn open<F>(size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<R>,
    {
        if size == 0 {
            return Err(ProtocolError::PoolError(constants::ERR_POOL_EMPTY.to_string()));
        }

        let mut free = VecDeque::with_capacity(size);
        for index in 0..size {
            free.push_back(factory(index)?);
        }
        debug!(size, "Connection pool opened");

        Ok(Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                returned: Condvar::new(),
                size,
            }),
        })
    }

    fn checkout(&self, handle: R) -> PooledConnection<R> {
        PooledConnection {
            handle: Some(handle),
            pool: self.shared.clone(),
        }
    }

    /// Take a handle, blocking the calling thread until one is free.
    pub fn acquire(&self) -> PooledConnection<R> {
        let mut free = self.shared.lock();
        loop {
            if let Some(handle) = free.pop_front() {
                drop(free);
                return self.checkout(handle);
            }
            free = self
                .shared
                .returned
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take a handle, waiting at most `limit`.
    pub fn acquire_timeout(&self, limit: Duration) -> Result<PooledConnection<R>> {
        let free = self.shared.lock();
        let (mut free, _) = self
            .shared
            .returned
            .wait_timeout_while(free, limit, |free| free.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        match free.pop_front() {
            Some(handle) => {
                drop(free);
                Ok(self.checkout(handle))
            }
            None => Err(ProtocolError::Timeout(format!(
                "no pooled handle free after {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// Take a handle if one is free right now.
    pub fn try_acquire(&self) -> Option<PooledConnection<R>> {
        let handle = self.shared.lock().pop_front()?;
        Some(self.checkout(handle))
    }

    /// Handles currently in the free set
    pub fn available(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }
}
