//! A bounded per-server connection pool (spec §3 "Connection pool", §4.2).
//!
//! `acquire` never blocks: it pops an idle connection or creates one via
//! the factory. `release` (via the [`Checkout`] guard's `Drop`) discards
//! the connection silently if the idle set is already full. A connection
//! that errored during use is never returned — the caller (the single-op
//! or multi-op engine) calls [`Checkout::discard`] on that path instead of
//! letting the guard drop normally.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::Error;
use crate::ring::Endpoint;

pub const DEFAULT_MAX_IDLE: usize = 5;

pub struct ConnectionPool<C: Connection> {
    endpoint: Endpoint,
    max_idle: usize,
    idle: Mutex<Vec<C>>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(endpoint: Endpoint, max_idle: usize) -> Arc<Self> {
        Arc::new(ConnectionPool {
            endpoint,
            max_idle,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
        })
    }

    /// Check out a connection, creating one lazily if the idle set is
    /// empty. Never blocks waiting for another caller to release one.
    pub async fn acquire(self: &Arc<Self>) -> Result<Checkout<C>, Error> {
        let existing = self.idle.lock().pop();
        let conn = match existing {
            Some(conn) => conn,
            None => C::connect(&self.endpoint).await?,
        };
        Ok(Checkout {
            pool: Some(self.clone()),
            conn: Some(conn),
        })
    }

    fn release(&self, conn: C) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
        // else: idle set full, the connection is dropped here.
    }

    /// Drop every idle connection. Used by the stale-connection recovery
    /// path (spec §4.2 invariant I7) and by `Client::close`.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// An exclusively-owned connection checked out of a pool. Returns itself
/// to the pool on drop unless [`discard`](Checkout::discard) was called.
pub struct Checkout<C: Connection> {
    pool: Option<Arc<ConnectionPool<C>>>,
    conn: Option<C>,
}

impl<C: Connection> Checkout<C> {
    /// Consume the checkout without returning the connection to the pool.
    /// Call this after an I/O error: the reference implementation does not
    /// reuse a connection that raised mid-operation (spec §4.2).
    pub fn discard(mut self) {
        self.conn.take();
        self.pool.take();
    }
}

impl<C: Connection> Deref for Checkout<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("checkout used after discard")
    }
}

impl<C: Connection> DerefMut for Checkout<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("checkout used after discard")
    }
}

impl<C: Connection> Drop for Checkout<C> {
    fn drop(&mut self) {
        if let (Some(pool), Some(conn)) = (self.pool.take(), self.conn.take()) {
            pool.release(conn);
        }
    }
}
