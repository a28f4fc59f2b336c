//! Connections which are checked out of a connection pool.

use crate::connection::{self, Connection};
use crate::context::Context;
use crate::pool::PoolInner;

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// A [Connection] which is returned to its pool when dropped.
///
/// Implements [std::ops::Deref], so callers can use a handle as a
/// connection. Closing the connection through the handle makes the pool
/// discard it instead of caching it.
///
/// Reads and writes made through the handle report their errors to the
/// owning server, which may mark itself Unknown.
pub struct Handle {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl Handle {
    pub(crate) fn new(conn: Connection, permit: OwnedSemaphorePermit, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
            pool,
        }
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    pub async fn write_wire_message(
        &self,
        ctx: &Context,
        message: &[u8],
    ) -> Result<(), connection::Error> {
        let conn: &Connection = self;
        let result = conn.write_wire_message(ctx, message).await;
        if let Err(err) = &result {
            self.pool.report_error(conn, err);
        }
        result
    }

    pub async fn read_wire_message(&self, ctx: &Context) -> Result<Vec<u8>, connection::Error> {
        let conn: &Connection = self;
        let result = conn.read_wire_message(ctx).await;
        if let Err(err) = &result {
            self.pool.report_error(conn, err);
        }
        result
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("conn", &self.conn).finish()
    }
}

impl std::ops::Deref for Handle {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
        // Capacity is released only once the connection is back.
        drop(self.permit.take());
    }
}
