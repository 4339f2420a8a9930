//! A small pool of database connections.
//!
//! Connections are opened eagerly at mount time. Each VFS request borrows
//! one for the whole duration of its transaction and hands it back when the
//! handler returns; the RAII guard makes the hand-back unconditional. A slot
//! whose connection went bad is marked broken and never handed out again.
//! In single-threaded mode the pool simply holds one connection.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use libc::{EIO, c_int};
use log::{debug, error};
use postgres::{Client, NoTls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Available,
    InUse(ThreadId),
    Broken,
}

struct Slot {
    conn: Option<Client>,
    state: SlotState,
}

pub struct ConnPool {
    slots: Mutex<Vec<Slot>>,
    cond: Condvar,
}

impl ConnPool {
    /// Open `size` connections up front. Individual failures only mark the
    /// slot broken; not getting a single connection is fatal.
    pub fn connect(conninfo: &str, size: usize) -> Result<ConnPool, String> {
        let mut slots = Vec::with_capacity(size);
        let mut healthy = 0;
        for i in 0..size {
            match Client::connect(conninfo, NoTls) {
                Ok(conn) => {
                    healthy += 1;
                    slots.push(Slot {
                        conn: Some(conn),
                        state: SlotState::Available,
                    });
                }
                Err(e) => {
                    error!("connection {} of {size} to the database failed: {e}", i + 1);
                    slots.push(Slot {
                        conn: None,
                        state: SlotState::Broken,
                    });
                }
            }
        }
        if healthy == 0 {
            return Err(format!(
                "unable to open any of {size} connections to the database"
            ));
        }
        Ok(ConnPool {
            slots: Mutex::new(slots),
            cond: Condvar::new(),
        })
    }

    /// Borrow a healthy connection, waiting when all of them are in use.
    /// Fails with `EIO` once every slot is broken.
    pub fn acquire(&self) -> Result<PooledConn<'_>, c_int> {
        let me = thread::current().id();
        let mut slots = self.slots.lock().map_err(|_| {
            error!("connection pool lock poisoned");
            EIO
        })?;
        loop {
            let mut any_alive = false;
            let mut found = None;
            for (i, slot) in slots.iter_mut().enumerate() {
                match slot.state {
                    SlotState::Available => {
                        let healthy = slot.conn.as_ref().is_some_and(|c| !c.is_closed());
                        if healthy {
                            found = Some(i);
                            break;
                        }
                        // gone bad since the last acquire
                        error!("pool connection {i} is closed, marking it broken");
                        slot.conn = None;
                        slot.state = SlotState::Broken;
                    }
                    SlotState::InUse(_) => any_alive = true,
                    SlotState::Broken => {}
                }
            }

            if let Some(i) = found {
                let slot = &mut slots[i];
                if let Some(conn) = slot.conn.take() {
                    slot.state = SlotState::InUse(me);
                    debug!("thread {me:?} acquired pool connection {i}");
                    return Ok(PooledConn {
                        pool: self,
                        index: i,
                        conn: Some(conn),
                    });
                }
            }

            if !any_alive {
                error!("all pool connections are broken");
                return Err(EIO);
            }

            slots = self.cond.wait(slots).map_err(|_| {
                error!("connection pool lock poisoned");
                EIO
            })?;
        }
    }

    fn release(&self, index: usize, conn: Client) {
        if let Ok(mut slots) = self.slots.lock() {
            let slot = &mut slots[index];
            slot.conn = Some(conn);
            slot.state = SlotState::Available;
        }
        self.cond.notify_one();
    }

    pub fn size(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A connection on loan from the pool; returns itself on drop and wakes one
/// waiter.
pub struct PooledConn<'a> {
    pool: &'a ConnPool,
    index: usize,
    conn: Option<Client>,
}

impl Deref for PooledConn<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.conn.as_ref().expect("pooled connection present until drop")
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.conn.as_mut().expect("pooled connection present until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.index, conn);
        }
    }
}
