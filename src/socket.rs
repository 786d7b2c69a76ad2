//! Socket façade fd bookkeeping: turns the embedder's `socket`/
//! `listen`/`accept`/`read`/`write` into lookups keyed by a small integer
//! the embedder already holds, the way a kernel's fd table does.
//! The protocol-level work (segment emission, window bookkeeping) lives in
//! `tcp::manager`; this module only ever answers "which four-tuple/listener
//! does this fd mean".

use std::collections::HashMap;

use crate::addr::{Endpoint, FourTuple};
use crate::result::{Error, Result};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FdState {
    /// `socket()` was called with this local endpoint but neither `listen`
    /// nor `connect` has resolved it to a role yet.
    Bound { local: Endpoint },
    Listening { local: Endpoint },
    Connected { four_tuple: FourTuple },
    /// the peer's FIN/RST already tore the TCB down, or we closed our side;
    /// the fd is retained so a late `read`/`write` gets a clean error rather
    /// than reusing a stale fd number.
    Closed,
}

#[derive(Default)]
pub struct SocketTable {
    next_fd: i32,
    next_ephemeral_port: u16,
    entries: HashMap<i32, FdState>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self {
            next_fd: 0,
            next_ephemeral_port: FIRST_EPHEMERAL_PORT,
            entries: HashMap::new(),
        }
    }

    pub fn allocate_ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral_port;
        self.next_ephemeral_port = self.next_ephemeral_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        port
    }

    fn allocate_fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    pub fn socket(&mut self, local: Endpoint) -> i32 {
        let fd = self.allocate_fd();
        self.entries.insert(fd, FdState::Bound { local });
        fd
    }

    /// Inserts a fd already bound to a specific role, used for the fd handed
    /// back by `accept` (whose four-tuple the manager already resolved) and
    /// for `async_connect` (whose four-tuple is known before the SYN is even
    /// on the wire).
    pub fn insert_connected(&mut self, four_tuple: FourTuple) -> i32 {
        let fd = self.allocate_fd();
        self.entries.insert(fd, FdState::Connected { four_tuple });
        fd
    }

    pub fn state(&self, fd: i32) -> Result<FdState> {
        self.entries.get(&fd).copied().ok_or(Error::UnknownFd(fd))
    }

    pub fn mark_listening(&mut self, fd: i32) -> Result<Endpoint> {
        match self.state(fd)? {
            FdState::Bound { local } => {
                self.entries.insert(fd, FdState::Listening { local });
                Ok(local)
            }
            _ => Err(Error::UnknownFd(fd)),
        }
    }

    pub fn listening_endpoint(&self, fd: i32) -> Result<Endpoint> {
        match self.state(fd)? {
            FdState::Listening { local } => Ok(local),
            _ => Err(Error::UnknownFd(fd)),
        }
    }

    pub fn connected_four_tuple(&self, fd: i32) -> Result<FourTuple> {
        match self.state(fd)? {
            FdState::Connected { four_tuple } => Ok(four_tuple),
            _ => Err(Error::UnknownFd(fd)),
        }
    }

    pub fn close(&mut self, fd: i32) -> Result<FdState> {
        let prev = self.state(fd)?;
        self.entries.insert(fd, FdState::Closed);
        Ok(prev)
    }
}
