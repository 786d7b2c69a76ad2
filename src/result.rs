use std::net::{Ipv4Addr, SocketAddrV4};

pub type Result<T> = std::result::Result<T, Error>;

/// Every fallible boundary in the stack funnels through this type. Local
/// I/O failure and resource exhaustion are the only categories an embedder
/// ever observes directly; the rest are logged and swallowed at the layer
/// where they occur, but still flow through `Result` internally so the
/// logging call sites stay uniform.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// a computed checksum did not verify
    Checksum,
    /// header too short, bad version, or an option area that does not parse;
    /// the string names which header
    Malformed(&'static str),
    /// IPv4 egress found no routing-table entry and no default route
    NoRoute(Ipv4Addr),
    AddrInUse(SocketAddrV4),
    AddrNotAvailable,
    /// the embedder API's `-ENOENT` case: unknown fd
    UnknownFd(i32),
    /// the embedder API's `-EOVERFLOW` case
    Overflow,
    /// a parked reader/acceptor whose socket was closed out from under it
    Aborted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Checksum => write!(f, "checksum mismatch"),
            Error::Malformed(what) => write!(f, "malformed {}", what),
            Error::NoRoute(dst) => write!(f, "no route to {}", dst),
            Error::AddrInUse(addr) => write!(f, "address in use: {}", addr),
            Error::AddrNotAvailable => write!(f, "address not available"),
            Error::UnknownFd(fd) => write!(f, "unknown fd {}", fd),
            Error::Overflow => write!(f, "buffer too small"),
            Error::Aborted => write!(f, "operation aborted"),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ($err:ty,$en:ident) => {
        impl From<$err> for Error {
            fn from(err: $err) -> Self {
                Error::$en(err)
            }
        }
    };
}

impl_error!(std::io::Error, Io);

/// Maps an `Error` onto the embedder-facing integer error codes: negative
/// `errno`-style codes, nonnegative byte counts on success.
impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::UnknownFd(_) => -libc_enoent(),
            Error::Overflow => -libc_eoverflow(),
            Error::AddrInUse(_) => -98,
            Error::AddrNotAvailable => -99,
            _ => -1,
        }
    }
}

const fn libc_enoent() -> i32 {
    2
}

const fn libc_eoverflow() -> i32 {
    75
}
