//! Server-side SOCKS5 framing (RFC 1928, RFC 1929).
//!
//! The acceptor is staged so the caller can run its own authentication and
//! admission decisions at the right points of the wire exchange: greeting →
//! credential read → grant/deny → request read → final reply.

mod socks5;

pub use socks5::{Command, DestAddr, Socks5Acceptor, Socks5FailureCode, SocksRequest};

use tokio::io::{AsyncRead, AsyncWrite};

/// We need a super-trait in order to have additional non-auto-trait traits in trait objects.
///
/// The reason for using trait objects is monomorphization prevention in generic code.
/// This is for reducing code size by avoiding function duplication.
///
/// See:
/// - https://doc.rust-lang.org/std/keyword.dyn.html
/// - https://doc.rust-lang.org/reference/types/trait-object.html
trait ReadWriteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> ReadWriteStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}
