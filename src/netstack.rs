//! Userspace IP stack contracts
//!
//! The stack primitive that parses raw IP packets and reassembles flows
//! lives outside this crate. These traits are the seam it hands flows
//! through: a [`TcpFlow`] per accepted TCP connection and a [`UdpFlow`]
//! per UDP 5-tuple. Handlers are called on stack-owned context and must
//! not block; the engines spawn immediately.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A stream the stack exposes for an accepted TCP flow.
pub trait StackStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StackStream for T {}

/// One accepted TCP connection from the stack.
///
/// The stack holds the client in SYN-received state until
/// [`TcpFlow::establish`] resolves the handshake one way or the other.
#[async_trait]
pub trait TcpFlow: Send {
    /// Client (tunnel-side) address.
    fn src(&self) -> SocketAddr;

    /// Destination address as the client dialed it; a synthetic IP when
    /// the ALG answered the client's DNS query.
    fn dst(&self) -> SocketAddr;

    /// Finish the stack-side handshake: SYN-ACK on `true`, RST on `false`.
    ///
    /// # Errors
    ///
    /// Propagates stack errors (e.g. no route back to the client).
    async fn establish(&mut self, accept: bool) -> io::Result<()>;

    /// Take the byte stream. Only valid after an accepting `establish`.
    fn into_stream(self: Box<Self>) -> Box<dyn StackStream>;
}

/// One UDP 5-tuple mapping surfaced by the stack.
///
/// Egress datagrams are pushed by the stack into the engine; ingress
/// datagrams are written back through [`UdpFlow::write_from`] with the
/// masqueraded source the client expects.
#[async_trait]
pub trait UdpFlow: Send + Sync {
    /// Client (tunnel-side) address.
    fn src(&self) -> SocketAddr;

    /// Destination address as the client sent it.
    fn dst(&self) -> SocketAddr;

    /// Accept or refuse the mapping.
    ///
    /// # Errors
    ///
    /// Propagates stack errors.
    async fn establish(&self, accept: bool) -> io::Result<()>;

    /// Write a datagram back into the stack, addressed from `from`.
    ///
    /// # Errors
    ///
    /// Propagates stack write errors.
    async fn write_from(&self, data: &[u8], from: SocketAddr) -> io::Result<usize>;

    /// Tear the mapping down on the stack side.
    async fn close(&self);
}
