//! Protected dialing
//!
//! Outbound sockets are created here and offered to the embedder's
//! [`Controller`] before connecting, so it can bind them to a source
//! interface (or otherwise protect them from being routed back into the
//! tunnel). Every proxy dials through a [`Dialer`].

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::trace;

/// Interface-selection callbacks invoked with a socket fd during dialing.
pub trait Controller: Send + Sync {
    /// Called with every outbound IPv4 socket before it connects.
    fn bind4(&self, who: &str, fd: i32);

    /// Called with every outbound IPv6 socket before it connects.
    fn bind6(&self, who: &str, fd: i32);
}

/// A controller that leaves sockets alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopController;

impl Controller for NoopController {
    fn bind4(&self, _who: &str, _fd: i32) {}

    fn bind6(&self, _who: &str, _fd: i32) {}
}

const KEEPALIVE_TIME: Duration = Duration::from_secs(600);

/// Direct dialer bound to a named owner; `who` is passed to the controller
/// so the embedder can tell proxies apart.
pub struct Dialer {
    who: String,
    ctl: Arc<dyn Controller>,
}

impl Dialer {
    /// Create a dialer owned by `who`.
    #[must_use]
    pub fn new(who: impl Into<String>, ctl: Arc<dyn Controller>) -> Self {
        Self {
            who: who.into(),
            ctl,
        }
    }

    /// The owner name given to the controller.
    #[must_use]
    pub fn who(&self) -> &str {
        &self.who
    }

    /// Dial a TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Propagates socket creation and connect errors.
    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.protect(addr, socket.as_raw_fd());

        let stream = socket.connect(addr).await?;
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);
        trace!("dialer({}): tcp {addr} connected", self.who);
        Ok(stream)
    }

    /// Dial a connected UDP socket to `addr`.
    ///
    /// # Errors
    ///
    /// Propagates bind and connect errors.
    pub async fn dial_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("wildcard v4")
        } else {
            "[::]:0".parse().expect("wildcard v6")
        };
        let socket = UdpSocket::bind(local).await?;
        self.protect(addr, socket.as_raw_fd());

        socket.connect(addr).await?;
        trace!("dialer({}): udp {addr} connected", self.who);
        Ok(socket)
    }

    fn protect(&self, addr: SocketAddr, fd: i32) {
        if addr.is_ipv4() {
            self.ctl.bind4(&self.who, fd);
        } else {
            self.ctl.bind6(&self.who, fd);
        }
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("who", &self.who).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingController {
        v4: AtomicUsize,
        v6: AtomicUsize,
    }

    impl Controller for CountingController {
        fn bind4(&self, _who: &str, fd: i32) {
            assert!(fd >= 0);
            self.v4.fetch_add(1, Ordering::SeqCst);
        }

        fn bind6(&self, _who: &str, fd: i32) {
            assert!(fd >= 0);
            self.v6.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_tcp_dial_invokes_controller() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctl = Arc::new(CountingController {
            v4: AtomicUsize::new(0),
            v6: AtomicUsize::new(0),
        });
        let dialer = Dialer::new("Base", Arc::clone(&ctl) as Arc<dyn Controller>);

        let stream = dialer.dial_tcp(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(ctl.v4.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.v6.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_udp_dial_connects() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let dialer = Dialer::new("Exit", Arc::new(NoopController));
        let socket = dialer.dial_udp(addr).await.unwrap();

        socket.send(b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        // Port 1 on loopback is almost certainly closed.
        let dialer = Dialer::new("Base", Arc::new(NoopController));
        let err = dialer
            .dial_tcp("127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
