//! Small shared primitives

mod expiring;

pub use expiring::ExpiringCounter;

/// Network protocol tag used by DNS transports and proxy dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetProto {
    /// Datagram
    Udp,
    /// Stream
    Tcp,
}

impl NetProto {
    /// The conventional lowercase name ("udp" / "tcp").
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for NetProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
