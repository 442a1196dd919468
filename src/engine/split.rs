//! ClientHello splitting
//!
//! Direct flows to port 443 get their first upstream write fragmented into
//! two TCP segments at a random offset, which defeats filters that match
//! the SNI against the first segment alone. The second segment is retried
//! once on failure, under a deadline derived from how long the upstream
//! dial took. Everything after the first write passes through untouched.

use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Writes shorter than this go out unsplit; anything longer leaves at
/// least this many bytes on each side of the cut.
const MIN_SPLIT_MARGIN: usize = 32;

/// Deadline floor for the second segment.
const MIN_RETRY_TIMEOUT: Duration = Duration::from_millis(800);

/// Deadline ceiling for the second segment.
const MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the second segment, derived from the dial latency.
#[must_use]
pub fn calc_timeout(dial_latency: Duration) -> Duration {
    (dial_latency * 3).clamp(MIN_RETRY_TIMEOUT, MAX_RETRY_TIMEOUT)
}

/// Write wrapper that splits the first write in two.
pub struct HelloSplitWriter<W> {
    inner: W,
    deadline: Duration,
    first_done: bool,
}

impl<W: AsyncWrite + Unpin> HelloSplitWriter<W> {
    /// Wrap `inner`; `dial_latency` sizes the retry deadline.
    #[must_use]
    pub fn new(inner: W, dial_latency: Duration) -> Self {
        Self {
            inner,
            deadline: calc_timeout(dial_latency),
            first_done: false,
        }
    }

    /// Write `buf`, splitting it when it is the flow's first write.
    ///
    /// # Errors
    ///
    /// Propagates write errors; the second segment gets one retry within
    /// the deadline before the error surfaces.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.first_done {
            return self.inner.write_all(buf).await;
        }
        self.first_done = true;

        if buf.len() < 2 * MIN_SPLIT_MARGIN {
            return self.inner.write_all(buf).await;
        }

        let at = rand::thread_rng().gen_range(MIN_SPLIT_MARGIN..=buf.len() - MIN_SPLIT_MARGIN);
        debug!("split: first write {} bytes at {at}", buf.len());

        self.inner.write_all(&buf[..at]).await?;
        self.inner.flush().await?;

        match timeout(self.deadline, self.inner.write_all(&buf[at..])).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("split: second segment failed ({e}); retrying");
                timeout(self.deadline, self.inner.write_all(&buf[at..]))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "split retry timed out"))?
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "split second segment timed out",
            )),
        }
    }

    /// Shut the writer down.
    ///
    /// # Errors
    ///
    /// Propagates shutdown errors.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// The upload pump's writer: plain passthrough, or hello-splitting for
/// direct :443 flows.
pub enum UpstreamWriter<W> {
    /// Unmodified writes
    Plain(W),
    /// First write split in two
    Split(HelloSplitWriter<W>),
}

impl<W: AsyncWrite + Unpin> UpstreamWriter<W> {
    /// A passthrough writer.
    #[must_use]
    pub fn plain(inner: W) -> Self {
        Self::Plain(inner)
    }

    /// A hello-splitting writer.
    #[must_use]
    pub fn split(inner: W, dial_latency: Duration) -> Self {
        Self::Split(HelloSplitWriter::new(inner, dial_latency))
    }

    /// Write all of `buf`.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.write_all(buf).await,
            Self::Split(w) => w.write_all(buf).await,
        }
    }

    /// Half-close the upstream direction.
    ///
    /// # Errors
    ///
    /// Propagates shutdown errors.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.shutdown().await,
            Self::Split(w) => w.shutdown().await,
        }
    }
}
