//! Networking module for peer-to-peer communication.
//!
//! Every exchange is one newline-terminated envelope on a fresh TCP
//! connection, closed by the sender after writing.

use crate::config::{NodeConfig, RetryPolicy};
use crate::error::{MedchainError, NetworkError, ProtocolError};
use crate::protocol::Envelope;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Check that `addr` has the form `host:port`
pub fn validate_address(addr: &str) -> Result<(), NetworkError> {
    let invalid = |reason: &str| NetworkError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port number"))?;
    Ok(())
}

/// Read exactly one envelope from an inbound connection
pub async fn read_envelope<S>(
    stream: S,
    peer: &str,
    max_message_size: usize,
    read_timeout: Duration,
) -> Result<Envelope, MedchainError>
where
    S: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(max_message_size));
    let next = timeout(read_timeout, lines.next())
        .await
        .map_err(|_| NetworkError::Timeout {
            addr: peer.to_string(),
            duration: read_timeout,
        })?;
    match next {
        None => Err(ProtocolError::EmptyMessage.into()),
        Some(Ok(line)) => Ok(Envelope::from_json(&line)?),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(ProtocolError::MessageTooLarge {
            max_size: max_message_size,
        }
        .into()),
        Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
            Err(ProtocolError::InvalidFraming {
                reason: e.to_string(),
            }
            .into())
        },
        Some(Err(LinesCodecError::Io(source))) => Err(NetworkError::ReceiveFailed {
            addr: peer.to_string(),
            source,
        }
        .into()),
    }
}

/// Write one envelope as a single line and close the write half
pub async fn write_envelope<S>(stream: S, envelope: &Envelope) -> Result<(), MedchainError>
where
    S: AsyncWrite + Unpin,
{
    let line = envelope.to_json()?;
    let mut sink = FramedWrite::new(stream, LinesCodec::new());
    sink.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(e) => MedchainError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::InvalidFraming {
            reason: "line too long".to_string(),
        }
        .into(),
    })?;
    sink.into_inner().shutdown().await?;
    Ok(())
}

/// Outbound side of the protocol: fire-and-forget sends with timeouts and
/// bounded retries
#[derive(Debug, Clone)]
pub struct PeerClient {
    connect_timeout: Duration,
    write_timeout: Duration,
    retry: RetryPolicy,
}

impl PeerClient {
    pub fn new(connect_timeout: Duration, write_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            connect_timeout,
            write_timeout,
            retry,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.connect_timeout(),
            config.write_timeout(),
            config.retry.clone(),
        )
    }

    /// Deliver `envelope` to `addr`, retrying transient failures
    pub async fn send(&self, addr: &str, envelope: &Envelope) -> Result<(), NetworkError> {
        validate_address(addr)?;
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_once(addr, envelope).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.is_transient() => {
                    let delay = with_jitter(self.retry.backoff(attempt));
                    debug!(
                        "Send of {} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        envelope.message_type, addr, attempt, attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    warn!("Giving up sending {} to {}: {}", envelope.message_type, addr, e);
                    return Err(e);
                },
            }
        }
    }

    /// Send each envelope to its address concurrently. One peer's failure
    /// never prevents delivery to the others.
    pub async fn send_all(
        &self,
        deliveries: Vec<(String, Envelope)>,
    ) -> Vec<(String, Result<(), NetworkError>)> {
        let sends = deliveries.into_iter().map(|(addr, envelope)| async move {
            let result = self.send(&addr, &envelope).await;
            (addr, result)
        });
        futures::future::join_all(sends).await
    }

    /// One connect-write-close cycle, no retry
    pub async fn send_once(&self, addr: &str, envelope: &Envelope) -> Result<(), NetworkError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout {
                addr: addr.to_string(),
                duration: self.connect_timeout,
            })?
            .map_err(|source| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                source,
            })?;

        let write = write_envelope(stream, envelope);
        match timeout(self.write_timeout, write).await {
            Err(_) => Err(NetworkError::Timeout {
                addr: addr.to_string(),
                duration: self.write_timeout,
            }),
            Ok(Ok(())) => Ok(()),
            Ok(Err(MedchainError::Network(e))) => Err(e),
            Ok(Err(MedchainError::Io(source))) => Err(NetworkError::SendFailed {
                addr: addr.to_string(),
                source,
            }),
            Ok(Err(other)) => Err(NetworkError::SendFailed {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
            }),
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let half = (base.as_millis() as u64) / 2;
    if half == 0 {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=half);
    base + Duration::from_millis(extra)
}
