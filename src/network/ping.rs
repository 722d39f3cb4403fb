//! Ping protocol
//!
//! The initiator writes a 32 byte random nonce and expects the same bytes
//! back. The responder echoes everything it reads until the stream closes.
//! Payloads are raw bytes with no framing.

use crate::network::error::P2pError;
use rand::RngCore;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ping payload size
pub const PING_SIZE: usize = 32;

/// Send one ping over `stream` and wait for the matching pong.
///
/// Returns the round trip time. The caller owns the deadline.
pub async fn send_ping<S>(stream: &mut S) -> Result<Duration, P2pError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; PING_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let started = Instant::now();
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut pong = [0u8; PING_SIZE];
    let mut filled = 0;
    while filled < PING_SIZE {
        let n = stream.read(&mut pong[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled != PING_SIZE || pong != nonce {
        return Err(P2pError::PongMismatch);
    }

    Ok(started.elapsed())
}

/// Echo every byte read from `stream` back to it until EOF
pub async fn echo<S>(stream: S) -> Result<u64, P2pError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (mut client, server) = tokio::io::duplex(256);
        let responder = tokio::spawn(echo(server));

        let rtt = send_ping(&mut client).await.unwrap();
        assert!(rtt < Duration::from_secs(5));

        drop(client);
        assert_eq!(responder.await.unwrap().unwrap(), PING_SIZE as u64);
    }

    #[tokio::test]
    async fn test_pong_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; PING_SIZE];
            server.read_exact(&mut buf).await.unwrap();
            buf[0] ^= 0xff;
            server.write_all(&buf).await.unwrap();
        });

        assert!(matches!(
            send_ping(&mut client).await,
            Err(P2pError::PongMismatch)
        ));
    }

    #[tokio::test]
    async fn test_short_pong() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; PING_SIZE];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&buf[..PING_SIZE / 2]).await.unwrap();
            // Dropping the server ends the stream early
        });

        assert!(matches!(
            send_ping(&mut client).await,
            Err(P2pError::PongMismatch)
        ));
    }

    #[tokio::test]
    async fn test_silent_responder_times_out() {
        let (mut client, _server) = tokio::io::duplex(256);
        let res = timeout(Duration::from_millis(50), send_ping(&mut client)).await;
        assert!(res.is_err());
    }
}
