//! TFTP Transfer Engine
//!
//! The two lock-step loops that drive a single transfer over an established
//! per-session socket: `send` streams a byte source to the peer as DATA
//! packets, `receive` collects DATA packets into a byte sink.
//!
//! Every individual wait for the peer is bounded by the configured timeout.
//! A missed reply is not retransmitted; it aborts the session, as does any
//! decode error, unexpected packet type, or block number mismatch. Neither
//! loop closes the socket or the source/sink it was handed; those belong to
//! the caller.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::protocol::{Packet, BLOCK_SIZE};

const TIMEOUT_SECS: u64 = 5;

/// Per-session transfer settings.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Bound on each individual wait for a DATA or ACK packet.
    pub timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
        }
    }
}

/// Send data from `source` over an established connection.
///
/// Serves a read request: reads 512-byte blocks from the source and sends
/// each as a DATA packet, waiting for the matching ACK before the next. A
/// final block shorter than 512 bytes ends the transfer; when the source
/// length is an exact multiple of the block size an empty DATA packet is
/// sent so the peer can tell the transfer is over.
///
/// Returns true if the whole source was sent and acknowledged.
pub async fn send<S>(tag: &str, sock: &UdpSocket, source: &mut S, config: &TransferConfig) -> bool
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut block = [0u8; BLOCK_SIZE];
    let mut reply = [0u8; 1500];
    let mut seq: u16 = 1;

    loop {
        let n = match read_block(source, &mut block).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("{} Read error at block #{}: {}", tag, seq, e);
                return false;
            }
        };

        let pkt = Packet::Data {
            block: seq,
            payload: block[..n].to_vec(),
        };
        if let Err(e) = sock.send(&pkt.encode()).await {
            tracing::warn!("{} Send error at block #{}: {}", tag, seq, e);
            return false;
        }

        let len = match timeout(config.timeout, sock.recv(&mut reply)).await {
            Err(_) => {
                tracing::warn!("{} Timeout at block #{}", tag, seq);
                return false;
            }
            Ok(Err(e)) => {
                tracing::warn!("{} Receive error at block #{}: {}", tag, seq, e);
                return false;
            }
            Ok(Ok(len)) => len,
        };

        match Packet::decode(&reply[..len]) {
            Ok(Packet::Ack { block }) if block == seq => {}
            Ok(Packet::Ack { block }) => {
                tracing::warn!("{} Seq mismatch: {} != {}", tag, seq, block);
                return false;
            }
            Ok(other) => {
                tracing::warn!("{} Expected ACK but got: {}", tag, other.opcode());
                return false;
            }
            Err(e) => {
                tracing::warn!("{} Packet parse error: {}", tag, e);
                return false;
            }
        }

        if n < BLOCK_SIZE {
            break;
        }
        seq = seq.wrapping_add(1);
    }

    tracing::info!("{} Sent file", tag);
    true
}

/// Receive data into `sink` over an established connection.
///
/// Serves a write request: opens the window with ACK 0, then appends each
/// in-order DATA payload to the sink and acknowledges it. A payload shorter
/// than 512 bytes completes the transfer.
///
/// Returns true if the whole file was received, so the caller can dispose
/// of a partially written destination otherwise.
pub async fn receive<S>(tag: &str, sock: &UdpSocket, sink: &mut S, config: &TransferConfig) -> bool
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = sock.send(&Packet::Ack { block: 0 }.encode()).await {
        tracing::warn!("{} Send error at block #0: {}", tag, e);
        return false;
    }

    let mut buf = [0u8; 1500];
    let mut seq: u16 = 1;

    loop {
        let len = match timeout(config.timeout, sock.recv(&mut buf)).await {
            Err(_) => {
                tracing::warn!("{} Timeout at block #{}", tag, seq);
                return false;
            }
            Ok(Err(e)) => {
                tracing::warn!("{} Receive error at block #{}: {}", tag, seq, e);
                return false;
            }
            Ok(Ok(len)) => len,
        };

        let payload = match Packet::decode(&buf[..len]) {
            Ok(Packet::Data { block, payload }) if block == seq => payload,
            Ok(Packet::Data { block, .. }) => {
                tracing::warn!("{} Seq mismatch: {} != {}", tag, seq, block);
                return false;
            }
            Ok(other) => {
                tracing::warn!("{} Expected DATA but got: {}", tag, other.opcode());
                return false;
            }
            Err(e) => {
                tracing::warn!("{} Packet parse error: {}", tag, e);
                return false;
            }
        };

        if let Err(e) = sink.write_all(&payload).await {
            tracing::warn!("{} Write error at block #{}: {}", tag, seq, e);
            return false;
        }
        if let Err(e) = sock.send(&Packet::Ack { block: seq }.encode()).await {
            tracing::warn!("{} Send error at block #{}: {}", tag, seq, e);
            return false;
        }

        if payload.len() < BLOCK_SIZE {
            break;
        }
        seq = seq.wrapping_add(1);
    }

    if let Err(e) = sink.flush().await {
        tracing::warn!("{} Flush error: {}", tag, e);
        return false;
    }

    tracing::info!("{} Received file", tag);
    true
}

/// Read up to one block from the source, tolerating short reads.
async fn read_block<S>(source: &mut S, buf: &mut [u8; BLOCK_SIZE]) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
