//! TFTP (Trivial File Transfer Protocol) Server Engine
//!
//! An RFC 1350 implementation built around three pieces:
//!
//! - [`Packet`] and its codec in `protocol` - wire bytes to and from typed
//!   packets with strict validation
//! - the transfer loops in [`transfer`] - lock-step DATA/ACK exchange with
//!   per-wait timeouts over a connected per-session socket
//! - [`Server`] in `server` - the dispatcher that accepts initial requests
//!   on the well-known port and spawns one independent session per request,
//!   each on its own transfer identifier (ephemeral port)
//!
//! Storage policy is pluggable through the [`Handler`] trait; [`DirHandler`]
//! serves a directory tree with configurable read/write/overwrite access.
//!
//! TFTP options (RFC 2347 and friends), multicast and retransmission are
//! out of scope: a missed reply aborts the session after one timeout.
//!
//! # Basic usage
//!
//! ```rust,no_run
//! use tftp::{DirHandler, DirPolicy, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handler = DirHandler::new("./tftp_root", DirPolicy::default());
//!     let server = Server::bind(ServerConfig::default(), handler).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Working with packets
//!
//! ```rust
//! use tftp::{Mode, Packet};
//!
//! let pkt = Packet::decode(b"\x00\x01test.txt\x00octet\x00").unwrap();
//! assert_eq!(
//!     pkt,
//!     Packet::ReadRequest { filename: "test.txt".into(), mode: Mode::Octet }
//! );
//!
//! assert_eq!(Packet::Ack { block: 1 }.encode(), b"\x00\x04\x00\x01");
//! ```

mod handler;
mod protocol;
mod server;
mod transfer;

pub use handler::*;
pub use protocol::*;
pub use server::*;
pub use transfer::*;
