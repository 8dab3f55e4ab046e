//! tftpd - Main executable
//!
//! A small RFC 1350 TFTP server serving files from and to a directory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tftp::{DirHandler, DirPolicy, Server, ServerConfig, TransferConfig, DEFAULT_PORT};

#[derive(FromArgs, Debug)]
#[argh(
    description = "tftpd - a small RFC 1350 TFTP server",
    example = "Serve the current directory on the well-known port:\n  {command_name}",
    example = "Read-only boot file server:\n  {command_name} --root /tftpboot --no-write",
    example = "Upload drop box that never clobbers existing files:\n  {command_name} --root ./inbox --no-read --no-overwrite"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'a',
        description = "address to listen on",
        default = "IpAddr::V4(Ipv4Addr::UNSPECIFIED)"
    )]
    address: IpAddr,

    #[argh(option, short = 'p', description = "port to listen on", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(
        option,
        short = 'r',
        description = "directory to serve files from and to",
        default = "PathBuf::from(\".\")"
    )]
    root: PathBuf,

    #[argh(
        option,
        short = 't',
        description = "seconds to wait for each DATA/ACK exchange",
        default = "5"
    )]
    timeout: u64,

    #[argh(switch, description = "deny read requests")]
    no_read: bool,

    #[argh(switch, description = "deny write requests")]
    no_write: bool,

    #[argh(switch, description = "reject write requests for existing files")]
    no_overwrite: bool,
}

impl CliConfig {
    fn into_parts(self) -> (ServerConfig, DirHandler) {
        let policy = DirPolicy {
            read: !self.no_read,
            write: !self.no_write,
            overwrite: !self.no_overwrite,
        };
        let config = ServerConfig {
            address: self.address,
            port: self.port,
            transfer: TransferConfig {
                timeout: Duration::from_secs(self.timeout),
            },
        };
        (config, DirHandler::new(self.root, policy))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: CliConfig = argh::from_env();
    tracing::info!("Serving from and to {}", cli.root.display());

    let (config, handler) = cli.into_parts();
    let server = Arc::new(Server::bind(config, handler).await?);

    // Ctrl-C requests a graceful stop; sessions already running finish on
    // their own before run() returns.
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = stopper.stop().await {
                tracing::error!("Failed to stop server loop: {}", e);
            }
        }
    });

    server.run().await
}
