// A TFTP client and server implementing RFC 1350 with the option
// extensions of RFC 2347/2348/2349 and RFC 7440 windowed transfers.
//
// Protocol recap:
//
// A transfer starts with a read (RRQ) or write (WRQ) request sent to the
// well-known port 69. The server answers from a fresh ephemeral port; the
// two ephemeral ports are the transfer IDs and all further traffic for the
// session flows between them. The file moves in DATA packets of up to
// blksize bytes (512 by default), each carrying a 16-bit block number; a
// DATA packet shorter than blksize ends the transfer. The receiver
// acknowledges with ACK packets; with a negotiated windowsize > 1 the
// sender keeps up to that many DATA packets in flight per cumulative ACK
// (RFC 7440).
//
// Options ride on the request as name/value string pairs and come into
// force only when the server echoes them in an OACK (opcode 6). We
// negotiate blksize and windowsize; timeout and tsize are understood but
// never advertised.
//
// Most errors terminate the session with a single ERROR packet, sent as a
// courtesy and never retransmitted. Lost packets are covered by receive
// timeouts: a transfer aborts after six consecutive dead rounds.

use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

pub mod client_conn;
pub mod processor;
pub mod request;
pub mod srv_conn;
pub mod tftp;

use anyhow::Context;
use client_conn::TransferOptions;
use pretty_bytes::converter::convert;
use tftp::TftpSocket;

#[derive(Parser, Debug)]
#[command(name = "tftpw", version, about = "Windowed TFTP client and server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a directory over TFTP.
    Server {
        /// Address to listen on.
        #[arg(short, long, default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED))]
        address: IpAddr,
        /// UDP port to listen on.
        #[arg(short, long, default_value_t = 69)]
        port: u16,
        /// Directory served to clients.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
    /// Download a file from a TFTP server.
    Get {
        /// Name of the remote file.
        filename: String,
        /// Server address.
        #[arg(short, long, default_value_t = IpAddr::V6(Ipv6Addr::LOCALHOST))]
        address: IpAddr,
        /// Server port.
        #[arg(short, long, default_value_t = 69)]
        port: u16,
        /// Local path to write to; defaults to the remote name.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Block size to request.
        #[arg(long)]
        blksize: Option<u16>,
        /// Window size to request.
        #[arg(long)]
        windowsize: Option<u16>,
    },
    /// Upload a file to a TFTP server.
    Put {
        /// Local file to upload.
        filename: PathBuf,
        /// Server address.
        #[arg(short, long, default_value_t = IpAddr::V6(Ipv6Addr::LOCALHOST))]
        address: IpAddr,
        /// Server port.
        #[arg(short, long, default_value_t = 69)]
        port: u16,
        /// Remote name to store under; defaults to the local file name.
        #[arg(short, long)]
        remote_name: Option<String>,
        /// Block size to request.
        #[arg(long)]
        blksize: Option<u16>,
        /// Window size to request.
        #[arg(long)]
        windowsize: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            address,
            port,
            root,
        } => {
            let listener = TftpSocket::bind(SocketAddr::new(address, port))
                .with_context(|| format!("binding listener on {}:{}", address, port))?;
            srv_conn::serve(listener, root).await
        }
        Command::Get {
            filename,
            address,
            port,
            output,
            blksize,
            windowsize,
        } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&filename));
            let options = TransferOptions {
                blksize,
                windowsize,
            };
            let bytes = client_conn::get(SocketAddr::new(address, port), &filename, &output, options)
                .await
                .with_context(|| format!("downloading '{}'", filename))?;
            println!("downloaded {} to {}", convert(bytes as f64), output.display());
            Ok(())
        }
        Command::Put {
            filename,
            address,
            port,
            remote_name,
            blksize,
            windowsize,
        } => {
            let remote_name = match remote_name {
                Some(name) => name,
                None => filename
                    .file_name()
                    .context("upload path has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let options = TransferOptions {
                blksize,
                windowsize,
            };
            let bytes = client_conn::put(
                SocketAddr::new(address, port),
                &remote_name,
                &filename,
                options,
            )
            .await
            .with_context(|| format!("uploading '{}'", filename.display()))?;
            println!("uploaded {} as {}", convert(bytes as f64), remote_name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TransferError;
    use crate::tftp::ErrorCode;
    use std::net::Ipv4Addr;
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Spawns the full server accept loop on an ephemeral loopback port
    /// and returns the address clients should talk to.
    fn spawn_server(root: PathBuf) -> SocketAddr {
        let listener = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = srv_conn::serve(listener, root).await;
        });
        addr
    }

    async fn write_file(path: &std::path::Path, contents: &[u8]) {
        let mut f = File::create(path).await.unwrap();
        f.write_all(contents).await.unwrap();
        f.flush().await.unwrap();
    }

    async fn read_file(path: &std::path::Path) -> Vec<u8> {
        let mut contents = Vec::new();
        File::open(path)
            .await
            .unwrap()
            .read_to_end(&mut contents)
            .await
            .unwrap();
        contents
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[tokio::test]
    async fn test_get_without_options() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let contents = patterned(1500);
        write_file(&served.path().join("firmware.bin"), &contents).await;

        let server = spawn_server(served.path().to_path_buf());
        let output = local.path().join("firmware.bin");
        let bytes = client_conn::get(server, "firmware.bin", &output, TransferOptions::default())
            .await
            .unwrap();

        assert_eq!(bytes, 1500);
        assert_eq!(read_file(&output).await, contents);
    }

    #[tokio::test]
    async fn test_get_with_negotiated_window() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let contents = patterned(40_000);
        write_file(&served.path().join("image.bin"), &contents).await;

        let server = spawn_server(served.path().to_path_buf());
        let output = local.path().join("image.bin");
        let options = TransferOptions {
            blksize: Some(1024),
            windowsize: Some(32),
        };
        let bytes = client_conn::get(server, "image.bin", &output, options)
            .await
            .unwrap();

        assert_eq!(bytes, 40_000);
        assert_eq!(read_file(&output).await, contents);
    }

    #[tokio::test]
    async fn test_put_without_options() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let contents = patterned(2048);
        let input = local.path().join("upload.bin");
        write_file(&input, &contents).await;

        let server = spawn_server(served.path().to_path_buf());
        let bytes = client_conn::put(server, "upload.bin", &input, TransferOptions::default())
            .await
            .unwrap();

        assert_eq!(bytes, 2048);
        // The server flushes on its own schedule; poll briefly.
        let stored = served.path().join("upload.bin");
        for _ in 0..50 {
            if stored.exists() && read_file(&stored).await == contents {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(read_file(&stored).await, contents);
    }

    #[tokio::test]
    async fn test_put_with_negotiated_window() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        let contents = patterned(4097);
        let input = local.path().join("burst.bin");
        write_file(&input, &contents).await;

        let server = spawn_server(served.path().to_path_buf());
        let options = TransferOptions {
            blksize: Some(1024),
            windowsize: Some(4),
        };
        let bytes = client_conn::put(server, "burst.bin", &input, options)
            .await
            .unwrap();

        assert_eq!(bytes, 4097);
        let stored = served.path().join("burst.bin");
        for _ in 0..50 {
            if stored.exists() && read_file(&stored).await == contents {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(read_file(&stored).await, contents);
    }

    #[tokio::test]
    async fn test_get_missing_file_reports_peer_error() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();

        let server = spawn_server(served.path().to_path_buf());
        let output = local.path().join("ghost.bin");
        match client_conn::get(server, "ghost.bin", &output, TransferOptions::default()).await {
            Err(client_conn::ClientError::Transfer(TransferError::Peer { code, .. })) => {
                assert_eq!(code, ErrorCode::FileNotFound);
            }
            other => panic!("expected File not found from the server, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_existing_file_is_refused() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();
        write_file(&served.path().join("taken.bin"), b"already here").await;
        let input = local.path().join("taken.bin");
        write_file(&input, b"new contents").await;

        let server = spawn_server(served.path().to_path_buf());
        match client_conn::put(server, "taken.bin", &input, TransferOptions::default()).await {
            Err(client_conn::ClientError::Transfer(TransferError::Peer { code, .. })) => {
                assert_eq!(code, ErrorCode::FileAlreadyExists);
            }
            other => panic!("expected File already exists, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_refuses_path_traversal() {
        let served = TempDir::new("served").unwrap();
        let local = TempDir::new("local").unwrap();

        let server = spawn_server(served.path().to_path_buf());
        let output = local.path().join("stolen.bin");
        match client_conn::get(server, "../secret.bin", &output, TransferOptions::default()).await {
            Err(client_conn::ClientError::Transfer(TransferError::Peer { code, .. })) => {
                assert_eq!(code, ErrorCode::AccessViolation);
            }
            other => panic!("expected Access violation, got {:#?}", other),
        }
    }
}
