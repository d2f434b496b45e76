// This module contains the server-side connection handler.
//
// A connection starts when the listener on the well-known port receives an
// RRQ or WRQ. The handler binds a fresh ephemeral socket locked to the
// client endpoint (the standard transfer-ID mechanism), answers the
// negotiation, and runs the matching transfer loop to completion. Each
// request runs on its own task; nothing is shared between sessions.

use crate::processor::{Receiver, Sender, TransferError};
use crate::request::Request;
use crate::tftp::{
    self, ErrorCode, FileMode, OpCode, ProtocolError, TftpSocket, DEFAULT_TIMEOUT, MAX_REQUEST_SIZE,
    MAX_RETRY,
};
use pretty_bytes::converter::convert;
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io;
use tokio::time::Instant;

/// An object responsible for handling a single accepted request.
pub struct ServerRequestHandler {
    /// Ephemeral socket locked to the requesting client.
    sock: TftpSocket,

    /// The parsed request, options negotiated and clamped.
    request: Request,

    /// The file backing the transfer.
    file: File,
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Socket(ProtocolError),
    Transfer(TransferError),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::File(e) => write!(f, "File IO error: {:#?}", e),
            Self::Socket(e) => write!(f, "Socket error: {}", e),
            Self::Transfer(e) => write!(f, "Transfer failed: {}", e),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<ProtocolError> for ServerConnectionError {
    fn from(e: ProtocolError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}

impl From<TransferError> for ServerConnectionError {
    fn from(e: TransferError) -> ServerConnectionError {
        ServerConnectionError::Transfer(e)
    }
}

/// Attempts to bind an ephemeral UDP socket until one succeeds. The socket
/// family follows the client's so replies can actually reach it.
fn bind_transfer_socket(client: SocketAddr) -> TftpSocket {
    let unspecified: IpAddr = if client.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };

    let mut rng = rand::thread_rng();
    let mut sock = TftpSocket::bind((unspecified, rng.gen_range(1024..65535)).into());
    while sock.is_err() {
        log::warn!("Couldn't bind transfer socket: {:#?}", sock.err());
        sock = TftpSocket::bind((unspecified, rng.gen_range(1024..65535)).into());
    }
    sock.unwrap()
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send_to(&tftp::forge_error(code, message), dst).await;
}

/// Maps the requested filename into the served directory. A leading slash
/// is dropped; anything trying to climb out of the root is refused.
fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = filename.strip_prefix('/').unwrap_or(filename);
    if relative.is_empty() || relative.split('/').any(|part| part == "..") {
        return Err(ServerConnectionError::BadRequest(format!(
            "refusing path '{}'",
            filename
        )));
    }
    Ok(root.join(relative))
}

impl ServerRequestHandler {
    pub async fn new(
        root: &Path,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let mut sock = bind_transfer_socket(src);
        sock.lock_peer(src);
        sock.set_receive_timeout(DEFAULT_TIMEOUT);

        let request = match Request::parse(datagram) {
            Ok(request) => request,
            Err(e) => {
                send_error_packet(&sock, src, ErrorCode::Illegal, &e.to_string()).await;
                return Err(ServerConnectionError::BadRequest(e.to_string()));
            }
        };

        log::info!(
            "{:?} for '{}' ({}) from {:#?}, blksize {} windowsize {}",
            request.operation,
            request.filename,
            request.mode,
            src,
            request.blksize(),
            request.window(),
        );

        match request.mode {
            FileMode::Mail => {
                send_error_packet(
                    &sock,
                    src,
                    ErrorCode::Undefined,
                    "Support for mail mode is unimplemented",
                )
                .await;
                return Err(ServerConnectionError::BadRequest(
                    "Peer requested mail mode, which is unsupported".to_string(),
                ));
            }
            FileMode::Invalid => {
                send_error_packet(&sock, src, ErrorCode::Illegal, "Unknown transfer mode").await;
                return Err(ServerConnectionError::BadRequest(
                    "Peer requested an unknown transfer mode".to_string(),
                ));
            }
            // Netascii payload is transferred verbatim.
            FileMode::NetAscii | FileMode::Octet => {}
        }

        let path = match resolve_path(root, &request.filename) {
            Ok(path) => path,
            Err(e) => {
                send_error_packet(&sock, src, ErrorCode::AccessViolation, &e.to_string()).await;
                return Err(e);
            }
        };

        let file = match request.operation {
            OpCode::Rrq => File::open(&path).await,
            OpCode::Wrq => File::create_new(&path).await,
            _ => unreachable!("Request::parse only yields RRQ or WRQ"),
        };
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                send_error_packet(&sock, src, e.kind().into(), &format!("{:#?}", e)).await;
                return Err(e.into());
            }
        };

        Ok(ServerRequestHandler {
            sock,
            request,
            file,
        })
    }

    /// Answers the negotiation and runs the transfer until it completes or
    /// dies. Transfer statistics land in the log on success.
    pub async fn handle(mut self) -> Result<(), ServerConnectionError> {
        let started = Instant::now();
        let option_ack = self.request.forge_option_ack();

        let bytes = match self.request.operation {
            OpCode::Wrq => {
                // With no options in force a plain ACK(0) accepts the
                // write; otherwise the OACK itself does.
                if option_ack.is_empty() {
                    self.sock.send(&tftp::forge_ack(0)).await?;
                } else {
                    self.sock.send(&option_ack).await?;
                }

                let mut receiver = Receiver::new();
                receiver
                    .run(&self.request, &mut self.sock, &mut self.file)
                    .await?
            }
            OpCode::Rrq => {
                if !option_ack.is_empty() {
                    self.await_option_ack_reply(&option_ack).await?;
                }

                let mut sender = Sender::new();
                sender
                    .run(&self.request, &mut self.sock, &mut self.file)
                    .await?;
                self.file.metadata().await?.len()
            }
            _ => unreachable!("constructor rejects anything but RRQ and WRQ"),
        };

        let elapsed = started.elapsed().as_secs_f64();
        log::info!(
            "transferred {} in {:.2}s ({}/s) for {:#?}",
            convert(bytes as f64),
            elapsed,
            convert(bytes as f64 / elapsed.max(f64::EPSILON)),
            self.sock.peer(),
        );
        Ok(())
    }

    /// An RRQ answered with an OACK starts sending only once the client
    /// acknowledges it with ACK(0). The OACK is retransmitted on timeout
    /// under the usual retry budget.
    async fn await_option_ack_reply(
        &mut self,
        option_ack: &[u8],
    ) -> Result<(), ServerConnectionError> {
        let mut reply = [0_u8; 516];
        let mut retry = 0;

        loop {
            if retry > MAX_RETRY {
                let reply = tftp::forge_error(ErrorCode::Undefined, "Retry exceeded");
                let _ = self.sock.send(&reply).await;
                return Err(ServerConnectionError::Transfer(TransferError::RetryExceeded));
            }

            self.sock.send(option_ack).await?;

            let received = match self.sock.recv(&mut reply).await {
                Ok(received) => received,
                Err(ProtocolError::Timeout(_)) => {
                    retry += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match tftp::peek_opcode(&reply[..received]) {
                OpCode::Ack => match tftp::parse_ack(&reply[..received]) {
                    Ok(0) => return Ok(()),
                    Ok(block) => {
                        return Err(ServerConnectionError::BadRequest(format!(
                            "expected ACK 0 for the option ack, got ACK {}",
                            block
                        )));
                    }
                    Err(_) => {
                        retry += 1;
                    }
                },
                OpCode::Error => {
                    let (code, message) = tftp::parse_error(&reply[..received])
                        .unwrap_or((ErrorCode::Undefined, "unparseable error packet".to_string()));
                    return Err(ServerConnectionError::Transfer(TransferError::Peer {
                        code,
                        message,
                    }));
                }
                _ => {
                    retry += 1;
                }
            }
        }
    }
}

/// Accepts requests on `listener` forever, forking a handler task per
/// request. The listener never answers data traffic itself: every transfer
/// happens on its own ephemeral socket.
pub async fn serve(listener: TftpSocket, root: PathBuf) -> anyhow::Result<()> {
    log::info!("serving {:#?} on {:#?}", root, listener.local_addr()?);

    loop {
        let mut buf = [0_u8; MAX_REQUEST_SIZE];
        let (received, src) = match listener.recv_from(&mut buf).await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("listener receive failed: {}", e);
                continue;
            }
        };

        let datagram = buf[..received].to_vec();
        let root = root.clone();
        tokio::spawn(async move {
            match ServerRequestHandler::new(&root, &datagram, src).await {
                Ok(handler) => {
                    if let Err(e) = handler.handle().await {
                        log::warn!("transfer for {:#?} failed: {}", src, e);
                    }
                }
                Err(e) => log::warn!("rejected request from {:#?}: {}", src, e),
            }
        });
    }
}
