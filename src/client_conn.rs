// Client-side sessions. A session sends one RRQ or WRQ from an ephemeral
// socket and reads a single reply to settle the negotiation:
//
//   ERROR    -> the server refused; surface its code and message.
//   OACK     -> only the echoed options are in force. An RRQ answers with
//               ACK(0) before the first DATA; a WRQ starts sending.
//   ACK(0)   -> a WRQ accepted with all defaults.
//   DATA(1)  -> an RRQ accepted with all defaults; the block is ingested
//               before the receiver loop takes over.
//
// Whatever address that first reply comes from is the server's transfer ID
// and the session locks onto it.

use crate::processor::{Receiver, Sender, TransferError};
use crate::request::Request;
use crate::tftp::{
    self, ErrorCode, FileMode, OpCode, ProtocolError, TftpSocket, DEFAULT_TIMEOUT,
};
use std::error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};

#[derive(Debug)]
pub enum ClientError {
    File(io::Error),
    Socket(ProtocolError),
    Negotiation(String),
    Transfer(TransferError),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(e) => write!(f, "File IO error: {:#?}", e),
            Self::Socket(e) => write!(f, "Socket error: {}", e),
            Self::Negotiation(msg) => write!(f, "Option negotiation failed: {}", msg),
            Self::Transfer(e) => write!(f, "Transfer failed: {}", e),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::File(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> ClientError {
        ClientError::Socket(e)
    }
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> ClientError {
        ClientError::Transfer(e)
    }
}

/// Requested option values for a session; `None` leaves the RFC default in
/// place and keeps the option off the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    pub blksize: Option<u16>,
    pub windowsize: Option<u16>,
}

fn build_request(
    operation: OpCode,
    filename: &str,
    options: TransferOptions,
) -> Request {
    let mut request = Request::new(operation, filename, FileMode::Octet);
    if let Some(blksize) = options.blksize {
        request.block_size.request(i64::from(blksize));
    }
    if let Some(windowsize) = options.windowsize {
        request.window_size.request(i64::from(windowsize));
    }
    request
}

/// Sends the forged request and returns the socket plus the first reply.
async fn open_session(
    server: SocketAddr,
    request: &Request,
) -> Result<(TftpSocket, Vec<u8>), ClientError> {
    let unspecified: IpAddr = if server.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let mut sock = TftpSocket::bind((unspecified, 0).into())?;
    sock.set_receive_timeout(DEFAULT_TIMEOUT);
    sock.send_to(&request.forge(), server).await?;

    // The reply arrives from the server's fresh transfer port; recv locks
    // onto it.
    let mut buf = vec![0_u8; 516];
    let received = sock.recv(&mut buf).await?;
    buf.truncate(received);
    Ok((sock, buf))
}

async fn fail_negotiation(sock: &TftpSocket, message: String) -> ClientError {
    let reply = tftp::forge_error(ErrorCode::NegotiationFailure, &message);
    let _ = sock.send(&reply).await;
    ClientError::Negotiation(message)
}

fn peer_error(reply: &[u8]) -> ClientError {
    let (code, message) = tftp::parse_error(reply)
        .unwrap_or((ErrorCode::Undefined, "unparseable error packet".to_string()));
    ClientError::Transfer(TransferError::Peer { code, message })
}

/// Downloads `filename` from the server into `output`. Returns the number
/// of payload bytes written.
pub async fn get(
    server: SocketAddr,
    filename: &str,
    output: &Path,
    options: TransferOptions,
) -> Result<u64, ClientError> {
    let mut request = build_request(OpCode::Rrq, filename, options);
    let (mut sock, reply) = open_session(server, &request).await?;
    let mut file = File::create(output).await?;
    let mut receiver = Receiver::new();

    match tftp::peek_opcode(&reply) {
        OpCode::Error => return Err(peer_error(&reply)),
        OpCode::OptAck => {
            if let Err(e) = request.parse_option_ack(&reply) {
                return Err(fail_negotiation(&sock, e.to_string()).await);
            }
            sock.send(&tftp::forge_ack(0)).await?;
        }
        OpCode::Data => {
            // The server took none of our options; defaults apply and this
            // is already the first block of the window.
            request.reset_options();
            let (block, payload) = tftp::parse_data(&reply).map_err(ClientError::Socket)?;
            if !receiver.ingest(block, payload, request.blksize(), &mut file).await? {
                let message = format!("first data block is {}, expected 1", block);
                let _ = sock
                    .send(&tftp::forge_error(ErrorCode::Illegal, &message))
                    .await;
                return Err(ClientError::Transfer(TransferError::Protocol(message)));
            }
            sock.send(&tftp::forge_ack(block)).await?;
        }
        _ => {
            let message = "expected OACK, DATA or ERROR in reply to RRQ".to_string();
            let _ = sock
                .send(&tftp::forge_error(ErrorCode::Illegal, &message))
                .await;
            return Err(ClientError::Transfer(TransferError::Protocol(message)));
        }
    }

    // A short first DATA already carried the whole file.
    if !receiver.finished() {
        receiver.run(&request, &mut sock, &mut file).await?;
    }
    file.flush().await?;
    Ok(file.metadata().await?.len())
}

/// Uploads the file at `input` to the server as `filename`. Returns the
/// number of payload bytes sent.
pub async fn put(
    server: SocketAddr,
    filename: &str,
    input: &Path,
    options: TransferOptions,
) -> Result<u64, ClientError> {
    let mut request = build_request(OpCode::Wrq, filename, options);
    let (mut sock, reply) = open_session(server, &request).await?;
    let mut file = File::open(input).await?;

    match tftp::peek_opcode(&reply) {
        OpCode::Error => return Err(peer_error(&reply)),
        OpCode::OptAck => {
            if let Err(e) = request.parse_option_ack(&reply) {
                return Err(fail_negotiation(&sock, e.to_string()).await);
            }
            // The OACK stands in for ACK(0); DATA 1 answers it directly.
        }
        OpCode::Ack => match tftp::parse_ack(&reply) {
            Ok(0) => request.reset_options(),
            Ok(block) => {
                let message = format!("expected ACK 0 for the request, got ACK {}", block);
                let _ = sock
                    .send(&tftp::forge_error(ErrorCode::Illegal, &message))
                    .await;
                return Err(ClientError::Transfer(TransferError::Protocol(message)));
            }
            Err(e) => return Err(ClientError::Socket(e)),
        },
        _ => {
            let message = "expected OACK, ACK or ERROR in reply to WRQ".to_string();
            let _ = sock
                .send(&tftp::forge_error(ErrorCode::Illegal, &message))
                .await;
            return Err(ClientError::Transfer(TransferError::Protocol(message)));
        }
    }

    let mut sender = Sender::new();
    sender.run(&request, &mut sock, &mut file).await?;
    Ok(file.metadata().await?.len())
}
