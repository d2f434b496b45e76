use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Consecutive failed rounds a transfer loop tolerates before aborting.
pub const MAX_RETRY: u32 = 5;

/// Receive timeout applied to every transfer socket.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest legal RRQ/WRQ datagram. An OACK can never be bigger either,
/// since the server only echoes what the request carried.
pub const MAX_REQUEST_SIZE: usize = 512;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error surfaced by the wire codec or the socket wrapper.
#[derive(Debug)]
pub enum ProtocolError {
    IO(io::Error),
    PacketParse(String),
    Negotiation(String),
    Timeout(Elapsed),
    Unusable(String),
}

impl error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            ProtocolError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            ProtocolError::Negotiation(e) => write!(f, "Option negotiation failure: {}", e),
            ProtocolError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
            ProtocolError::Unusable(e) => write!(f, "Socket unusable: {}", e),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::IO(e)
    }
}

impl From<Elapsed> for ProtocolError {
    fn from(e: Elapsed) -> Self {
        ProtocolError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, ProtocolError>;

/// Represents the mode a peer requested for the transfer. The payload is
/// moved verbatim in every mode; NetAscii translation is not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
    Invalid,
}

impl FileMode {
    /// Matches a mode name case-insensitively. Anything unrecognised maps
    /// to `Invalid`; callers decide whether that is fatal.
    pub fn from_name(name: &str) -> FileMode {
        if name.eq_ignore_ascii_case("netascii") {
            FileMode::NetAscii
        } else if name.eq_ignore_ascii_case("octet") {
            FileMode::Octet
        } else if name.eq_ignore_ascii_case("mail") {
            FileMode::Mail
        } else {
            FileMode::Invalid
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
            FileMode::Invalid => "unknown",
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The six wire opcodes plus a catch-all for anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    OptAck,
    Illegal,
}

impl OpCode {
    pub fn from_u16(raw: u16) -> OpCode {
        match raw {
            1 => OpCode::Rrq,
            2 => OpCode::Wrq,
            3 => OpCode::Data,
            4 => OpCode::Ack,
            5 => OpCode::Error,
            6 => OpCode::OptAck,
            _ => OpCode::Illegal,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::OptAck => 6,
            OpCode::Illegal => 0,
        }
    }
}

/// Cheap prefix peek. Anything shorter than the smallest legal packet is
/// `Illegal` without further inspection.
pub fn peek_opcode(buf: &[u8]) -> OpCode {
    if buf.len() < 4 {
        return OpCode::Illegal;
    }
    OpCode::from_u16(u16_from_buffer(buf))
}

/// Represents a TFTP error code as carried by an ERROR packet. Codes 1-7
/// are RFC 1350, code 8 is the RFC 2347 negotiation failure, and code 0
/// carries any condition without a canonical number (the message string is
/// authoritative there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    NegotiationFailure,
}

impl ErrorCode {
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::NegotiationFailure,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::NegotiationFailure => 8,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ErrorCode::Undefined => "Not defined, see error message",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::Illegal => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::NegotiationFailure => "Option negotiation failure",
        };
        write!(f, "{}", text)
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

pub(crate) fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

pub(crate) fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.push((value >> 8) as u8);
    buf.push((value & 0xFF) as u8);
}

/// Extracts the null-terminated string starting at the beginning of the
/// buffer. Returns the string and the number of bytes consumed, terminator
/// included, or `None` when the terminator is missing or the bytes are not
/// UTF-8. Never reads past the buffer.
pub(crate) fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    let s = std::str::from_utf8(&buf[..end]).ok()?;
    Some((s.to_string(), end + 1))
}

pub(crate) fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

///////////////////////////////////////////////////////////////
// Transfer-phase packets: DATA, ACK, ERROR.
//
// RRQ/WRQ and OACK involve the option model and live in request.rs.

/// Parses a DATA packet, returning the rolling block id and the payload
/// slice. The payload is everything after the four header bytes.
pub fn parse_data(buf: &[u8]) -> TftpResult<(u16, &[u8])> {
    if buf.len() < 4 {
        return Err(ProtocolError::PacketParse(format!(
            "data packet of {} bytes is below the 4-byte header",
            buf.len()
        )));
    }
    if OpCode::from_u16(u16_from_buffer(buf)) != OpCode::Data {
        return Err(ProtocolError::PacketParse(
            "expected a DATA packet".to_string(),
        ));
    }
    Ok((u16_from_buffer(&buf[2..4]), &buf[4..]))
}

pub fn forge_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 4);
    push_u16(&mut buf, OpCode::Data.as_u16());
    push_u16(&mut buf, block);
    buf.extend_from_slice(payload);
    buf
}

/// Parses an ACK packet. The packet must be exactly four bytes.
pub fn parse_ack(buf: &[u8]) -> TftpResult<u16> {
    if buf.len() != 4 {
        return Err(ProtocolError::PacketParse(format!(
            "ack packet must be 4 bytes, got {}",
            buf.len()
        )));
    }
    if OpCode::from_u16(u16_from_buffer(buf)) != OpCode::Ack {
        return Err(ProtocolError::PacketParse(
            "expected an ACK packet".to_string(),
        ));
    }
    Ok(u16_from_buffer(&buf[2..4]))
}

pub fn forge_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    push_u16(&mut buf, OpCode::Ack.as_u16());
    push_u16(&mut buf, block);
    buf
}

/// Parses an ERROR packet into its code and message. The message must be
/// null-terminated like every other string field.
pub fn parse_error(buf: &[u8]) -> TftpResult<(ErrorCode, String)> {
    if buf.len() < 5 {
        return Err(ProtocolError::PacketParse(format!(
            "error packet of {} bytes is too short",
            buf.len()
        )));
    }
    if OpCode::from_u16(u16_from_buffer(buf)) != OpCode::Error {
        return Err(ProtocolError::PacketParse(
            "expected an ERROR packet".to_string(),
        ));
    }
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]).ok_or_else(|| {
        ProtocolError::PacketParse("error message is not null-terminated".to_string())
    })?;
    Ok((code, message))
}

pub fn forge_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 5);
    push_u16(&mut buf, OpCode::Error.as_u16());
    push_u16(&mut buf, code.as_u16());
    push_string(&mut buf, message);
    buf
}

/// A DATA packet shorter than the full block closes the transfer.
pub fn is_final_block(payload_len: usize, block_size: usize) -> bool {
    payload_len < block_size
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that bounds every receive by the configured
/// timeout and pins the session to a single peer (the transfer ID). The
/// transfer loops only ever see this capability: set the timeout, read a
/// datagram, write a datagram.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    peer: Option<SocketAddr>,
    recv_timeout: Option<Duration>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            peer: None,
            recv_timeout: None,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Pins all subsequent traffic to `peer`. Datagrams from anyone else are
    /// answered with ERROR(Unknown transfer ID) and otherwise ignored.
    pub fn lock_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_receive_timeout(&mut self, ttl: Duration) {
        self.recv_timeout = Some(ttl);
    }

    /// Sends one datagram to the locked peer. A short send is an error: UDP
    /// either takes the whole datagram or none of it.
    pub async fn send(&self, bytes: &[u8]) -> TftpResult<()> {
        let peer = self
            .peer
            .ok_or_else(|| ProtocolError::Unusable("no peer locked for send".to_string()))?;
        self.send_to(bytes, peer).await
    }

    pub async fn send_to(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        let written = self.sock.send_to(bytes, dst).await?;
        if written != bytes.len() {
            return Err(ProtocolError::Unusable(format!(
                "short datagram send: {} of {} bytes",
                written,
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Receives one datagram from anyone, bounded by the configured timeout
    /// when one is set. Used by the server listener and for the client's
    /// first reply.
    pub async fn recv_from(&self, buf: &mut [u8]) -> TftpResult<(usize, SocketAddr)> {
        match self.recv_timeout {
            Some(ttl) => Ok(timeout(ttl, self.sock.recv_from(buf)).await??),
            None => Ok(self.sock.recv_from(buf).await?),
        }
    }

    /// Receives one datagram from the locked peer. The first datagram locks
    /// the peer when none is pinned yet (the standard TID handshake: the
    /// reply arrives from the server's fresh ephemeral port).
    ///
    /// The configured timeout bounds the whole call, stray datagrams
    /// included: a flood from the wrong address burns the budget instead
    /// of re-arming it, so the caller's retry accounting stays live.
    pub async fn recv(&mut self, buf: &mut [u8]) -> TftpResult<usize> {
        match self.recv_timeout {
            Some(ttl) => {
                Ok(timeout(ttl, recv_from_locked_peer(&self.sock, &mut self.peer, buf)).await??)
            }
            None => recv_from_locked_peer(&self.sock, &mut self.peer, buf).await,
        }
    }
}

/// The unbounded half of [`TftpSocket::recv`]: keeps reading until the
/// locked peer speaks, answering anyone else with ERROR(Unknown transfer
/// ID). The first sender locks the peer when none is pinned yet.
async fn recv_from_locked_peer(
    sock: &Async<UdpSocket>,
    peer: &mut Option<SocketAddr>,
    buf: &mut [u8],
) -> TftpResult<usize> {
    loop {
        let (received, src) = sock.recv_from(buf).await?;
        match *peer {
            None => {
                *peer = Some(src);
                return Ok(received);
            }
            Some(locked) if locked == src => return Ok(received),
            Some(_) => {
                log::warn!("dropping datagram from stray sender {:#?}", src);
                let reply = forge_error(
                    ErrorCode::UnknownTid,
                    "this port already serves another transfer",
                );
                // Courtesy reply only; its failure changes nothing.
                let _ = sock.send_to(&reply, src).await;
            }
        }
    }
}
