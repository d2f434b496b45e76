// The two transfer loops. Both run to completion on the calling task and
// drive the socket until the transfer finishes, the retry budget runs out,
// or the peer reports an error.
//
// The sender pushes windows of DATA packets and waits for one cumulative
// ACK per round; the receiver collects a window of DATA packets and ACKs
// the last one it accepted. Each loop is an inner `transfer` step that
// early-returns a TransferError, wrapped by `run` which puts a best-effort
// ERROR packet on the wire before surfacing the failure.

use crate::request::Request;
use crate::tftp::{self, ErrorCode, OpCode, ProtocolError, TftpSocket, MAX_RETRY};
use std::error;
use std::fmt;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Why a transfer ended early.
#[derive(Debug)]
pub enum TransferError {
    /// More than MAX_RETRY consecutive rounds failed.
    RetryExceeded,
    /// The peer sent an ERROR packet; the session is over.
    Peer { code: ErrorCode, message: String },
    /// The peer broke the protocol in a way retries cannot fix.
    Protocol(String),
    Socket(ProtocolError),
    File(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::RetryExceeded => write!(f, "Retry exceeded"),
            TransferError::Peer { code, message } => {
                write!(f, "Peer reported error [{}]: {}", code, message)
            }
            TransferError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            TransferError::Socket(e) => write!(f, "Socket error: {}", e),
            TransferError::File(e) => write!(f, "File IO error: {:#?}", e),
        }
    }
}

impl From<ProtocolError> for TransferError {
    fn from(e: ProtocolError) -> Self {
        TransferError::Socket(e)
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::File(e)
    }
}

impl TransferError {
    /// The ERROR packet to put on the wire for this failure, if any.
    /// Conditions without a canonical TFTP code travel as code 0 with the
    /// description in the message. A peer-reported error is never echoed
    /// back.
    fn wire(&self) -> Option<(ErrorCode, String)> {
        match self {
            TransferError::RetryExceeded => {
                Some((ErrorCode::Undefined, "Retry exceeded".to_string()))
            }
            TransferError::Peer { .. } => None,
            TransferError::Protocol(msg) => Some((ErrorCode::Illegal, msg.clone())),
            TransferError::Socket(e) => Some((ErrorCode::Undefined, e.to_string())),
            TransferError::File(e) => Some((e.kind().into(), format!("File IO error: {}", e))),
        }
    }
}

async fn send_wire_error(socket: &TftpSocket, error: &TransferError) {
    if let Some((code, message)) = error.wire() {
        // Courtesy packet; if it fails the session is over anyway.
        let _ = socket.send(&tftp::forge_error(code, &message)).await;
    }
}

/// Reads up to `block_size` bytes from the file. A single read call may
/// come back short without being at end-of-file, so keep filling until the
/// buffer is full or the file has nothing left.
async fn read_block_from_file(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;
    loop {
        match f.read(&mut buf[cursor..]).await {
            Ok(0) => {
                buf.truncate(cursor);
                return Ok(buf);
            }
            Ok(s) => {
                cursor += s;
                if cursor == buf.len() {
                    return Ok(buf);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

///////////////////////////////////////////////////////////////
// Sender: the stream-out half (RRQ served, WRQ uploaded).

/// Windowed DATA emission driven by cumulative ACK feedback.
///
/// The wire carries a 16-bit rolling block number, but the file cursor is
/// positioned from `absolute_block`, an unbounded counter kept in sync
/// with the rolling one modulo 2^16. Re-seeking from `absolute_block` at
/// the top of every round makes retries safe: whatever part of the window
/// was lost is re-read from the right origin.
pub struct Sender {
    /// Next rolling block number to emit (1-based).
    window_block: u16,
    /// Next file position in blocks, 1-based, never wrapping.
    absolute_block: u64,
    retry: u32,
}

impl Sender {
    pub fn new() -> Sender {
        Sender {
            window_block: 1,
            absolute_block: 1,
            retry: 0,
        }
    }

    /// Drives the transfer to completion, emitting a best-effort ERROR
    /// packet if it dies.
    pub async fn run(
        &mut self,
        request: &Request,
        socket: &mut TftpSocket,
        file: &mut File,
    ) -> Result<(), TransferError> {
        match self.transfer(request, socket, file).await {
            Ok(()) => Ok(()),
            Err(error) => {
                send_wire_error(socket, &error).await;
                Err(error)
            }
        }
    }

    async fn transfer(
        &mut self,
        request: &Request,
        socket: &mut TftpSocket,
        file: &mut File,
    ) -> Result<(), TransferError> {
        let block_size = request.blksize();
        // Big enough for any ACK and for an ERROR with its message.
        let mut reply = [0_u8; 516];

        loop {
            if self.retry > MAX_RETRY {
                return Err(TransferError::RetryExceeded);
            }

            file.seek(SeekFrom::Start(
                (self.absolute_block - 1) * block_size as u64,
            ))
            .await?;
            let (emitted, final_block) = self.emit_window(request, socket, file).await?;

            let received = match socket.recv(&mut reply).await {
                Ok(received) => received,
                Err(ProtocolError::Timeout(_)) | Err(ProtocolError::IO(_)) => {
                    log::info!("no ack for window at block {}, resending", self.window_block);
                    self.retry += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match tftp::peek_opcode(&reply[..received]) {
                OpCode::Error => {
                    let (code, message) = match tftp::parse_error(&reply[..received]) {
                        Ok(parsed) => parsed,
                        Err(_) => (ErrorCode::Undefined, "unparseable error packet".to_string()),
                    };
                    return Err(TransferError::Peer { code, message });
                }
                OpCode::Ack => {
                    let ack = match tftp::parse_ack(&reply[..received]) {
                        Ok(ack) => ack,
                        Err(e) => {
                            log::warn!("bad ack from peer: {}", e);
                            self.retry += 1;
                            continue;
                        }
                    };

                    // Cumulative ACK: everything up to `ack` leaves the
                    // window. The advance is computed modulo 2^16 so the
                    // rolling counter can wrap while the absolute one
                    // keeps growing.
                    let advance = ack.wrapping_add(1).wrapping_sub(self.window_block);
                    if advance == 0 || advance > emitted {
                        // A re-ACK of the previous window or a stale
                        // duplicate: nothing new was delivered.
                        log::info!("stale ack {} at window block {}", ack, self.window_block);
                        self.retry += 1;
                        continue;
                    }

                    self.absolute_block += u64::from(advance);
                    self.window_block = ack.wrapping_add(1);
                    self.retry = 0;

                    if final_block == Some(ack) {
                        return Ok(());
                    }
                }
                _ => {
                    log::warn!("unexpected packet while waiting for ack");
                    self.retry += 1;
                }
            }
        }
    }

    /// Emits up to a window of DATA packets starting at `window_block`.
    /// Returns how many went out and, when end-of-file was reached, the
    /// rolling id of the short packet that closes the transfer. A file
    /// whose size is an exact multiple of the block size gets its
    /// terminating zero-byte DATA from the empty read here.
    async fn emit_window(
        &self,
        request: &Request,
        socket: &TftpSocket,
        file: &mut File,
    ) -> Result<(u16, Option<u16>), TransferError> {
        let block_size = request.blksize();
        let mut block = self.window_block;
        let mut emitted = 0_u16;

        for _ in 0..request.window() {
            let payload = read_block_from_file(file, block_size).await?;
            socket.send(&tftp::forge_data(block, &payload)).await?;
            emitted += 1;
            log::debug!("sent DATA {} ({} bytes)", block, payload.len());

            if tftp::is_final_block(payload.len(), block_size) {
                return Ok((emitted, Some(block)));
            }
            block = block.wrapping_add(1);
        }

        Ok((emitted, None))
    }
}

///////////////////////////////////////////////////////////////
// Receiver: the stream-in half (WRQ served, RRQ downloaded).

/// Ordered DATA ingestion with one cumulative ACK per window.
pub struct Receiver {
    /// Rolling id the next in-order DATA must carry.
    expected_block: u16,
    /// Rolling id of the newest block written to the file.
    last_written_block: u16,
    retry: u32,
    finished: bool,
    bytes: u64,
}

impl Receiver {
    pub fn new() -> Receiver {
        Receiver {
            expected_block: 1,
            last_written_block: 0,
            retry: 0,
            finished: false,
            bytes: 0,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn last_written_block(&self) -> u16 {
        self.last_written_block
    }

    /// Ingests one DATA packet. In-order payload goes to the file and
    /// advances the expectation; a duplicate or out-of-order block is
    /// dropped and reported as not accepted. A short payload marks the
    /// transfer finished.
    pub async fn ingest(
        &mut self,
        block: u16,
        payload: &[u8],
        block_size: usize,
        file: &mut File,
    ) -> Result<bool, TransferError> {
        if block != self.expected_block {
            log::info!(
                "dropping DATA {} while expecting {}",
                block,
                self.expected_block
            );
            return Ok(false);
        }

        file.write_all(payload).await?;
        self.bytes += payload.len() as u64;
        self.last_written_block = block;
        self.expected_block = block.wrapping_add(1);
        if tftp::is_final_block(payload.len(), block_size) {
            self.finished = true;
        }
        Ok(true)
    }

    /// Drives the transfer to completion and returns the number of payload
    /// bytes written. Emits a best-effort ERROR packet if it dies.
    pub async fn run(
        &mut self,
        request: &Request,
        socket: &mut TftpSocket,
        file: &mut File,
    ) -> Result<u64, TransferError> {
        match self.transfer(request, socket, file).await {
            Ok(()) => Ok(self.bytes),
            Err(error) => {
                send_wire_error(socket, &error).await;
                Err(error)
            }
        }
    }

    async fn transfer(
        &mut self,
        request: &Request,
        socket: &mut TftpSocket,
        file: &mut File,
    ) -> Result<(), TransferError> {
        // A window that fails part-way is not acknowledged at all: the
        // sender times out and resends it, and whatever we already wrote
        // is filtered as duplicate on the way back in.
        let mut buf = vec![0_u8; request.blksize().max(512) + 4];

        while !self.finished {
            if self.retry > MAX_RETRY {
                return Err(TransferError::RetryExceeded);
            }

            if !self.collect_window(request, socket, file, &mut buf).await? {
                self.retry += 1;
                continue;
            }

            // Nothing is acknowledged before it is durably with the file.
            file.flush().await?;
            socket
                .send(&tftp::forge_ack(self.last_written_block))
                .await?;
            self.retry = 0;
        }

        Ok(())
    }

    /// Collects up to a window of DATA packets. Returns false when the
    /// round failed and must be retried without an ACK. A dropped
    /// duplicate or out-of-order block still consumes its window slot, so
    /// a bursty sender with one stray block gets an early ACK and
    /// retransmits the missing tail.
    async fn collect_window(
        &mut self,
        request: &Request,
        socket: &mut TftpSocket,
        file: &mut File,
        buf: &mut [u8],
    ) -> Result<bool, TransferError> {
        let block_size = request.blksize();

        for _ in 0..request.window() {
            let received = match socket.recv(buf).await {
                Ok(received) => received,
                Err(ProtocolError::Timeout(_)) | Err(ProtocolError::IO(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            };

            match tftp::peek_opcode(&buf[..received]) {
                OpCode::Data => {
                    let (block, payload) = match tftp::parse_data(&buf[..received]) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            log::warn!("bad data packet from peer: {}", e);
                            return Ok(false);
                        }
                    };
                    self.ingest(block, payload, block_size, file).await?;
                    if self.finished {
                        break;
                    }
                }
                OpCode::Error => {
                    let (code, message) = match tftp::parse_error(&buf[..received]) {
                        Ok(parsed) => parsed,
                        Err(_) => (ErrorCode::Undefined, "unparseable error packet".to_string()),
                    };
                    return Err(TransferError::Peer { code, message });
                }
                _ => {
                    log::warn!("unexpected packet while waiting for data");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::FileMode;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tempdir::TempDir;

    const TEST_TIMEOUT: Duration = Duration::from_millis(250);

    fn loopback() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    /// Two sockets locked onto each other with short timeouts.
    fn socket_pair() -> (TftpSocket, TftpSocket) {
        let mut near = TftpSocket::bind(loopback()).unwrap();
        let mut far = TftpSocket::bind(loopback()).unwrap();
        near.lock_peer(far.local_addr().unwrap());
        far.lock_peer(near.local_addr().unwrap());
        near.set_receive_timeout(TEST_TIMEOUT);
        far.set_receive_timeout(TEST_TIMEOUT);
        (near, far)
    }

    fn request_with(operation: OpCode, blksize: i64, window: i64) -> Request {
        let mut request = Request::new(operation, "test.bin", FileMode::Octet);
        request.block_size.request(blksize);
        request.window_size.request(window);
        request
    }

    async fn write_temp_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).await.unwrap();
        f.write_all(contents).await.unwrap();
        f.flush().await.unwrap();
        path
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_sender_emits_trailing_empty_packet() {
        // A 1024-byte file at blksize 512 is an exact multiple: the
        // transfer ends with DATA 3 carrying zero bytes.
        let dir = TempDir::new("scratch").unwrap();
        let path = write_temp_file(&dir, "exact.bin", &patterned(1024)).await;

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Rrq, 512, 1);

        let sender_task = tokio::spawn(async move {
            let mut file = File::open(path).await.unwrap();
            let mut sender = Sender::new();
            sender.run(&request, &mut near, &mut file).await
        });

        let mut sizes = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let received = far.recv(&mut buf).await.unwrap();
            let (block, payload) = tftp::parse_data(&buf[..received]).unwrap();
            let payload_len = payload.len();
            // A timeout retransmission repeats a block; count it once.
            if block as usize == sizes.len() + 1 {
                sizes.push(payload_len);
            }
            far.send(&tftp::forge_ack(block)).await.unwrap();
            if payload_len < 512 {
                break;
            }
        }

        assert_eq!(sizes, vec![512, 512, 0]);
        assert!(sender_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sender_reseeks_after_lost_window() {
        // Ignore the second window once; the retransmission must carry the
        // same bytes, which only works if the file cursor was put back.
        let dir = TempDir::new("scratch").unwrap();
        let path = write_temp_file(&dir, "reseek.bin", b"abcdefgh").await;

        let (mut near, mut far) = socket_pair();
        // The retransmission only lands after the sender's own timeout, so
        // this side must wait noticeably longer.
        far.set_receive_timeout(Duration::from_secs(2));
        let request = request_with(OpCode::Rrq, 4, 1);

        let sender_task = tokio::spawn(async move {
            let mut file = File::open(path).await.unwrap();
            let mut sender = Sender::new();
            sender.run(&request, &mut near, &mut file).await
        });

        let mut buf = [0_u8; 64];

        let received = far.recv(&mut buf).await.unwrap();
        let (block, payload) = tftp::parse_data(&buf[..received]).unwrap();
        assert_eq!((block, payload), (1, &b"abcd"[..]));
        far.send(&tftp::forge_ack(1)).await.unwrap();

        // First copy of DATA 2 arrives; stay silent and force a resend.
        let received = far.recv(&mut buf).await.unwrap();
        let (block, payload) = tftp::parse_data(&buf[..received]).unwrap();
        assert_eq!((block, payload), (2, &b"efgh"[..]));

        let received = far.recv(&mut buf).await.unwrap();
        let (block, payload) = tftp::parse_data(&buf[..received]).unwrap();
        assert_eq!((block, payload), (2, &b"efgh"[..]));
        far.send(&tftp::forge_ack(2)).await.unwrap();

        // Further timeout copies of DATA 2 may already be queued; skip
        // past them to the final empty block.
        loop {
            let received = far.recv(&mut buf).await.unwrap();
            let (block, payload) = tftp::parse_data(&buf[..received]).unwrap();
            if block == 2 {
                assert_eq!(payload, b"efgh");
                continue;
            }
            assert_eq!((block, payload.len()), (3, 0));
            break;
        }
        far.send(&tftp::forge_ack(3)).await.unwrap();

        assert!(sender_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sender_gives_up_after_six_silent_rounds() {
        let dir = TempDir::new("scratch").unwrap();
        let path = write_temp_file(&dir, "silent.bin", &patterned(32)).await;

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Rrq, 16, 1);

        let mut file = File::open(path).await.unwrap();
        let mut sender = Sender::new();
        match sender.run(&request, &mut near, &mut file).await {
            Err(TransferError::RetryExceeded) => {}
            other => panic!("expected retry exhaustion, got {:#?}", other),
        }

        // Six copies of DATA 1, then the ERROR courtesy packet.
        let mut buf = [0_u8; 64];
        let mut data_copies = 0;
        loop {
            let received = far.recv(&mut buf).await.unwrap();
            match tftp::peek_opcode(&buf[..received]) {
                OpCode::Data => data_copies += 1,
                OpCode::Error => {
                    let (code, message) = tftp::parse_error(&buf[..received]).unwrap();
                    assert_eq!(code, ErrorCode::Undefined);
                    assert_eq!(message, "Retry exceeded");
                    break;
                }
                other => panic!("unexpected packet {:#?}", other),
            }
        }
        assert_eq!(data_copies, 6);
    }

    #[tokio::test]
    async fn test_sender_aborts_on_peer_error() {
        let dir = TempDir::new("scratch").unwrap();
        let path = write_temp_file(&dir, "refused.bin", &patterned(2048)).await;

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Rrq, 512, 1);

        let sender_task = tokio::spawn(async move {
            let mut file = File::open(path).await.unwrap();
            let mut sender = Sender::new();
            sender.run(&request, &mut near, &mut file).await
        });

        let mut buf = [0_u8; 1024];
        let received = far.recv(&mut buf).await.unwrap();
        tftp::parse_data(&buf[..received]).unwrap();
        far.send(&tftp::forge_error(ErrorCode::DiskFull, "out of space"))
            .await
            .unwrap();

        match sender_task.await.unwrap() {
            Err(TransferError::Peer { code, message }) => {
                assert_eq!(code, ErrorCode::DiskFull);
                assert_eq!(message, "out of space");
            }
            other => panic!("expected a peer error, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_windowed_transfer_end_to_end() {
        // 4097 bytes at blksize 1024, windowsize 4: four full blocks plus
        // a one-byte tail, five blocks acknowledged in total.
        let dir = TempDir::new("scratch").unwrap();
        let contents = patterned(4097);
        let src_path = write_temp_file(&dir, "src.bin", &contents).await;
        let dst_path = dir.path().join("dst.bin");

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 1024, 4);
        let receiver_request = request.clone();

        let sender_task = tokio::spawn(async move {
            let mut file = File::open(src_path).await.unwrap();
            let mut sender = Sender::new();
            sender.run(&request, &mut near, &mut file).await
        });

        let mut receiver = Receiver::new();
        let mut out = File::create(&dst_path).await.unwrap();
        let bytes = receiver
            .run(&receiver_request, &mut far, &mut out)
            .await
            .unwrap();
        out.flush().await.unwrap();

        assert!(sender_task.await.unwrap().is_ok());
        assert_eq!(bytes, 4097);
        assert_eq!(receiver.last_written_block(), 5);

        let mut replayed = Vec::new();
        File::open(&dst_path)
            .await
            .unwrap()
            .read_to_end(&mut replayed)
            .await
            .unwrap();
        assert_eq!(replayed, contents);
    }

    #[tokio::test]
    async fn test_receiver_drops_out_of_order_block() {
        // Blocks arrive as 1, 3, 2, 1 within a window of four: 3 is
        // dropped on arrival but still consumes a slot, so the round ends
        // with ACK(2) and the sender owes a retransmission of the tail.
        let dir = TempDir::new("scratch").unwrap();
        let dst_path = dir.path().join("ooo.bin");

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 8, 4);

        let receiver_task = tokio::spawn(async move {
            let mut out = File::create(&dst_path).await.unwrap();
            let mut receiver = Receiver::new();
            let bytes = receiver.run(&request, &mut far, &mut out).await?;
            out.flush().await.unwrap();

            let mut replayed = Vec::new();
            File::open(&dst_path)
                .await
                .unwrap()
                .read_to_end(&mut replayed)
                .await
                .unwrap();
            Ok::<_, TransferError>((bytes, replayed))
        });

        near.send(&tftp::forge_data(1, b"11111111")).await.unwrap();
        near.send(&tftp::forge_data(3, b"33333333")).await.unwrap();
        near.send(&tftp::forge_data(2, b"22222222")).await.unwrap();
        near.send(&tftp::forge_data(1, b"11111111")).await.unwrap();

        let mut buf = [0_u8; 64];
        let received = near.recv(&mut buf).await.unwrap();
        assert_eq!(tftp::parse_ack(&buf[..received]).unwrap(), 2);

        // Retransmit the tail; the short block closes the transfer.
        near.send(&tftp::forge_data(3, b"33333333")).await.unwrap();
        near.send(&tftp::forge_data(4, b"444")).await.unwrap();

        let received = near.recv(&mut buf).await.unwrap();
        assert_eq!(tftp::parse_ack(&buf[..received]).unwrap(), 4);

        let (bytes, replayed) = receiver_task.await.unwrap().unwrap();
        assert_eq!(bytes, 27);
        assert_eq!(replayed, b"111111112222222233333333444");
    }

    #[tokio::test]
    async fn test_receiver_finishes_on_short_first_packet() {
        let dir = TempDir::new("scratch").unwrap();
        let dst_path = dir.path().join("short.bin");

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 512, 1);

        let receiver_task = tokio::spawn(async move {
            let mut out = File::create(&dst_path).await.unwrap();
            let mut receiver = Receiver::new();
            receiver.run(&request, &mut far, &mut out).await
        });

        near.send(&tftp::forge_data(1, b"hello")).await.unwrap();

        let mut buf = [0_u8; 64];
        let received = near.recv(&mut buf).await.unwrap();
        assert_eq!(tftp::parse_ack(&buf[..received]).unwrap(), 1);

        assert_eq!(receiver_task.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_receiver_gives_up_after_six_silent_rounds() {
        let dir = TempDir::new("scratch").unwrap();
        let dst_path = dir.path().join("never.bin");

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 512, 1);

        let mut out = File::create(&dst_path).await.unwrap();
        let mut receiver = Receiver::new();
        match receiver.run(&request, &mut far, &mut out).await {
            Err(TransferError::RetryExceeded) => {}
            other => panic!("expected retry exhaustion, got {:#?}", other),
        }

        let mut buf = [0_u8; 64];
        let received = near.recv(&mut buf).await.unwrap();
        let (code, message) = tftp::parse_error(&buf[..received]).unwrap();
        assert_eq!(code, ErrorCode::Undefined);
        assert_eq!(message, "Retry exceeded");
    }

    #[tokio::test]
    async fn test_receiver_aborts_on_peer_error() {
        let dir = TempDir::new("scratch").unwrap();
        let dst_path = dir.path().join("aborted.bin");

        let (near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 512, 1);

        let receiver_task = tokio::spawn(async move {
            let mut out = File::create(&dst_path).await.unwrap();
            let mut receiver = Receiver::new();
            receiver.run(&request, &mut far, &mut out).await
        });

        near.send(&tftp::forge_error(ErrorCode::AccessViolation, "denied"))
            .await
            .unwrap();

        match receiver_task.await.unwrap() {
            Err(TransferError::Peer { code, .. }) => {
                assert_eq!(code, ErrorCode::AccessViolation);
            }
            other => panic!("expected a peer error, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_file_travels_as_one_empty_packet() {
        let dir = TempDir::new("scratch").unwrap();
        let src_path = write_temp_file(&dir, "empty.bin", b"").await;
        let dst_path = dir.path().join("empty.out");

        let (mut near, mut far) = socket_pair();
        let request = request_with(OpCode::Wrq, 512, 1);
        let receiver_request = request.clone();

        let sender_task = tokio::spawn(async move {
            let mut file = File::open(src_path).await.unwrap();
            let mut sender = Sender::new();
            sender.run(&request, &mut near, &mut file).await
        });

        let mut receiver = Receiver::new();
        let mut out = File::create(&dst_path).await.unwrap();
        let bytes = receiver
            .run(&receiver_request, &mut far, &mut out)
            .await
            .unwrap();

        assert!(sender_task.await.unwrap().is_ok());
        assert_eq!(bytes, 0);
        assert_eq!(receiver.last_written_block(), 1);
    }
}
