// Session state for one transfer: the operation, the file, the mode, and
// the negotiable options. A Request is built by `parse` on the server or
// assembled directly on the client; after negotiation settles it is
// read-only for the rest of the session.

use crate::tftp::{
    self, peek_opcode, string_from_buffer, FileMode, OpCode, ProtocolError, TftpResult,
    MAX_REQUEST_SIZE,
};

/// The four options the engine knows about. Only `blksize` and
/// `windowsize` take part in negotiation; `timeout` and `tsize` are parsed
/// when a peer offers them but never advertised or echoed, so the wire
/// behaviour stays identical for peers that probe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    BlockSize,
    WindowSize,
    Timeout,
    TransferSize,
}

impl OptionKind {
    pub fn name(self) -> &'static str {
        match self {
            OptionKind::BlockSize => "blksize",
            OptionKind::WindowSize => "windowsize",
            OptionKind::Timeout => "timeout",
            OptionKind::TransferSize => "tsize",
        }
    }

    pub fn default(self) -> i64 {
        match self {
            OptionKind::BlockSize => 512,
            OptionKind::WindowSize => 1,
            OptionKind::Timeout => 1,
            OptionKind::TransferSize => 0,
        }
    }

    /// Inclusive clamp bounds from RFC 2348 (`blksize`), RFC 7440
    /// (`windowsize`), and RFC 2349 (`timeout`, `tsize`).
    pub fn bounds(self) -> (i64, i64) {
        match self {
            OptionKind::BlockSize => (8, 65464),
            OptionKind::WindowSize => (1, 65535),
            OptionKind::Timeout => (5, 255),
            OptionKind::TransferSize => (0, i64::MAX),
        }
    }

    /// Whether this option may appear in a forged request or OACK.
    pub fn negotiated(self) -> bool {
        matches!(self, OptionKind::BlockSize | OptionKind::WindowSize)
    }
}

/// One negotiable parameter: its current value and whether the remote
/// agreed to it. `value` always holds the effective setting, which is the
/// RFC default while the option is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOption {
    pub kind: OptionKind,
    pub value: i64,
    pub enabled: bool,
}

impl TransferOption {
    fn new(kind: OptionKind) -> TransferOption {
        TransferOption {
            kind,
            value: kind.default(),
            enabled: false,
        }
    }

    /// Enables the option with a clamped value. Used by the client to
    /// request an option before forging, and by the parsers.
    pub fn request(&mut self, value: i64) {
        let (min, max) = self.kind.bounds();
        self.value = value.clamp(min, max);
        self.enabled = true;
    }

    fn reset(&mut self) {
        self.value = self.kind.default();
        self.enabled = false;
    }

    /// Applies a wire value. Returns false when the text is not a decimal
    /// integer; out-of-range values are clamped silently.
    fn apply(&mut self, raw: &str) -> bool {
        match raw.parse::<i64>() {
            Ok(value) => {
                self.request(value);
                true
            }
            Err(_) => false,
        }
    }
}

/// A parsed RRQ/WRQ plus the option set negotiated for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: OpCode,
    pub filename: String,
    pub mode: FileMode,
    pub block_size: TransferOption,
    pub window_size: TransferOption,
    pub timeout: TransferOption,
    pub transfer_size: TransferOption,
}

impl Request {
    pub fn new(operation: OpCode, filename: &str, mode: FileMode) -> Request {
        Request {
            operation,
            filename: filename.to_string(),
            mode,
            block_size: TransferOption::new(OptionKind::BlockSize),
            window_size: TransferOption::new(OptionKind::WindowSize),
            timeout: TransferOption::new(OptionKind::Timeout),
            transfer_size: TransferOption::new(OptionKind::TransferSize),
        }
    }

    /// Effective block size for the transfer loops.
    pub fn blksize(&self) -> usize {
        self.block_size.value as usize
    }

    /// Effective window size for the transfer loops.
    pub fn window(&self) -> u16 {
        self.window_size.value as u16
    }

    pub fn options(&self) -> [&TransferOption; 4] {
        [
            &self.block_size,
            &self.window_size,
            &self.timeout,
            &self.transfer_size,
        ]
    }

    fn options_mut(&mut self) -> [&mut TransferOption; 4] {
        [
            &mut self.block_size,
            &mut self.window_size,
            &mut self.timeout,
            &mut self.transfer_size,
        ]
    }

    fn option_mut(&mut self, name: &str) -> Option<&mut TransferOption> {
        self.options_mut()
            .into_iter()
            .find(|option| option.kind.name().eq_ignore_ascii_case(name))
    }

    /// Puts every option back to its RFC default, disabled. A session that
    /// never sees an OACK runs with exactly this state.
    pub fn reset_options(&mut self) {
        for option in self.options_mut() {
            option.reset();
        }
    }

    /// Parses an RRQ/WRQ datagram. The minimum size is opcode + one-byte
    /// filename + terminator + "mail" + terminator; the maximum is the
    /// classic 512. Unknown option names are skipped for forward
    /// compatibility, unknown modes parse to `Invalid`, and any string
    /// field missing its terminator rejects the whole packet.
    pub fn parse(buf: &[u8]) -> TftpResult<Request> {
        if buf.len() < 8 || buf.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::PacketParse(format!(
                "request of {} bytes is outside [8, {}]",
                buf.len(),
                MAX_REQUEST_SIZE
            )));
        }

        let operation = peek_opcode(buf);
        if operation != OpCode::Rrq && operation != OpCode::Wrq {
            return Err(ProtocolError::PacketParse(
                "expected an RRQ or WRQ packet".to_string(),
            ));
        }

        let mut pos = 2;
        let (filename, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
            ProtocolError::PacketParse("filename is not null-terminated".to_string())
        })?;
        pos += used;

        let (mode_name, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
            ProtocolError::PacketParse("mode is not null-terminated".to_string())
        })?;
        pos += used;

        let mut request = Request::new(operation, &filename, FileMode::from_name(&mode_name));

        while pos < buf.len() {
            let (name, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
                ProtocolError::PacketParse("option name is not null-terminated".to_string())
            })?;
            pos += used;
            let (raw_value, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
                ProtocolError::PacketParse("option value is not null-terminated".to_string())
            })?;
            pos += used;

            match request.option_mut(&name) {
                // A value that fails to parse skips the option, not the packet.
                Some(option) => {
                    if !option.apply(&raw_value) {
                        log::debug!("ignoring option {} with bad value '{}'", name, raw_value);
                    }
                }
                None => log::debug!("skipping unknown option '{}'", name),
            }
        }

        Ok(request)
    }

    /// Forges the RRQ/WRQ image of this request, option pairs included.
    pub fn forge(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_REQUEST_SIZE);
        tftp::push_u16(&mut buf, self.operation.as_u16());
        tftp::push_string(&mut buf, &self.filename);
        tftp::push_string(&mut buf, self.mode.name());
        for option in self.options() {
            if option.enabled && option.kind.negotiated() {
                tftp::push_string(&mut buf, option.kind.name());
                tftp::push_string(&mut buf, &option.value.to_string());
            }
        }
        buf
    }

    /// Forges the OACK listing every option in force. An empty return means
    /// nothing was negotiated and the caller falls back to the base
    /// protocol (plain ACK(0) for a WRQ, first DATA for an RRQ).
    pub fn forge_option_ack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_REQUEST_SIZE);
        tftp::push_u16(&mut buf, OpCode::OptAck.as_u16());
        for option in self.options() {
            if option.enabled && option.kind.negotiated() {
                tftp::push_string(&mut buf, option.kind.name());
                tftp::push_string(&mut buf, &option.value.to_string());
            }
        }
        if buf.len() == 2 {
            buf.clear();
        }
        buf
    }

    /// Applies a received OACK. The OACK is authoritative: every option is
    /// reset first, then only what the server echoed comes back into
    /// force. An option we never heard of is a negotiation failure, since a
    /// compliant server only echoes what it was offered.
    pub fn parse_option_ack(&mut self, buf: &[u8]) -> TftpResult<()> {
        if buf.len() < 4 || buf.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::PacketParse(format!(
                "option ack of {} bytes is outside [4, {}]",
                buf.len(),
                MAX_REQUEST_SIZE
            )));
        }
        if peek_opcode(buf) != OpCode::OptAck {
            return Err(ProtocolError::PacketParse(
                "expected an OACK packet".to_string(),
            ));
        }

        self.reset_options();

        let mut pos = 2;
        while pos < buf.len() {
            let (name, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
                ProtocolError::PacketParse("option name is not null-terminated".to_string())
            })?;
            pos += used;
            let (raw_value, used) = string_from_buffer(&buf[pos..]).ok_or_else(|| {
                ProtocolError::PacketParse("option value is not null-terminated".to_string())
            })?;
            pos += used;

            match self.option_mut(&name) {
                Some(option) => {
                    if !option.apply(&raw_value) {
                        return Err(ProtocolError::Negotiation(format!(
                            "server sent option {} with bad value '{}'",
                            name, raw_value
                        )));
                    }
                }
                None => {
                    return Err(ProtocolError::Negotiation(format!(
                        "server acknowledged unknown option '{}'",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}
