//! TFTP Packet Codec
//!
//! Pure functions mapping wire bytes to and from typed protocol packets.
//! Decoding is the authority on wire validity; encoding is total and
//! lossless for well-formed packets.
//!
//! All multi-byte integers on the wire are big-endian. Strings are
//! NUL-terminated, which is why a decoded filename or error message can
//! never contain an embedded NUL.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Fixed TFTP block size in bytes. A DATA payload shorter than this marks
/// the end of a transfer.
pub const BLOCK_SIZE: usize = 512;

/// TFTP packet opcodes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries a 2-byte block number and up to 512 bytes of data. The last
    /// packet of a transfer carries less than the full block size.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Packet format: | Opcode | Block# |
    Ack = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl Opcode {
    /// Convert a u16 wire value to an Opcode.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::ReadRequest));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 wire representation.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short protocol name of the opcode.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::ReadRequest.name(), "RRQ");
    /// assert_eq!(Opcode::Data.name(), "DATA");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes 0 through 7 as defined in RFC 1350.
///
/// A wire code outside this range is a [`DecodeError::UnknownErrorCode`],
/// not a representable packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: Not defined, see error message.
    NotDefined = 0,

    /// Error code 1: File not found.
    FileNotFound = 1,

    /// Error code 2: Access violation.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded.
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID.
    UnknownTransferId = 5,

    /// Error code 6: File already exists.
    FileAlreadyExists = 6,

    /// Error code 7: No such user.
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Convert a u16 wire value to an ErrorCode.
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
    /// assert_eq!(ErrorCode::from_u16(8), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 wire representation.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Default human-readable message for this error code.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP transfer modes.
///
/// Parsed case-insensitively from the wire, always encoded lower-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Text mode ("netascii").
    Netascii,
    /// Binary mode ("octet").
    Octet,
}

impl Mode {
    /// Parse a transfer mode from a string, case-insensitively.
    ///
    /// # Examples
    /// ```
    /// use tftp::Mode;
    ///
    /// assert_eq!(Mode::from_str_opt("octet"), Some(Mode::Octet));
    /// assert_eq!(Mode::from_str_opt("NETASCII"), Some(Mode::Netascii));
    /// assert_eq!(Mode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Self::Netascii),
            "octet" => Some(Self::Octet),
            _ => None,
        }
    }

    /// The normalized wire spelling of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unknown transfer mode: {}", s))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reasons a datagram fails to decode into a [`Packet`].
///
/// Decode failures never crash the dispatcher or a session; the offending
/// datagram is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The first two bytes are not a known opcode.
    #[error("unknown packet opcode {0}")]
    UnknownOpcode(u16),

    /// A request or error payload is missing its NUL terminator.
    #[error("not null terminated")]
    NotTerminated,

    /// A request payload does not split into filename and mode.
    #[error("{0} fields in request payload")]
    MalformedRequest(usize),

    /// A request carries a mode string other than netascii or octet.
    #[error("unknown transfer mode {0:?}")]
    UnknownMode(String),

    /// A DATA payload exceeds the 512-byte block size.
    #[error("exceeded block length with {0} bytes")]
    PayloadTooLarge(usize),

    /// The datagram or payload has the wrong length for its opcode.
    #[error("wrong payload length with {0} bytes")]
    BadLength(usize),

    /// An ERROR packet carries a code outside 0 through 7.
    #[error("unknown error code {0}")]
    UnknownErrorCode(u16),
}

/// A TFTP packet, one variant per opcode.
///
/// Immutable once constructed. [`Packet::decode`] is the only way to obtain
/// one from wire bytes and validates strictly; a malformed datagram yields a
/// [`DecodeError`], never a partially constructed packet.
///
/// # Examples
/// ```
/// use tftp::{Mode, Packet};
///
/// let pkt = Packet::decode(b"\x00\x01test.txt\x00netascii\x00").unwrap();
/// assert_eq!(
///     pkt,
///     Packet::ReadRequest { filename: "test.txt".into(), mode: Mode::Netascii }
/// );
/// assert_eq!(pkt.encode(), b"\x00\x01test.txt\x00netascii\x00");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client requests to read a file from the server.
    ReadRequest { filename: String, mode: Mode },
    /// Client requests to write a file to the server.
    WriteRequest { filename: String, mode: Mode },
    /// One block of file content, up to 512 bytes.
    Data { block: u16, payload: Vec<u8> },
    /// Acknowledges receipt of the data block with the same number.
    Ack { block: u16 },
    /// Reports an error condition and terminates the transfer.
    Error { code: ErrorCode, message: String },
}

impl Packet {
    /// Decode a datagram into a packet.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::BadLength(buf.len()));
        }

        let word = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(word).ok_or(DecodeError::UnknownOpcode(word))?;
        let payload = &buf[2..];

        match opcode {
            Opcode::ReadRequest => {
                let (filename, mode) = decode_request(payload)?;
                Ok(Self::ReadRequest { filename, mode })
            }
            Opcode::WriteRequest => {
                let (filename, mode) = decode_request(payload)?;
                Ok(Self::WriteRequest { filename, mode })
            }
            Opcode::Data => {
                if payload.len() < 2 {
                    return Err(DecodeError::BadLength(payload.len()));
                }
                let block = u16::from_be_bytes([payload[0], payload[1]]);
                let data = &payload[2..];
                if data.len() > BLOCK_SIZE {
                    return Err(DecodeError::PayloadTooLarge(data.len()));
                }
                Ok(Self::Data {
                    block,
                    payload: data.to_vec(),
                })
            }
            Opcode::Ack => {
                if payload.len() != 2 {
                    return Err(DecodeError::BadLength(payload.len()));
                }
                let block = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(Self::Ack { block })
            }
            Opcode::Error => {
                if payload.len() < 3 {
                    return Err(DecodeError::BadLength(payload.len()));
                }
                if payload[payload.len() - 1] != 0 {
                    return Err(DecodeError::NotTerminated);
                }
                let word = u16::from_be_bytes([payload[0], payload[1]]);
                let code = ErrorCode::from_u16(word).ok_or(DecodeError::UnknownErrorCode(word))?;
                // Message runs up to the first NUL; the terminator is never
                // part of it, so a decoded message has no embedded NUL.
                let msg = &payload[2..];
                let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
                Ok(Self::Error {
                    code,
                    message: String::from_utf8_lossy(&msg[..end]).into_owned(),
                })
            }
        }
    }

    /// Encode the packet back to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ReadRequest { filename, mode } => encode_request(Opcode::ReadRequest, filename, *mode),
            Self::WriteRequest { filename, mode } => encode_request(Opcode::WriteRequest, filename, *mode),
            Self::Data { block, payload } => {
                let mut v = Vec::with_capacity(4 + payload.len());
                v.extend_from_slice(&Opcode::Data.as_u16().to_be_bytes());
                v.extend_from_slice(&block.to_be_bytes());
                v.extend_from_slice(payload);
                v
            }
            Self::Ack { block } => {
                let mut v = Vec::with_capacity(4);
                v.extend_from_slice(&Opcode::Ack.as_u16().to_be_bytes());
                v.extend_from_slice(&block.to_be_bytes());
                v
            }
            Self::Error { code, message } => {
                let mut v = Vec::with_capacity(4 + message.len() + 1);
                v.extend_from_slice(&Opcode::Error.as_u16().to_be_bytes());
                v.extend_from_slice(&code.as_u16().to_be_bytes());
                v.extend_from_slice(message.as_bytes());
                v.push(0);
                v
            }
        }
    }

    /// The opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest { .. } => Opcode::ReadRequest,
            Self::WriteRequest { .. } => Opcode::WriteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
        }
    }
}

/// Parse the payload of an RRQ or WRQ into filename and mode.
fn decode_request(payload: &[u8]) -> Result<(String, Mode), DecodeError> {
    if payload.last() != Some(&0) {
        return Err(DecodeError::NotTerminated);
    }

    let body = &payload[..payload.len() - 1];
    let mut fields: Vec<&[u8]> = body.split(|&b| b == 0).collect();
    while fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }
    if fields.len() != 2 {
        return Err(DecodeError::MalformedRequest(fields.len()));
    }

    let filename = String::from_utf8_lossy(fields[0]).into_owned();
    let mode_str = String::from_utf8_lossy(fields[1]);
    let mode = Mode::from_str_opt(&mode_str).ok_or_else(|| DecodeError::UnknownMode(mode_str.into_owned()))?;

    Ok((filename, mode))
}

fn encode_request(opcode: Opcode, filename: &str, mode: Mode) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + filename.len() + 1 + mode.as_str().len() + 1);
    v.extend_from_slice(&opcode.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_str().as_bytes());
    v.push(0);
    v
}
