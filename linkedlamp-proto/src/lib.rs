//! LinkedLamp provisioning protocol - message types and framing
//!
//! Every frame is a one-byte type tag followed by a type-specific payload.
//! Strings are always length-prefixed (one length byte, then UTF-8 bytes),
//! never NUL-terminated.
//!
//! | Direction     | Tag                 | Payload                                         |
//! |---------------|---------------------|-------------------------------------------------|
//! | app -> device | `SSID_LIST_REQUEST` | -                                               |
//! | app -> device | `SSID_ACK`          | ssid_index:u8, chunk_index:u8                   |
//! | app -> device | `CONFIGURATION`     | len+group_name, len+ssid, len+password          |
//! | device -> app | `SSID`              | ssid_index, chunk_count, chunk_index, len, data |
//! | device -> app | `SSID_END`          | -                                               |
//! | device -> app | `WIFI_OK`           | -                                               |
//! | device -> app | `WIFI_FAIL`         | -                                               |

pub mod ble;

use std::fmt;

// App -> device message types
pub const MSG_SSID_LIST_REQUEST: u8 = 0x00;
pub const MSG_SSID_ACK: u8 = 0x01;
pub const MSG_CONFIGURATION: u8 = 0x02;

// Device -> app message types
pub const MSG_SSID: u8 = 0x00;
pub const MSG_SSID_END: u8 = 0x01;
pub const MSG_WIFI_OK: u8 = 0x02;
pub const MSG_WIFI_FAIL: u8 = 0x03;

/// Largest string a single length byte can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// ssid_index, chunk_count, chunk_index, length
pub const SSID_HEADER_LEN: usize = 4;

/// A frame that could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,
    #[error("malformed SSID frame")]
    MalformedSsid,
    #[error("malformed SSID ack frame")]
    MalformedAck,
    #[error("malformed configuration frame")]
    MalformedConfiguration,
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

/// A value that does not fit the wire format
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("{field} is {len} bytes long, at most 255 fit in a frame")]
    FieldTooLong { field: &'static str, len: usize },
}

/// One fragment of an SSID sent by the device
///
/// Chunk boundaries are byte boundaries: a multi-byte character may be split
/// across two chunks, so `data` is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsidChunk {
    pub ssid_index: u8,
    pub chunk_count: u8,
    pub chunk_index: u8,
    pub data: Vec<u8>,
}

impl SsidChunk {
    pub fn new(ssid_index: u8, chunk_count: u8, chunk_index: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ssid_index,
            chunk_count,
            chunk_index,
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let len = field_len("chunk", &self.data)?;
        let mut buf = Vec::with_capacity(SSID_HEADER_LEN + self.data.len());
        buf.push(self.ssid_index);
        buf.push(self.chunk_count);
        buf.push(self.chunk_index);
        buf.push(len);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < SSID_HEADER_LEN {
            return Err(ProtocolError::MalformedSsid);
        }
        let len = data[3] as usize;
        let chunk = data
            .get(SSID_HEADER_LEN..SSID_HEADER_LEN + len)
            .ok_or(ProtocolError::MalformedSsid)?;

        Ok(Self {
            ssid_index: data[0],
            chunk_count: data[1],
            chunk_index: data[2],
            data: chunk.to_vec(),
        })
    }
}

/// WiFi and group credentials pushed to the device
#[derive(Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Opaque group credential, passed through to the firmware as-is
    pub group_name: String,
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("group_name", &self.group_name)
            .field("ssid", &self.ssid)
            .field("password", &format_args!("<{} bytes>", self.password.len()))
            .finish()
    }
}

impl Configuration {
    pub fn new(group_name: &str, ssid: &str, password: &str) -> Self {
        Self {
            group_name: group_name.to_string(),
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let fields = [
            ("group name", self.group_name.as_bytes()),
            ("ssid", self.ssid.as_bytes()),
            ("password", self.password.as_bytes()),
        ];

        let mut buf = Vec::with_capacity(3 + fields.iter().map(|(_, b)| b.len()).sum::<usize>());
        for (field, bytes) in fields {
            buf.push(field_len(field, bytes)?);
            buf.extend_from_slice(bytes);
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let group_name = read_string(data, &mut pos)?;
        let ssid = read_string(data, &mut pos)?;
        let password = read_string(data, &mut pos)?;
        Ok(Self {
            group_name,
            ssid,
            password,
        })
    }
}

fn field_len(field: &'static str, bytes: &[u8]) -> Result<u8, EncodingError> {
    u8::try_from(bytes.len()).map_err(|_| EncodingError::FieldTooLong {
        field,
        len: bytes.len(),
    })
}

fn read_string(data: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let len = *data.get(*pos).ok_or(ProtocolError::MalformedConfiguration)? as usize;
    let start = *pos + 1;
    let bytes = data
        .get(start..start + len)
        .ok_or(ProtocolError::MalformedConfiguration)?;
    *pos = start + len;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::MalformedConfiguration)
}

/// Frames written by the app
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFrame {
    SsidListRequest,
    SsidAck { ssid_index: u8, chunk_index: u8 },
    Configuration(Configuration),
}

impl AppFrame {
    pub fn msg_type(&self) -> u8 {
        match self {
            AppFrame::SsidListRequest => MSG_SSID_LIST_REQUEST,
            AppFrame::SsidAck { .. } => MSG_SSID_ACK,
            AppFrame::Configuration(_) => MSG_CONFIGURATION,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = vec![self.msg_type()];
        match self {
            AppFrame::SsidListRequest => {}
            AppFrame::SsidAck {
                ssid_index,
                chunk_index,
            } => {
                buf.push(*ssid_index);
                buf.push(*chunk_index);
            }
            AppFrame::Configuration(config) => buf.extend(config.to_bytes()?),
        }
        Ok(buf)
    }

    /// Device-side decoding, used by simulated lamps
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&msg_type, payload) = data.split_first().ok_or(ProtocolError::EmptyMessage)?;
        match msg_type {
            MSG_SSID_LIST_REQUEST => Ok(AppFrame::SsidListRequest),
            MSG_SSID_ACK => match payload {
                [ssid_index, chunk_index, ..] => Ok(AppFrame::SsidAck {
                    ssid_index: *ssid_index,
                    chunk_index: *chunk_index,
                }),
                _ => Err(ProtocolError::MalformedAck),
            },
            MSG_CONFIGURATION => Configuration::from_bytes(payload).map(AppFrame::Configuration),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Frames notified by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFrame {
    Ssid(SsidChunk),
    SsidEnd,
    WifiOk,
    WifiFail,
}

impl DeviceFrame {
    pub fn msg_type(&self) -> u8 {
        match self {
            DeviceFrame::Ssid(_) => MSG_SSID,
            DeviceFrame::SsidEnd => MSG_SSID_END,
            DeviceFrame::WifiOk => MSG_WIFI_OK,
            DeviceFrame::WifiFail => MSG_WIFI_FAIL,
        }
    }

    /// Device-side encoding, used by simulated lamps
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = vec![self.msg_type()];
        if let DeviceFrame::Ssid(chunk) = self {
            buf.extend(chunk.to_bytes()?);
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&msg_type, payload) = data.split_first().ok_or(ProtocolError::EmptyMessage)?;
        match msg_type {
            MSG_SSID => SsidChunk::from_bytes(payload).map(DeviceFrame::Ssid),
            MSG_SSID_END => Ok(DeviceFrame::SsidEnd),
            MSG_WIFI_OK => Ok(DeviceFrame::WifiOk),
            MSG_WIFI_FAIL => Ok(DeviceFrame::WifiFail),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

pub fn encode_ssid_list_request() -> Vec<u8> {
    vec![MSG_SSID_LIST_REQUEST]
}

pub fn encode_ssid_ack(ssid_index: u8, chunk_index: u8) -> Vec<u8> {
    vec![MSG_SSID_ACK, ssid_index, chunk_index]
}

/// Fails if any field is longer than 255 bytes once UTF-8 encoded
pub fn encode_configuration(
    group_name: &str,
    ssid: &str,
    password: &str,
) -> Result<Vec<u8>, EncodingError> {
    AppFrame::Configuration(Configuration::new(group_name, ssid, password)).to_bytes()
}

pub fn decode_incoming(data: &[u8]) -> Result<DeviceFrame, ProtocolError> {
    DeviceFrame::from_bytes(data)
}
