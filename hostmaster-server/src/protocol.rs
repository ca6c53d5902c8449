//! Wire protocol: 4-byte big-endian length prefix followed by a JSON payload.
//!
//! Clients open with a `hello` frame and then send `request` frames one at a
//! time. The master answers each request with exactly one `response` frame,
//! followed by zero or more `invalidate` frames carrying the table ids that
//! changed since the previous flush.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hostmaster_core::{HostId, TableId};

use crate::error::{io_err, MasterError, ProtocolError, RejectKind, ServiceError};

/// Maximum frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Table list only.
pub const PROTOCOL_V1: u16 = 1;
/// Adds the barrier sequence to `invalidate` frames.
pub const PROTOCOL_V2: u16 = 2;

/// Inclusive range of protocol versions a peer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u16,
    pub max: u16,
}

impl VersionRange {
    pub fn contains(&self, version: u16) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: PROTOCOL_V1,
            max: PROTOCOL_V2,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    pub username: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_host: Option<HostId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: u64, error: ServiceError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateFrame {
    pub tables: Vec<TableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Frames sent by clients and daemons connecting to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello(Hello),
    Request(Request),
}

/// Frames sent by the master to a connected session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection_id: u64,
        protocol_version: u16,
    },
    Rejected {
        kind: RejectKind,
        message: String,
        supported: VersionRange,
    },
    Response(Response),
    Invalidate(InvalidateFrame),
}

impl ServerFrame {
    fn label(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::Rejected { .. } => "rejected",
            ServerFrame::Response(_) => "response",
            ServerFrame::Invalidate(_) => "invalidate",
        }
    }
}

/// Frames the master sends to a daemon over a pooled connection.
/// The daemon answers each with a bare [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonFrame {
    Hello { protocol_version: u16, key: String },
    Request(Request),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn checked_len(len_buf: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

fn closed_or_io(err: std::io::Error) -> ProtocolError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Io(err),
    }
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;
    let len = checked_len(len_buf)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    decode_payload(&payload)
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await.map_err(closed_or_io)?;
    writer.flush().await.map_err(closed_or_io)?;
    Ok(())
}

pub fn read_frame_blocking<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(closed_or_io)?;
    let len = checked_len(len_buf)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(closed_or_io)?;
    decode_payload(&payload)
}

pub fn write_frame_blocking<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: Write,
    T: Serialize,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).map_err(closed_or_io)?;
    writer.flush().map_err(closed_or_io)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocking client
// ---------------------------------------------------------------------------

/// A synchronous master session, used by the CLI and by tests.
///
/// `invalidate` frames that arrive while waiting for a response are buffered
/// and handed out by [`MasterClient::take_invalidations`].
#[derive(Debug)]
pub struct MasterClient {
    stream: TcpStream,
    connection_id: u64,
    protocol_version: u16,
    next_id: u64,
    invalidations: VecDeque<InvalidateFrame>,
}

impl MasterClient {
    pub fn connect(addr: impl ToSocketAddrs, hello: Hello) -> Result<Self, MasterError> {
        let mut stream = TcpStream::connect(addr).map_err(|e| io_err("connect to master", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| io_err("configure master socket", e))?;

        write_frame_blocking(&mut stream, &ClientFrame::Hello(hello))?;
        match read_frame_blocking::<_, ServerFrame>(&mut stream)? {
            ServerFrame::Welcome {
                connection_id,
                protocol_version,
            } => Ok(Self {
                stream,
                connection_id,
                protocol_version,
                next_id: 1,
                invalidations: VecDeque::new(),
            }),
            ServerFrame::Rejected { kind, message, .. } => {
                Err(MasterError::Rejected { kind, message })
            }
            other => Err(ProtocolError::UnexpectedFrame {
                expected: "welcome",
                got: other.label().to_string(),
            }
            .into()),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), MasterError> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| io_err("configure master socket", e))
    }

    /// Send one request and wait for its response.
    pub fn call(&mut self, cmd: &str, args: Value) -> Result<Value, MasterError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = ClientFrame::Request(Request {
            id,
            cmd: cmd.to_string(),
            args,
        });
        write_frame_blocking(&mut self.stream, &request)?;

        loop {
            match read_frame_blocking::<_, ServerFrame>(&mut self.stream)? {
                ServerFrame::Invalidate(frame) => self.invalidations.push_back(frame),
                ServerFrame::Response(response) if response.id == id => {
                    return response_into_data(response);
                }
                ServerFrame::Rejected { kind, message, .. } => {
                    return Err(MasterError::Rejected { kind, message });
                }
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "response",
                        got: other.label().to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Long-poll until the master has invalidations for this session, then
    /// collect them. The trailing `ping` guarantees every frame flushed after
    /// the `listen_caches` response has been read.
    pub fn listen(&mut self) -> Result<Vec<InvalidateFrame>, MasterError> {
        self.call("listen_caches", Value::Null)?;
        self.call("ping", Value::Null)?;
        Ok(self.take_invalidations())
    }

    pub fn take_invalidations(&mut self) -> Vec<InvalidateFrame> {
        self.invalidations.drain(..).collect()
    }
}

fn response_into_data(response: Response) -> Result<Value, MasterError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let error = response
            .error
            .unwrap_or_else(|| ServiceError::new("unknown", "unknown master error"));
        Err(MasterError::Service {
            kind: error.kind,
            message: error.message,
        })
    }
}
