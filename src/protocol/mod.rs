//! Wire protocol codec (§4.1).
//!
//! Frames are `[8-hex-char length][JSON body]`, where the body is a JSON
//! array of exactly two elements `[message_type, data]`. The reader and
//! writer operate over any `AsyncRead`/`AsyncWrite` so the same codec
//! drives both an SSH session and an in-memory duplex pipe in tests.
//!
//! Grounded on `examples/original_source/src/ftl2/message.py`'s
//! `GateProtocol.send_message`/`read_message`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The closed set of message types the protocol recognizes (§4.1 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Handshake / keepalive, sent in both directions.
    Hello,
    /// Query gate metadata.
    Info,
    /// Reply to `Info`.
    InfoResult,
    /// Enumerate baked-in modules.
    ListModules,
    /// Reply to `ListModules`.
    ListModulesResult,
    /// Execute a non-async module.
    Module,
    /// Execute an async ("fast-path") module.
    FtlModule,
    /// Result of a non-async module invocation.
    ModuleResult,
    /// Result of an async module invocation.
    FtlModuleResult,
    /// The gate lacks the requested module and no payload was sent.
    ModuleNotFound,
    /// A handled error.
    Error,
    /// An unhandled exception inside the gate.
    GateSystemError,
    /// Ask the gate to exit cleanly.
    Shutdown,
    /// Subscribe to filesystem events at a path.
    Watch,
    /// Unsubscribe from filesystem events at a path.
    Unwatch,
    /// A file under a watched path changed.
    FileChanged,
    /// A directory under a watched path changed.
    DirectoryChanged,
}

impl MessageType {
    /// The wire string for this message type, matching the Python source's
    /// bare-enum-name serialization.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "Hello",
            MessageType::Info => "Info",
            MessageType::InfoResult => "InfoResult",
            MessageType::ListModules => "ListModules",
            MessageType::ListModulesResult => "ListModulesResult",
            MessageType::Module => "Module",
            MessageType::FtlModule => "FTLModule",
            MessageType::ModuleResult => "ModuleResult",
            MessageType::FtlModuleResult => "FTLModuleResult",
            MessageType::ModuleNotFound => "ModuleNotFound",
            MessageType::Error => "Error",
            MessageType::GateSystemError => "GateSystemError",
            MessageType::Shutdown => "Shutdown",
            MessageType::Watch => "Watch",
            MessageType::Unwatch => "Unwatch",
            MessageType::FileChanged => "FileChanged",
            MessageType::DirectoryChanged => "DirectoryChanged",
        }
    }

    /// Parse a wire string into a `MessageType`, failing with a
    /// `ProtocolError` if it isn't a member of the closed set.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "Hello" => MessageType::Hello,
            "Info" => MessageType::Info,
            "InfoResult" => MessageType::InfoResult,
            "ListModules" => MessageType::ListModules,
            "ListModulesResult" => MessageType::ListModulesResult,
            "Module" => MessageType::Module,
            "FTLModule" => MessageType::FtlModule,
            "ModuleResult" => MessageType::ModuleResult,
            "FTLModuleResult" => MessageType::FtlModuleResult,
            "ModuleNotFound" => MessageType::ModuleNotFound,
            "Error" => MessageType::Error,
            "GateSystemError" => MessageType::GateSystemError,
            "Shutdown" => MessageType::Shutdown,
            "Watch" => MessageType::Watch,
            "Unwatch" => MessageType::Unwatch,
            "FileChanged" => MessageType::FileChanged,
            "DirectoryChanged" => MessageType::DirectoryChanged,
            other => return Err(Error::Protocol(format!("unknown message type: {other}"))),
        })
    }

    /// True for message types the event router (§4.9) treats as
    /// asynchronous events rather than request replies.
    #[must_use]
    pub fn is_event(self) -> bool {
        matches!(self, MessageType::FileChanged | MessageType::DirectoryChanged)
    }
}

/// A decoded `[message_type, data]` frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The message type.
    pub message_type: MessageType,
    /// The message body, an arbitrary JSON object.
    pub data: Value,
}

/// The maximum body length this codec will accept before treating the
/// length prefix as bogus (§8 boundary behavior: guard above a configured
/// maximum; 256 MiB is generous for any bundle/gate payload in practice).
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Write one frame: length prefix and body concatenated into a single
/// write, then flushed, matching the source's "write both, then drain"
/// discipline so partial frames are never observable to the peer.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    data: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(&[Value::String(message_type.as_str().to_string()), data.clone()])?;
    if body.len() > MAX_BODY_LEN {
        return Err(Error::Protocol(format!(
            "message body too large: {} bytes",
            body.len()
        )));
    }
    let prefix = format!("{:08x}", body.len());
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            Error::ConnectionClosed { host: None }
        } else {
            Error::Io(e)
        }
    })?;
    writer.flush().await?;
    Ok(())
}

/// Write a frame carrying a typed payload, serialized to JSON first.
pub async fn write_typed<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    message_type: MessageType,
    data: &T,
) -> Result<()> {
    let value = serde_json::to_value(data)?;
    write_message(writer, message_type, &value).await
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at the length-prefix
/// boundary (the protocol's normal termination signal), `Err` on any
/// other malformed input.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 8];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        None => return Ok(None),
        Some(n) if n != 8 => {
            return Err(Error::Protocol(format!(
                "invalid length prefix: expected 8 bytes, got {n}"
            )))
        }
        Some(_) => {}
    }

    let len_str = std::str::from_utf8(&len_buf)
        .map_err(|_| Error::Protocol(format!("invalid hex length: {len_buf:?}")))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid hex length: {len_str:?}")))?;

    if len > MAX_BODY_LEN {
        return Err(Error::Protocol(format!(
            "declared body length {len} exceeds maximum {MAX_BODY_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Protocol(format!("incomplete message body: {e}")))?;

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::Protocol(format!("invalid JSON body: {e}")))?;

    let arr = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| Error::Protocol(format!("invalid message format: {value}")))?;

    let type_str = arr[0]
        .as_str()
        .ok_or_else(|| Error::Protocol(format!("invalid message type: {}", arr[0])))?;

    Ok(Some(Frame {
        message_type: MessageType::parse(type_str)?,
        data: arr[1].clone(),
    }))
}

/// Read one frame and deserialize its body into `T`.
pub async fn read_typed<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<(MessageType, T)>> {
    match read_message(reader).await? {
        None => Ok(None),
        Some(frame) => {
            let data: T = serde_json::from_value(frame.data)?;
            Ok(Some((frame.message_type, data)))
        }
    }
}

/// Read exactly `buf.len()` bytes, or `None` if EOF occurs before any
/// byte is read; `Some(n)` with `n < buf.len()` on a short read past that
/// point (the caller treats that as a protocol error).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            return if total == 0 { Ok(None) } else { Ok(Some(total)) };
        }
        total += n;
    }
    Ok(Some(total))
}
