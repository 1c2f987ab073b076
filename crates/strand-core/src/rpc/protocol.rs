//! Shared wire protocol types and framing.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by a
//! UTF-8 JSON payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The same framing carries cluster command messages between a primary and
//! its worker processes.

use crate::error::{FlatError, Result, RpcError};
use crate::rpc::context::CallContext;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Messages exchanged over one persistent RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    /// First frame from a caller: selects the service namespace.
    Hello { namespace: String },
    /// Router answer to `hello`; an error means the connection is closing.
    HelloAck {
        #[serde(default)]
        error: Option<FlatError>,
    },
    Call {
        id: u64,
        remote_call: String,
        args: Vec<Value>,
        #[serde(default)]
        context: CallContext,
    },
    CallResult {
        id: u64,
        #[serde(default)]
        error: Option<FlatError>,
        #[serde(default)]
        result: Value,
    },
    StreamData {
        stream_id: String,
        #[serde(with = "hex_chunks")]
        data: Vec<Bytes>,
        ack_id: u64,
    },
    StreamAck { stream_id: String, ack_id: u64 },
    StreamEnd { stream_id: String },
    StreamError { stream_id: String, error: FlatError },
    StreamHangup { stream_id: String },
}

/// Stream chunks travel as hex strings inside the JSON payload.
mod hex_chunks {
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(chunks.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|s| hex::decode(s).map(Bytes::from).map_err(D::Error::custom))
            .collect()
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| RpcError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as JSON.
pub async fn read_message<R, T>(reader: &mut R, max_size: usize) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader, max_size).await? {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
        None => Ok(None),
    }
}

/// Encode a message as JSON and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}
