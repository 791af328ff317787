//! Wire framing and message types for the agent channel.
//!
//! Every frame is a 4-byte big-endian unsigned length followed by that many
//! bytes of compact JSON with top-level fields `{type, data}`. Reads use a
//! `read_exact` discipline so arbitrary TCP fragmentation never tears a
//! frame; a clean EOF at a frame boundary reads as end-of-session.

use crate::error::{CtiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One telemetry row as reported by an agent: field name to value.
pub type Row = Map<String, Value>;

/// Rows for one rule; agents send either a single row or an array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowSet {
    Many(Vec<Row>),
    One(Row),
}

impl RowSet {
    /// Normalizes to a list of rows.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            RowSet::Many(rows) => rows,
            RowSet::One(row) => vec![row],
        }
    }
}

/// Protocol messages, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Message {
    /// Agent to server: collected rows keyed by rule name.
    Data(BTreeMap<String, RowSet>),
    /// Server to agent: the currently enabled rule set.
    Upd(BTreeMap<String, String>),
    /// Server to agent: telemetry accepted.
    Ack,
    /// Server to agent: human-readable failure description.
    Err(String),
}

/// Reads one length-prefixed frame body.
///
/// Returns `Ok(None)` on clean EOF before the length prefix. EOF inside a
/// frame is an error, as is a length above [`MAX_FRAME_LEN`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CtiError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(CtiError::FrameTooLarge {
            len: body.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serializes and sends one message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body).await
}

/// Receives and parses one message; `Ok(None)` on clean EOF.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    match read_frame(reader).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}
