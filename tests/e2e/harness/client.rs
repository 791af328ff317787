//! Agent-side driver speaking the wire protocol over any byte stream.

use anyhow::{bail, Context, Result};
use cti_core::codec::{self, Message, RowSet};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected agent: the client half of the pipe plus the session task.
pub struct AgentClient<S = tokio::io::DuplexStream> {
    stream: S,
    session: Option<JoinHandle<cti_core::Result<()>>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentClient<S> {
    pub fn new(stream: S, session: JoinHandle<cti_core::Result<()>>) -> Self {
        Self {
            stream,
            session: Some(session),
        }
    }

    /// Wraps a bare stream with no attached session task (TLS scenarios,
    /// where the accept loop owns the session).
    pub fn over(stream: S) -> Self {
        Self {
            stream,
            session: None,
        }
    }

    /// Sends one protocol message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        codec::write_message(&mut self.stream, message).await?;
        Ok(())
    }

    /// Sends a `data` message for one rule.
    pub async fn send_data(&mut self, rule: &str, rows: Value) -> Result<()> {
        let rows: RowSet = serde_json::from_value(rows).context("rows must be a row or array")?;
        let mut data = BTreeMap::new();
        data.insert(rule.to_string(), rows);
        self.send(&Message::Data(data)).await
    }

    /// Receives one message, bounded by a timeout.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let msg = tokio::time::timeout(RECV_TIMEOUT, codec::read_message(&mut self.stream))
            .await
            .context("timed out waiting for a message")??;
        Ok(msg)
    }

    /// Receives a message and requires it to be an `upd`.
    pub async fn expect_upd(&mut self) -> Result<BTreeMap<String, String>> {
        match self.recv().await? {
            Some(Message::Upd(rules)) => Ok(rules),
            other => bail!("expected upd, got {other:?}"),
        }
    }

    /// Receives a message and requires it to be an `ack`.
    pub async fn expect_ack(&mut self) -> Result<()> {
        match self.recv().await? {
            Some(Message::Ack) => Ok(()),
            other => bail!("expected ack, got {other:?}"),
        }
    }

    /// Receives a message and requires it to be an `err`.
    pub async fn expect_err(&mut self) -> Result<String> {
        match self.recv().await? {
            Some(Message::Err(msg)) => Ok(msg),
            other => bail!("expected err, got {other:?}"),
        }
    }

    /// Hangs up and waits for the session task to finish.
    ///
    /// The session's own outcome is discarded: a server writing a reply
    /// into an already-closed pipe is a normal disconnect, not a failure.
    /// Panics in the session still propagate.
    pub async fn close(self) -> Result<()> {
        let Self { stream, session } = self;
        drop(stream);
        if let Some(session) = session {
            let _ = session.await.context("session panicked")?;
        }
        Ok(())
    }
}
