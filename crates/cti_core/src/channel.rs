//! The agent-facing channel: TLS listener and per-agent sessions.
//!
//! Each accepted connection gets an independent session task. Sessions
//! share only the rule engine (and, through it, the store); they exchange
//! length-prefixed JSON frames with the agent and push rule updates when
//! the enabled set changes. The session body is generic over the stream so
//! the protocol can be exercised over in-memory pipes.

use crate::codec::{self, Message};
use crate::error::{CtiError, Result};
use crate::rules::RuleEngine;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Builds a server-authenticated TLS acceptor from PEM files.
pub fn load_tls_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(certfile)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(CtiError::Tls(format!(
            "no certificates in {}",
            certfile.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(keyfile)?))?
        .ok_or_else(|| CtiError::Tls(format!("no private key in {}", keyfile.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CtiError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The accept loop for agent connections.
pub struct Channel {
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    rules: Arc<RuleEngine>,
}

impl Channel {
    pub fn new(addr: SocketAddr, acceptor: TlsAcceptor, rules: Arc<RuleEngine>) -> Self {
        Self {
            addr,
            acceptor,
            rules,
        }
    }

    /// Binds the configured address and accepts until cancellation.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, cancel).await
    }

    /// Accepts agents on a pre-bound listener until cancellation, then
    /// drains live sessions.
    pub async fn serve_on(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "agent channel listening");
        }

        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(%e, "accept failed");
                            continue;
                        }
                    };
                    let acceptor = self.acceptor.clone();
                    let rules = self.rules.clone();
                    let cancel = cancel.clone();
                    sessions.spawn(async move {
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                info!(%peer, %e, "tls handshake failed");
                                return;
                            }
                        };
                        info!(%peer, "agent connected");
                        if let Err(e) =
                            run_session(tls, peer.ip().to_string(), rules, cancel).await
                        {
                            info!(%peer, %e, "session ended with error");
                        }
                        info!(%peer, "agent disconnected");
                    });
                }
            }
        }

        drop(listener);
        sessions.close();
        sessions.wait().await;
        info!("agent channel stopped");
        Ok(())
    }
}

/// One agent session over any byte stream.
///
/// Protocol: an initial `upd` with the enabled rule set, then a loop that
/// pushes a fresh `upd` whenever the set changes and answers each inbound
/// message. `data` is applied through the rule engine (`ack`/`err`);
/// anything else earns an `err`. EOF, a broken frame, or cancellation ends
/// the session.
pub async fn run_session<S>(
    stream: S,
    peer_ip: String,
    rules: Arc<RuleEngine>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = split(stream);
    let mut rules_rx = rules.subscribe();

    let mut last_sent = rules.export_enabled();
    codec::write_message(&mut writer, &Message::Upd(last_sent.clone())).await?;

    // Frames are pulled on a dedicated task so a rule push arriving while a
    // frame is half-read cannot tear it.
    let (frame_tx, mut frames) = mpsc::channel::<Result<Vec<u8>>>(1);
    let reader_task = tokio::spawn(async move {
        loop {
            match codec::read_frame(&mut reader).await {
                Ok(Some(body)) => {
                    if frame_tx.send(Ok(body)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frame_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let outcome = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rules_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = rules.export_enabled();
                    if current != last_sent {
                        debug!(peer = %peer_ip, rules = current.len(), "pushing rule update");
                        codec::write_message(&mut writer, &Message::Upd(current.clone())).await?;
                        last_sent = current;
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        None => break,
                        Some(Err(e)) => return Err(e),
                        Some(Ok(body)) => {
                            let reply = handle_frame(&rules, &peer_ip, &body);
                            codec::write_message(&mut writer, &reply).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    reader_task.abort();
    outcome
}

fn handle_frame(rules: &RuleEngine, peer_ip: &str, body: &[u8]) -> Message {
    match serde_json::from_slice::<Message>(body) {
        Ok(Message::Data(entries)) => {
            for (name, rows) in entries {
                debug!(peer = %peer_ip, rule = %name, "processing telemetry");
                if let Err(e) = rules.apply(peer_ip, &name, rows.into_rows()) {
                    return Message::Err(e.to_string());
                }
            }
            Message::Ack
        }
        Ok(_) => Message::Err("unexpected message type".to_string()),
        Err(e) => Message::Err(format!("malformed message: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{self, Tlp};
    use crate::registry::AgentRegistry;
    use crate::rules::{Rule, RuleType};
    use crate::store::CtiStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<CtiStore>,
        rules: Arc<RuleEngine>,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CtiStore::new());
        let registry = Arc::new(AgentRegistry::new());
        let (_, id) = store.create(object::identity("web01"), "server", Tlp::Red, 0);
        registry.create("web01", &id, "10.0.0.5", None);

        let mut table = BTreeMap::new();
        table.insert(
            "addrs".to_string(),
            Rule {
                target: RuleType::Ipv4Addr,
                query: "select * from listening_ports".into(),
                relationship: "reported".into(),
                threshold: 30.0,
                enabled: true,
            },
        );
        let rules = Arc::new(RuleEngine::new(table, store.clone(), registry));
        Fixture {
            store,
            rules,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_session_sends_initial_upd() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));

        let Some(Message::Upd(rules)) = codec::read_message(&mut client).await.unwrap() else {
            panic!("expected initial upd");
        };
        assert!(rules.contains_key("addrs"));

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_acks_data_and_stores_rows() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));

        // Initial upd.
        codec::read_message(&mut client).await.unwrap().unwrap();

        let data: BTreeMap<String, codec::RowSet> = serde_json::from_value(json!({
            "addrs": [{"value": "203.0.113.9"}]
        }))
        .unwrap();
        codec::write_message(&mut client, &Message::Data(data))
            .await
            .unwrap();

        let Some(Message::Ack) = codec::read_message(&mut client).await.unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(fx.store.all_of_type("ipv4-addr").len(), 1);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_err_on_unknown_rule_then_continues() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));
        codec::read_message(&mut client).await.unwrap().unwrap();

        let data: BTreeMap<String, codec::RowSet> =
            serde_json::from_value(json!({"nope": [{"value": "1.2.3.4"}]})).unwrap();
        codec::write_message(&mut client, &Message::Data(data))
            .await
            .unwrap();
        let Some(Message::Err(msg)) = codec::read_message(&mut client).await.unwrap() else {
            panic!("expected err");
        };
        assert!(msg.contains("unknown rule"));

        // The session survives and still answers.
        let data: BTreeMap<String, codec::RowSet> =
            serde_json::from_value(json!({"addrs": [{"value": "1.2.3.4"}]})).unwrap();
        codec::write_message(&mut client, &Message::Data(data))
            .await
            .unwrap();
        assert!(matches!(
            codec::read_message(&mut client).await.unwrap(),
            Some(Message::Ack)
        ));

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_err_on_unexpected_type() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));
        codec::read_message(&mut client).await.unwrap().unwrap();

        codec::write_message(&mut client, &Message::Ack).await.unwrap();
        assert!(matches!(
            codec::read_message(&mut client).await.unwrap(),
            Some(Message::Err(_))
        ));

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_pushes_upd_on_rule_change() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));
        codec::read_message(&mut client).await.unwrap().unwrap();

        // Disabling the only rule empties the enabled set and triggers a push.
        fx.rules.update_thresholds(&std::collections::HashMap::new());
        let Some(Message::Upd(rules)) = codec::read_message(&mut client).await.unwrap() else {
            panic!("expected pushed upd");
        };
        assert!(rules.is_empty());

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_exits_on_cancellation() {
        let fx = fixture();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server_io,
            "10.0.0.5".to_string(),
            fx.rules.clone(),
            fx.cancel.clone(),
        ));
        codec::read_message(&mut client).await.unwrap().unwrap();

        fx.cancel.cancel();
        session.await.unwrap().unwrap();
    }
}
