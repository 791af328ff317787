//! Full channel stack: TLS handshake, framing, large payloads.

use crate::harness::{tls, AgentClient, World};
use cti_core::channel::Channel;
use cti_core::codec::MAX_FRAME_LEN;
use cti_core::rules::RuleType;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

async fn start_channel(world: &World) -> (std::net::SocketAddr, tls::TestCert, tokio::task::JoinHandle<cti_core::Result<()>>) {
    let cert = tls::self_signed().unwrap();
    let acceptor =
        cti_core::channel::load_tls_acceptor(cert.cert_file.path(), cert.key_file.path()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let channel = Channel::new(addr, acceptor, world.rules.clone());
    let cancel = world.cancel.clone();
    let server = tokio::spawn(async move { channel.serve_on(listener, cancel).await });
    (addr, cert, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ten_megabyte_frame_over_tls() {
    let world = World::builder()
        .agent("web01", "127.0.0.1")
        .rule("procs", RuleType::Process, 30.0, true)
        .build();
    let (addr, cert, server) = start_channel(&world).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let stream = cert.connector.connect(tls::server_name(), tcp).await.unwrap();
    let mut client = AgentClient::over(stream);

    let rules = client.expect_upd().await.unwrap();
    assert!(rules.contains_key("procs"));

    // One row whose command line alone is 10 MB; the frame crosses the
    // socket in many TCP segments and must reassemble exactly.
    let long_cmdline = "a".repeat(10 * 1024 * 1024);
    client
        .send_data(
            "procs",
            json!([{"pid": "7", "path": "/tmp", "cmdline": long_cmdline}]),
        )
        .await
        .unwrap();
    client.expect_ack().await.unwrap();

    let procs = world.store.all_of_type("process");
    assert_eq!(procs.len(), 1);
    assert_eq!(
        procs[0]["command_line"].as_str().unwrap().len(),
        10 * 1024 * 1024
    );

    world.cancel.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_ends_session() {
    let world = World::builder()
        .agent("web01", "127.0.0.1")
        .rule("procs", RuleType::Process, 30.0, true)
        .build();
    let (addr, cert, server) = start_channel(&world).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = cert.connector.connect(tls::server_name(), tcp).await.unwrap();
    {
        let mut client = AgentClient::over(&mut stream);
        client.expect_upd().await.unwrap();
    }

    // Announce a frame above the cap; the server refuses and hangs up.
    let len = (MAX_FRAME_LEN as u32) + 1;
    stream.write_all(&len.to_be_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut client = AgentClient::over(stream);
    let end = client.recv().await;
    assert!(matches!(end, Ok(None) | Err(_)), "session should be over");

    world.cancel.cancel();
    server.await.unwrap().unwrap();
}
