//! End-to-end tests over real sockets.
//!
//! The routing loop is `!Send`, so the server runs on a `LocalSet` next to
//! the test body.

use std::time::Duration;

use skyrelay_server::{Server, ServerRuntimeConfig};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::LocalSet,
    time::timeout,
};

const DEADLINE: Duration = Duration::from_secs(10);

async fn expect(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    timeout(DEADLINE, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), expected);
}

fn config(drivers: Vec<String>) -> ServerRuntimeConfig {
    ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        unix_socket: None,
        drivers,
        ..ServerRuntimeConfig::default()
    }
}

#[tokio::test]
async fn client_traffic_through_remote_link() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();

    let server = Server::bind(config(vec![format!("Cam@127.0.0.1:{port}")])).await.unwrap();
    let addr = server.local_addr().unwrap();

    let local = LocalSet::new();
    local.spawn_local(server.run());
    local
        .run_until(async move {
            let (mut link, _) = timeout(DEADLINE, upstream.accept()).await.unwrap().unwrap();
            expect(&mut link, "<getProperties device='Cam' version='1.7'/>").await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"<getProperties version='1.7'/>\n").await.unwrap();
            expect(&mut link, "<getProperties version='1.7'/>").await;

            let update = "<setNumberVector device='Cam' name='CCD_TEMPERATURE'>\
                          <oneNumber name='CCD_TEMPERATURE_VALUE'>-5</oneNumber></setNumberVector>";
            link.write_all(update.as_bytes()).await.unwrap();
            expect(&mut client, update).await;

            client.write_all(b"<pingRequest uid='1'/>").await.unwrap();
            expect(&mut client, "<pingReply uid='1'/>").await;

            // Losing the link announces the device as gone and reconnects
            drop(link);
            expect(&mut client, "<delProperty device='Cam'/>").await;
            let (mut relinked, _) = timeout(DEADLINE, upstream.accept()).await.unwrap().unwrap();
            expect(&mut relinked, "<getProperties device='Cam' version='1.7'/>").await;
        })
        .await;
}

#[tokio::test]
async fn malformed_client_is_disconnected() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();

    let server = Server::bind(config(vec![format!("@127.0.0.1:{port}")])).await.unwrap();
    let addr = server.local_addr().unwrap();

    let local = LocalSet::new();
    local.spawn_local(server.run());
    local
        .run_until(async move {
            let (mut link, _) = timeout(DEADLINE, upstream.accept()).await.unwrap().unwrap();
            expect(&mut link, "<getProperties device='*' version='1.7'/>").await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"this is not xml").await.unwrap();

            let mut buf = [0u8; 16];
            let n = timeout(DEADLINE, client.read(&mut buf)).await.unwrap().unwrap_or(0);
            assert_eq!(n, 0, "broker should close the connection");
        })
        .await;
}

#[tokio::test]
async fn bind_requires_a_driver_or_fifo() {
    let result = Server::bind(config(Vec::new())).await;
    assert!(result.is_err());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn local_socket_client_with_subprocess_driver() {
    use std::os::linux::net::SocketAddrExt;

    let name = format!("skyrelay-test-{}", std::process::id());
    let server = Server::bind(ServerRuntimeConfig {
        unix_socket: Some(name.clone().into()),
        ..config(vec!["cat".to_string()])
    })
    .await
    .unwrap();

    let local = LocalSet::new();
    local.spawn_local(server.run());
    local
        .run_until(async move {
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
            let stream = std::os::unix::net::UnixStream::connect_addr(&addr).unwrap();
            stream.set_nonblocking(true).unwrap();
            let mut client = tokio::net::UnixStream::from_std(stream).unwrap();

            client.write_all(b"<pingRequest uid='9'/>").await.unwrap();
            let expected = b"<pingReply uid='9'/>";
            let mut buf = vec![0u8; expected.len()];
            timeout(DEADLINE, client.read_exact(&mut buf)).await.unwrap().unwrap();
            assert_eq!(buf, expected);
        })
        .await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn control_start_of_missing_program_keeps_serving() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("control");
    let made = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
    assert!(made.success());

    let server = Server::bind(ServerRuntimeConfig { fifo: Some(fifo.clone()), ..config(Vec::new()) }).await.unwrap();
    let addr = server.local_addr().unwrap();

    let local = LocalSet::new();
    let running = local.spawn_local(server.run());
    local
        .run_until(async move {
            // The server holds both ends open, so this open does not block
            let mut control = std::fs::OpenOptions::new().write(true).open(&fifo).unwrap();
            control.write_all(b"start skyrelay-no-such-driver\n").unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;

            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"<pingRequest uid='5'/>").await.unwrap();
            expect(&mut client, "<pingReply uid='5'/>").await;
            assert!(!running.is_finished());
        })
        .await;
}
