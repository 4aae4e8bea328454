//! End-to-end tests against a real server on a loopback port.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use wsraw::{Config, Frame, Message, Router, Server};

const CLIENT_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_echo_server() -> TestServer {
    let router = Router::new().websocket("/ws", |ws, _req| async move {
        let (sender, mut receiver) = ws.split();
        while let Ok(Some(msg)) = receiver.recv().await {
            if let Message::Text(text) = msg {
                let _ = sender.send(Message::Text(text)).await;
            }
        }
    });

    let server = Server::bind("127.0.0.1:0", router, Config::server())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        shutdown: Some(tx),
    }
}

fn upgrade_request(path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {RFC_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Read the response head one byte at a time so frame bytes stay unread.
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = stream.read_u8().await.unwrap();
        head.push(byte);
    }
    String::from_utf8(head).unwrap()
}

async fn connect(server: &TestServer) -> TcpStream {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(upgrade_request("/ws").as_bytes())
        .await
        .unwrap();
    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 "), "unexpected response: {head}");
    stream
}

fn client_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    frame.write(&mut buf, Some(CLIENT_MASK));
    buf.to_vec()
}

async fn rejection(request: &str) -> String {
    let server = start_echo_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_upgrade_returns_exact_101() {
    let server = start_echo_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(upgrade_request("/ws").as_bytes())
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert_eq!(
        head,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
    );
}

#[tokio::test]
async fn test_missing_key_is_400() {
    let response = rejection(
        "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn test_missing_upgrade_is_400() {
    let response = rejection(&format!(
        "GET /ws HTTP/1.1\r\nHost: localhost\r\nSec-WebSocket-Key: {RFC_KEY}\r\n\r\n"
    ))
    .await;
    assert!(response.starts_with("HTTP/1.1 400 "), "{response}");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let response = rejection(&upgrade_request("/nope")).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
}

#[tokio::test]
async fn test_post_is_405() {
    let request = upgrade_request("/ws").replacen("GET", "POST", 1);
    let response = rejection(&request).await;
    assert!(response.starts_with("HTTP/1.1 405 "), "{response}");
}

#[tokio::test]
async fn test_malformed_head_is_400() {
    let response = rejection("NONSENSE\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 "), "{response}");
}

#[tokio::test]
async fn test_unmasked_frame_gets_protocol_error_close() {
    let server = start_echo_server().await;
    let mut stream = connect(&server).await;

    stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    let mut close = [0u8; 4];
    stream.read_exact(&mut close).await.unwrap();
    assert_eq!(close, [0x88, 0x02, 0x03, 0xea]);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_masked_text_is_echoed() {
    let server = start_echo_server().await;
    let mut stream = connect(&server).await;

    let frame = client_frame(&Frame::text("hi"));
    assert_eq!(&frame[..2], &[0x81, 0x82]);
    stream.write_all(&frame).await.unwrap();

    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x81, 0x02, b'h', b'i']);
}

#[tokio::test]
async fn test_frame_in_same_packet_as_head() {
    let server = start_echo_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut bytes = upgrade_request("/ws").into_bytes();
    bytes.extend(client_frame(&Frame::text("hi")));
    stream.write_all(&bytes).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 "));

    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x81, 0x02, b'h', b'i']);
}

#[tokio::test]
async fn test_ping_gets_single_pong() {
    let server = start_echo_server().await;
    let mut stream = connect(&server).await;

    stream
        .write_all(&client_frame(&Frame::ping("abc")))
        .await
        .unwrap();
    stream
        .write_all(&client_frame(&Frame::text("hi")))
        .await
        .unwrap();

    // The pong precedes the echo, and nothing else sits between them.
    let mut pong = [0u8; 5];
    stream.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong, [0x8a, 0x03, b'a', b'b', b'c']);

    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x81, 0x02, b'h', b'i']);
}

#[tokio::test]
async fn test_client_initiated_close() {
    let server = start_echo_server().await;
    let mut stream = connect(&server).await;

    let close = wsraw::CloseFrame::new(wsraw::CloseCode::Normal, "");
    stream
        .write_all(&client_frame(&Frame::close(Some(&close))))
        .await
        .unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xe8]);
}
