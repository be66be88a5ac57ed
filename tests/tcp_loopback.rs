use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use resilient_socket::{
    ConnectionState, Frame, PersistentClient, PersistentClientArgs, TcpTransport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn read_until(stream: &mut tokio::net::TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    while !received.windows(needle.len()).any(|window| window == needle) {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending {needle:?}");
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[tokio::test]
async fn frames_cross_a_real_socket_in_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // One frame split across writes, with the delimiter itself split.
        stream.write_all(b":srv PING :abc\r").await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"\n:srv NOTICE * :hello\r\n").await.unwrap();

        let wire = read_until(&mut stream, b"PRIVMSG #rust :hi\r\n").await;
        let _ = received_tx.send(wire);

        // Hold the socket open until the client hangs up.
        let mut buf = [0u8; 64];
        while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let client = PersistentClient::new(PersistentClientArgs::new(TcpTransport::new(
        "127.0.0.1",
        port,
    )))
    .unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let frames = Arc::clone(&frames);
        client
            .raw_message_received()
            .subscribe(move |frame: Frame| {
                frames.lock().push(frame);
                std::future::ready(Ok(()))
            })
    };

    client.connect().await.unwrap();
    assert_eq!(client.endpoint(), format!("tcp://127.0.0.1:{port}"));

    for _ in 0..200 {
        if frames.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        *frames.lock(),
        vec![
            Frame::from_static(":srv PING :abc"),
            Frame::from_static(":srv NOTICE * :hello")
        ]
    );

    client.send_raw("PRIVMSG #rust :hi").await.unwrap();
    let wire = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wire, b"PRIVMSG #rust :hi\r\n");

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    server.await.unwrap();
}
