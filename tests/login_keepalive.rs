use std::time::Duration;

use bytes::Bytes;
use resilient_socket::testing::{MockConnection, MockServer, MockTransport};
use resilient_socket::{
    ClientOptions, ConnectionState, Frame, Keepalive, LoginHandshake, LoginReply,
    PersistentClient, PersistentClientArgs, SocketError,
};
use tokio::time::Instant;

type MockClient = PersistentClient<MockTransport>;

fn irc_login() -> LoginHandshake {
    LoginHandshake::new(
        ["PASS oauth:secret", "NICK ferris"],
        |frame: &Frame| -> Option<LoginReply> {
            let line = frame.as_str()?;
            if line.contains(" 001 ") {
                Some(LoginReply::Accepted)
            } else if line.contains("Login authentication failed") {
                Some(LoginReply::Rejected(line.to_string()))
            } else {
                None
            }
        },
    )
}

fn irc_keepalive() -> Keepalive {
    Keepalive::new(
        || Bytes::from_static(b"PING :keepalive"),
        |frame: &Frame| frame.as_bytes() == b"PONG :keepalive",
    )
}

fn client(options: ClientOptions, keepalive: Option<Keepalive>) -> (MockClient, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    let mut args = PersistentClientArgs::new(transport);
    args.options = options;
    args.login = Some(irc_login());
    args.keepalive = keepalive;
    (PersistentClient::new(args).unwrap(), server)
}

async fn expect_credentials(conn: &mut MockConnection) {
    assert_eq!(
        conn.recv_outbound().await.unwrap(),
        Bytes::from_static(b"PASS oauth:secret")
    );
    assert_eq!(
        conn.recv_outbound().await.unwrap(),
        Bytes::from_static(b"NICK ferris")
    );
}

#[tokio::test(start_paused = true)]
async fn login_succeeds_on_welcome() {
    let (client, mut server) = client(ClientOptions::default(), None);
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    let mut conn = server.accept().await.unwrap();
    expect_credentials(&mut conn).await;
    conn.send_line(":tmi.twitch.tv NOTICE * :please wait").unwrap();
    conn.send_line(":tmi.twitch.tv 001 ferris :Welcome, GLHF!").unwrap();

    connecting.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Open);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_login_fails_without_reconnecting() {
    let (client, mut server) = client(ClientOptions::default(), None);
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    let mut conn = server.accept().await.unwrap();
    expect_credentials(&mut conn).await;
    conn.send_line(":tmi.twitch.tv NOTICE * :Login authentication failed")
        .unwrap();

    let err = connecting.await.unwrap().unwrap_err();
    assert!(!err.is_timeout());
    let SocketError::AuthenticationFailed { message } = &err else {
        panic!("expected authentication failure, got {err}");
    };
    assert!(message.contains("Login authentication failed"));
    assert_eq!(client.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_login() {
    let options = ClientOptions {
        login_timeout: Duration::from_secs(3),
        ..ClientOptions::default()
    };
    let (client, mut server) = client(options, None);
    let start = Instant::now();
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    let mut conn = server.accept().await.unwrap();
    expect_credentials(&mut conn).await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "{err}");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn missed_keepalive_echo_forces_a_reconnect() {
    let options = ClientOptions {
        ping_interval: Duration::from_secs(10),
        pong_timeout: Duration::from_secs(2),
        ..ClientOptions::default()
    };
    let (client, mut server) = client(options, Some(irc_keepalive()));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mut conn = server.accept().await.unwrap();
    expect_credentials(&mut conn).await;
    conn.send_line(":tmi.twitch.tv 001 ferris :Welcome").unwrap();
    connecting.await.unwrap().unwrap();

    let ping = conn.recv_outbound_timeout(Duration::from_secs(11)).await;
    assert_eq!(ping, Some(Bytes::from_static(b"PING :keepalive")));
    conn.send_line("PONG :keepalive").unwrap();

    let ping = conn.recv_outbound_timeout(Duration::from_secs(11)).await;
    assert_eq!(ping, Some(Bytes::from_static(b"PING :keepalive")));
    assert_eq!(client.stats().rtt_samples, 1);

    // Stay silent; the client gives up on this socket and logs in again on a new one.
    let mut next = server
        .accept_timeout(Duration::from_secs(3))
        .await
        .expect("client reconnects after the missed echo");
    expect_credentials(&mut next).await;
    next.send_line(":tmi.twitch.tv 001 ferris :Welcome back").unwrap();

    let mut reconnected = false;
    for _ in 0..100 {
        if client.stats().reconnects == 1 {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(reconnected);

    let stats = client.stats();
    assert_eq!(stats.unexpected_disconnects, 1);
    assert!(stats.recent_disconnects[0].contains("keepalive"));
    assert_eq!(client.state(), ConnectionState::Open);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_tears_down_and_allows_retry() {
    let (client, mut server) = client(ClientOptions::default(), None);

    let attempt = tokio::time::timeout(Duration::from_millis(500), client.connect()).await;
    assert!(attempt.is_err(), "login cannot finish without a welcome");

    let mut abandoned = server.accept().await.unwrap();
    expect_credentials(&mut abandoned).await;
    assert!(abandoned.recv_outbound().await.is_none());

    let start = Instant::now();
    while client.state() != ConnectionState::Closed {
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", client.state());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // A torn-down setup is not an unexpected close.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.connect_attempts(), 1);
    assert_eq!(client.stats().unexpected_disconnects, 0);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mut conn = server.accept().await.unwrap();
    expect_credentials(&mut conn).await;
    conn.send_line(":tmi.twitch.tv 001 ferris :Welcome").unwrap();
    connecting.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.connect_attempts(), 2);
    client.disconnect().await;
}
