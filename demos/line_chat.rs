//! Connects to a line-based chat server, logs in, joins a channel and prints every line.
//!
//! ```text
//! CHAT_HOST=irc.chat.twitch.tv CHAT_PORT=6697 CHAT_TLS=1 CHAT_NICK=justinfan123 \
//!     CHAT_CHANNEL=#rust cargo run --example line_chat
//! ```

use std::time::Duration;

use bytes::Bytes;
use resilient_socket::{
    ClientHooks, ClientOptions, Frame, Keepalive, LoginHandshake, LoginReply, PersistentClient,
    PersistentClientArgs, RateLimitConfig, SlidingWindowLimiter, TcpTransport,
};
use tracing_subscriber::EnvFilter;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn classify_login(frame: &Frame) -> Option<LoginReply> {
    let line = frame.as_str()?;
    if line.split(' ').nth(1) == Some("001") {
        Some(LoginReply::Accepted)
    } else if line.contains("NOTICE * :") {
        Some(LoginReply::Rejected(line.to_string()))
    } else {
        None
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let host = env("CHAT_HOST", "irc.chat.twitch.tv");
    let port: u16 = env("CHAT_PORT", "6697").parse()?;
    let nick = env("CHAT_NICK", "justinfan12345");
    let channel = env("CHAT_CHANNEL", "#rust");
    let transport = if env("CHAT_TLS", "1") == "1" {
        TcpTransport::secure(host, port)
    } else {
        TcpTransport::new(host, port)
    };

    let mut args = PersistentClientArgs::new(transport);
    args.options = ClientOptions {
        ping_interval: Duration::from_secs(60),
        pong_timeout: Duration::from_secs(10),
        ..ClientOptions::default()
    };
    args.login = Some(LoginHandshake::new(
        ["PASS SCHMOOPIIE".to_string(), format!("NICK {nick}")],
        classify_login,
    ));
    args.keepalive = Some(Keepalive::new(
        || Bytes::from_static(b"PING :line_chat"),
        |frame: &Frame| frame.as_bytes().ends_with(b":line_chat"),
    ));
    args.hooks = ClientHooks::<TcpTransport>::default()
        .on_connect(move |client| {
            let join = format!("JOIN {channel}");
            async move { client.send_raw(join).await }
        })
        .on_raw_message(|frame| async move {
            println!("{frame}");
            Ok(())
        });

    let client = PersistentClient::new(args)?;

    // Answer server pings so the server keeps the session open.
    let _pong = {
        let sender = client.clone();
        client.raw_message_received().subscribe(move |frame: Frame| {
            let client = sender.clone();
            async move {
                if let Some(token) = frame.as_bytes().strip_prefix(b"PING ") {
                    let mut reply = b"PONG ".to_vec();
                    reply.extend_from_slice(token);
                    client.send_raw(reply).await?;
                }
                Ok(())
            }
        })
    };

    client.connect().await?;
    tracing::info!(endpoint = %client.endpoint(), "connected, press Ctrl-C to quit");

    let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(20, Duration::from_secs(30)))?;
    let channel = env("CHAT_CHANNEL", "#rust");
    for greeting in ["hello", "from", "resilient-socket"] {
        client
            .send_limited(&limiter, format!("PRIVMSG {channel} :{greeting}"))
            .await?;
    }

    tokio::signal::ctrl_c().await?;
    client.disconnect().await;
    let stats = client.stats();
    tracing::info!(
        received = stats.messages_received,
        sent = stats.messages_sent,
        reconnects = stats.reconnects,
        "bye"
    );
    Ok(())
}
