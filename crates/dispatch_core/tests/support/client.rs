#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use dispatch_core::gateway::ServerEvent;

use super::WAIT;

/// Line-oriented session client speaking the gateway protocol.
pub struct SessionClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SessionClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to gateway");
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    /// Connect and authenticate, consuming the `authenticated` greeting.
    pub async fn authenticated(addr: SocketAddr, token: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send("authenticate", json!({ "token": token })).await;
        match client.next_event().await {
            Some(ServerEvent::Authenticated(_)) => client,
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let mut line = json!({ "event": event, "data": data }).to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write event");
    }

    /// Write `line` verbatim, newline appended.
    pub async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write line");
    }

    /// Next server event, or `None` once the gateway closed the connection.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("gateway answered in time")
            .ok()??;
        Some(serde_json::from_str(&line).expect("server event"))
    }

    /// True when nothing arrives within `window`.
    pub async fn stays_quiet(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.lines.next_line())
            .await
            .is_err()
    }
}
