//! Shared helpers: an in-memory tunnel client speaking the real protocol
#![allow(dead_code)]

use std::time::Duration;

use burrow_control::{ControlPlane, ControlTuning, EncryptMode, ServerConfig};
use burrow_mux::{MuxConfig, MuxSession};
use burrow_proto::{read_message, write_message, Message, PIPE_NONCE_LEN};
use tokio::io::DuplexStream;
use uuid::Uuid;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        listen_ip: "127.0.0.1".parse().unwrap(),
        server_domain: "test.local".to_string(),
        http_port: 8080,
        https_port: 8443,
        encrypt_mode: EncryptMode::None,
        auth_enabled: false,
        notify_enabled: false,
        tuning: ControlTuning::default(),
    }
}

/// Poll a condition until it holds or the test times out
pub async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// In-memory client on the other end of a control connection
pub struct TestClient {
    pub plane: ControlPlane,
    pub client_id: Uuid,
    pub conn: DuplexStream,
}

impl TestClient {
    /// Run the control handshake over an in-memory connection
    pub async fn connect(plane: &ControlPlane) -> Self {
        let (mut conn, server_end) = tokio::io::duplex(256 * 1024);
        let server_plane = plane.clone();
        tokio::spawn(async move {
            let _ = server_plane.handle_connection(server_end).await;
        });

        write_message(
            &mut conn,
            &Message::ControlClientHello {
                auth_token: None,
                cipher_key: None,
            },
        )
        .await
        .unwrap();

        let reply = read_message(&mut conn).await.unwrap();
        let Message::ControlServerHello { client_id, .. } = reply else {
            panic!("expected server hello, got {reply:?}");
        };

        // The hello is written before the registry insert; wait until the
        // session is visible so pipes can attach right away
        let registry = plane.registry();
        wait_for(|| registry.control(&client_id).is_some(), "control registration").await;

        Self {
            plane: plane.clone(),
            client_id,
            conn,
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        write_message(&mut self.conn, msg).await.unwrap();
    }

    /// Next non-keepalive message from the server
    pub async fn next_message(&mut self) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), read_message(&mut self.conn))
                .await
                .expect("timed out waiting for a control message")
                .expect("control connection failed");
            match msg {
                Message::Ping | Message::Pong => continue,
                other => return other,
            }
        }
    }

    /// Assert nothing but keepalives arrives within `window`
    pub async fn expect_no_message(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.next_message()).await;
        if let Ok(msg) = result {
            panic!("expected silence, got {msg:?}");
        }
    }

    /// Open a pipe connection and hand back the client-side mux session
    pub async fn open_pipe(&self) -> MuxSession {
        let (mut pipe_conn, server_end) = tokio::io::duplex(256 * 1024);
        let server_plane = self.plane.clone();
        tokio::spawn(async move {
            let _ = server_plane.handle_connection(server_end).await;
        });

        write_message(
            &mut pipe_conn,
            &Message::PipeClientHello {
                client_id: self.client_id,
                nonce: [9u8; PIPE_NONCE_LEN],
            },
        )
        .await
        .unwrap();

        MuxSession::server(pipe_conn, MuxConfig::default())
    }

    /// Open a pipe and echo every stream the server opens on it
    pub async fn open_echo_pipe(&self) -> MuxSession {
        let session = self.open_pipe().await;
        spawn_echo(session.clone());
        session
    }
}

/// Echo service: answers every accepted stream by mirroring its bytes
pub fn spawn_echo(session: MuxSession) {
    tokio::spawn(async move {
        while let Some(stream) = session.accept_stream().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
}
