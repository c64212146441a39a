//! Connection handshakes
//!
//! Every inbound connection identifies itself with its first frame: a
//! `ControlClientHello` starts a new control session, a `PipeClientHello`
//! attaches the connection as a pipe to an existing one.

use std::sync::Arc;

use burrow_crypto::{derive_session_key, CipherStream, CryptoError, KeyPair, Role};
use burrow_mux::{Conn, MuxConfig, MuxSession};
use burrow_proto::{self as proto, CodecError, Message};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EncryptMode, ServerConfig};
use crate::control::Control;
use crate::hooks::{AllowAllAuth, AuthProvider, HookError, MemberNotifier, NoopNotifier};
use crate::registry::Registry;

/// Handshake failures; fatal to the connection being handshaken only
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unexpected message type")]
    UnexpectedMessage,

    #[error("authentication failed")]
    AuthFailed,

    #[error("auth hook error: {0}")]
    Hook(#[from] HookError),

    #[error("client hello carries no cipher key")]
    MissingCipherKey,

    #[error("unknown client id: {0}")]
    UnknownClient(Uuid),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Entry point tying the registries, config, and collaborator hooks
/// together; one per server process.
#[derive(Clone)]
pub struct ControlPlane {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    auth: Arc<dyn AuthProvider>,
    notifier: Arc<dyn MemberNotifier>,
}

impl ControlPlane {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(Registry::new()),
            auth: Arc::new(AllowAllAuth),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_auth_provider(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn MemberNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Run the first-frame dispatch for one inbound connection
    pub async fn handle_connection<C>(&self, conn: C) -> Result<(), HandshakeError>
    where
        C: Conn + 'static,
    {
        let mut conn: Box<dyn Conn> = Box::new(conn);
        let first = proto::read_message(&mut conn).await?;
        match first {
            Message::ControlClientHello {
                auth_token,
                cipher_key,
            } => self.control_handshake(conn, auth_token, cipher_key).await,
            Message::PipeClientHello { client_id, nonce } => {
                self.pipe_handshake(conn, client_id, nonce).await
            }
            _ => Err(HandshakeError::UnexpectedMessage),
        }
    }

    /// Control handshake: authenticate, agree on a pre-master secret,
    /// assign a client id, and start the session.
    async fn control_handshake(
        &self,
        mut conn: Box<dyn Conn>,
        auth_token: Option<String>,
        cipher_key: Option<Vec<u8>>,
    ) -> Result<(), HandshakeError> {
        if self.config.auth_enabled {
            let token = auth_token.unwrap_or_default();
            if !self.auth.auth(&token).await? {
                warn!("control handshake rejected: bad token");
                return Err(HandshakeError::AuthFailed);
            }
        }

        let (pre_master, server_key) = if self.config.encrypt_mode != EncryptMode::None {
            let client_key = cipher_key.ok_or(HandshakeError::MissingCipherKey)?;
            let keypair = KeyPair::generate()?;
            let public = keypair.public_key().to_vec();
            let pre_master = keypair.agree(&client_key)?;
            (Some(pre_master), Some(public))
        } else {
            (None, None)
        };

        let client_id = Uuid::new_v4();
        proto::write_message(
            &mut conn,
            &Message::ControlServerHello {
                client_id,
                cipher_key: server_key,
            },
        )
        .await?;

        Control::spawn(
            conn,
            client_id,
            pre_master,
            self.config.clone(),
            self.registry.clone(),
            self.notifier.clone(),
        );
        info!(client_id = %client_id, "control session established");
        Ok(())
    }

    /// Pipe handshake: bind a fresh pipe connection to its owning control.
    /// A hello naming an unknown client closes the connection without
    /// touching any state.
    async fn pipe_handshake(
        &self,
        conn: Box<dyn Conn>,
        client_id: Uuid,
        nonce: [u8; proto::PIPE_NONCE_LEN],
    ) -> Result<(), HandshakeError> {
        let Some(control) = self.registry.control(&client_id) else {
            warn!(client_id = %client_id, "pipe hello for unknown client");
            return Err(HandshakeError::UnknownClient(client_id));
        };

        let mux_config = MuxConfig {
            max_receive_buffer: self.config.tuning.mux_receive_buffer,
            ..MuxConfig::default()
        };

        // The pipe is initiated by the remote client, but stream opens
        // flow server → client, so the server speaks the mux client role.
        let session = if control.encrypt_mode() != EncryptMode::None {
            let pre_master = control.pre_master().ok_or(HandshakeError::MissingCipherKey)?;
            let key = derive_session_key(pre_master, client_id.as_bytes(), &nonce)?;
            let cipher = CipherStream::new(conn, &key, Role::Server)?;
            MuxSession::client(cipher, mux_config)
        } else {
            MuxSession::client(conn, mux_config)
        };

        control.put_pipe(session).await;
        debug!(client_id = %client_id, "pipe attached");
        Ok(())
    }
}
