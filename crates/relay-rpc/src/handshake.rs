//! Mutual shared-secret handshake.
//!
//! ```text
//! initiator                                   acceptor
//!   auth:login {client_id, client_nonce, digest}  ->
//!                                             <-  auth:success {digest, heartbeat_interval, info}
//!                                                 (or auth:fail {reason})
//!   auth:success {info}                       ->
//!   (or auth:fail {reason})
//! ```
//!
//! - `digest = HMAC-SHA256(secret, "{client_id}:{nonce}")`
//! - acceptor digest = `HMAC-SHA256(secret, "{client_id}:{nonce}:{digest}")`
//!
//! Digests travel as lowercase hex and are verified with `ring::hmac::verify`
//! (constant time). The whole exchange runs under one deadline.

use crate::errors::{ConnectionError, HandshakeError};
use crate::stream::PacketStream;

use common::secret::{ExposeSecret, SecretString};
use relay_protocol::packet::{AuthFail, ClientAuthSuccess, LoginPayload, ServerAuthSuccess};
use relay_protocol::{op, Packet};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Default deadline for the whole exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Nonce length in bytes (hex encoded on the wire).
const NONCE_LEN: usize = 32;

/// Reasons sent in `auth:fail`.
pub const REASON_UNKNOWN_CLIENT: &str = "Unknown Client ID";
pub const REASON_BAD_SECRET: &str = "Bad Secret";
pub const REASON_SERVER_MISMATCH: &str = "Server hash mismatch";

/// Identity presented by the initiator.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub secret: SecretString,
}

/// Secrets known to the acceptor, keyed by client id.
pub trait CredentialStore: Send + Sync {
    fn secret_for(&self, client_id: &str) -> Option<&SecretString>;
}

impl CredentialStore for HashMap<String, SecretString> {
    fn secret_for(&self, client_id: &str) -> Option<&SecretString> {
        self.get(client_id)
    }
}

/// Result of a successful initiator handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Ping interval chosen by the acceptor.
    pub heartbeat_interval: Duration,
    /// Acceptor capability info.
    pub remote_info: Value,
}

/// Result of a successful acceptor handshake.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub client_id: String,
    /// Initiator capability info.
    pub remote_info: Value,
}

fn sign(secret: &SecretString, message: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes());
    hex::encode(hmac::sign(&key, message.as_bytes()).as_ref())
}

fn verify(secret: &SecretString, message: &str, digest_hex: &str) -> bool {
    let Ok(provided) = hex::decode(digest_hex) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes());
    hmac::verify(&key, message.as_bytes(), &provided).is_ok()
}

fn generate_nonce() -> Result<String, HandshakeError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; NONCE_LEN];
    rng.fill(&mut bytes)
        .map_err(|_| HandshakeError::Crypto("nonce generation failed".to_string()))?;
    Ok(hex::encode(bytes))
}

async fn send<S, T>(
    stream: &mut PacketStream<S>,
    op: &str,
    payload: &T,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let packet = Packet::from_payload(op, payload).map_err(ConnectionError::from)?;
    stream.write_packet(packet).await?;
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(packet: &Packet) -> Result<T, HandshakeError> {
    packet
        .payload()
        .map_err(|e| HandshakeError::Protocol(ConnectionError::Protocol(e.to_string())))
}

/// Run the initiator side.
pub async fn initiate<S>(
    stream: &mut PacketStream<S>,
    credentials: &ClientCredentials,
    own_info: Value,
    timeout: Duration,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, initiate_inner(stream, credentials, own_info))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn initiate_inner<S>(
    stream: &mut PacketStream<S>,
    credentials: &ClientCredentials,
    own_info: Value,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = credentials.client_id.as_str();
    let nonce = generate_nonce()?;
    let digest = sign(&credentials.secret, &format!("{client_id}:{nonce}"));

    send(
        stream,
        op::AUTH_LOGIN,
        &LoginPayload {
            client_id: client_id.to_string(),
            client_nonce: nonce.clone(),
            digest: digest.clone(),
        },
    )
    .await?;

    let reply = stream
        .read_packet(&[op::AUTH_SUCCESS, op::AUTH_FAIL])
        .await?;
    if reply.op == op::AUTH_FAIL {
        let fail: AuthFail = decode(&reply)?;
        return Err(HandshakeError::Rejected(fail.reason));
    }

    let success: ServerAuthSuccess = decode(&reply)?;
    let expected_message = format!("{client_id}:{nonce}:{digest}");
    if !verify(&credentials.secret, &expected_message, &success.digest) {
        warn!(
            target: "relay.rpc.handshake",
            client_id = %client_id,
            "Acceptor digest mismatch"
        );
        send(
            stream,
            op::AUTH_FAIL,
            &AuthFail {
                reason: REASON_SERVER_MISMATCH.to_string(),
            },
        )
        .await?;
        return Err(HandshakeError::ServerDigestMismatch);
    }

    send(stream, op::AUTH_SUCCESS, &ClientAuthSuccess { info: own_info }).await?;

    debug!(
        target: "relay.rpc.handshake",
        client_id = %client_id,
        heartbeat_interval = success.heartbeat_interval,
        "Handshake complete"
    );

    Ok(Negotiated {
        heartbeat_interval: Duration::from_secs(success.heartbeat_interval.max(1)),
        remote_info: success.info,
    })
}

/// Run the acceptor side.
///
/// `server_info` is invoked once the initiator has proven its identity and
/// produces the capability info sent back in `auth:success` (typically
/// minting a connection id for `client_id`).
pub async fn accept<S, F, Fut>(
    stream: &mut PacketStream<S>,
    credentials: &dyn CredentialStore,
    heartbeat_interval: Duration,
    timeout: Duration,
    server_info: F,
) -> Result<Accepted, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Value>,
{
    tokio::time::timeout(
        timeout,
        accept_inner(stream, credentials, heartbeat_interval, server_info),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

async fn accept_inner<S, F, Fut>(
    stream: &mut PacketStream<S>,
    credentials: &dyn CredentialStore,
    heartbeat_interval: Duration,
    server_info: F,
) -> Result<Accepted, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Value>,
{
    let login_packet = stream.read_packet(&[op::AUTH_LOGIN]).await?;
    let login: LoginPayload = decode(&login_packet)?;
    let client_id = login.client_id;

    let Some(secret) = credentials.secret_for(&client_id) else {
        send(
            stream,
            op::AUTH_FAIL,
            &AuthFail {
                reason: REASON_UNKNOWN_CLIENT.to_string(),
            },
        )
        .await?;
        return Err(HandshakeError::UnknownClient(client_id));
    };

    let client_message = format!("{client_id}:{}", login.client_nonce);
    if !verify(secret, &client_message, &login.digest) {
        send(
            stream,
            op::AUTH_FAIL,
            &AuthFail {
                reason: REASON_BAD_SECRET.to_string(),
            },
        )
        .await?;
        return Err(HandshakeError::BadSecret(client_id));
    }

    let server_digest = sign(
        secret,
        &format!("{client_id}:{}:{}", login.client_nonce, login.digest),
    );
    let info = server_info(client_id.clone()).await;

    send(
        stream,
        op::AUTH_SUCCESS,
        &ServerAuthSuccess {
            digest: server_digest,
            heartbeat_interval: heartbeat_interval.as_secs(),
            info,
        },
    )
    .await?;

    let reply = stream
        .read_packet(&[op::AUTH_SUCCESS, op::AUTH_FAIL])
        .await?;
    if reply.op == op::AUTH_FAIL {
        let fail: AuthFail = decode(&reply)?;
        return Err(HandshakeError::Rejected(fail.reason));
    }

    let success: ClientAuthSuccess = decode(&reply)?;

    debug!(
        target: "relay.rpc.handshake",
        client_id = %client_id,
        "Handshake complete"
    );

    Ok(Accepted {
        client_id,
        remote_info: success.info,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn store() -> HashMap<String, SecretString> {
        HashMap::from([("1512".to_string(), SecretString::from("hello_world"))])
    }

    fn credentials(id: &str, secret: &str) -> ClientCredentials {
        ClientCredentials {
            client_id: id.to_string(),
            secret: SecretString::from(secret),
        }
    }

    fn streams() -> (PacketStream<DuplexStream>, PacketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        (PacketStream::new(a), PacketStream::new(b))
    }

    #[test]
    fn test_sign_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let digest = sign(
            &SecretString::from("key"),
            "The quick brown fox jumps over the lazy dog",
        );
        assert_eq!(
            digest,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify_rejects_single_bit_flip() {
        let secret = SecretString::from("hello_world");
        let digest = sign(&secret, "1512:abcd");
        assert!(verify(&secret, "1512:abcd", &digest));

        let mut bytes = hex::decode(&digest).unwrap();
        *bytes.first_mut().unwrap() ^= 0x01;
        assert!(!verify(&secret, "1512:abcd", &hex::encode(bytes)));
        assert!(!verify(&secret, "1512:abcd", "not hex"));
    }

    #[test]
    fn test_nonce_is_hex_of_32_bytes() {
        let nonce = generate_nonce().unwrap();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, generate_nonce().unwrap());
    }

    #[tokio::test]
    async fn test_handshake_succeeds_with_shared_secret() {
        let (mut client, mut server) = streams();
        let creds = credentials("1512", "hello_world");
        let store = store();

        let (initiated, accepted) = tokio::join!(
            initiate(
                &mut client,
                &creds,
                json!({"max_sessions": 15}),
                DEFAULT_HANDSHAKE_TIMEOUT
            ),
            accept(
                &mut server,
                &store,
                Duration::from_secs(30),
                DEFAULT_HANDSHAKE_TIMEOUT,
                |client_id| async move { json!({"connection_id": format!("{client_id}-0001")}) },
            ),
        );

        let negotiated = initiated.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(negotiated.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(negotiated.remote_info["connection_id"], "1512-0001");
        assert_eq!(accepted.client_id, "1512");
        assert_eq!(accepted.remote_info["max_sessions"], 15);
    }

    #[tokio::test]
    async fn test_unknown_client_is_rejected() {
        let (mut client, mut server) = streams();
        let creds = credentials("9999", "hello_world");
        let store = store();

        let (initiated, accepted) = tokio::join!(
            initiate(&mut client, &creds, json!({}), DEFAULT_HANDSHAKE_TIMEOUT),
            accept(
                &mut server,
                &store,
                Duration::from_secs(30),
                DEFAULT_HANDSHAKE_TIMEOUT,
                |_| async { json!({}) },
            ),
        );

        assert!(
            matches!(initiated, Err(HandshakeError::Rejected(reason)) if reason == REASON_UNKNOWN_CLIENT)
        );
        assert!(matches!(accepted, Err(HandshakeError::UnknownClient(id)) if id == "9999"));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let (mut client, mut server) = streams();
        let creds = credentials("1512", "hello_worle");
        let store = store();

        let (initiated, accepted) = tokio::join!(
            initiate(&mut client, &creds, json!({}), DEFAULT_HANDSHAKE_TIMEOUT),
            accept(
                &mut server,
                &store,
                Duration::from_secs(30),
                DEFAULT_HANDSHAKE_TIMEOUT,
                |_| async { json!({}) },
            ),
        );

        assert!(
            matches!(initiated, Err(HandshakeError::Rejected(reason)) if reason == REASON_BAD_SECRET)
        );
        assert!(matches!(accepted, Err(HandshakeError::BadSecret(_))));
    }

    #[tokio::test]
    async fn test_initiator_rejects_forged_acceptor_digest() {
        let (mut client, mut server) = streams();
        let creds = credentials("1512", "hello_world");

        let forger = async {
            let login: LoginPayload = server
                .read_packet(&[op::AUTH_LOGIN])
                .await
                .unwrap()
                .payload()
                .unwrap();
            assert_eq!(login.client_id, "1512");
            let packet = Packet::from_payload(
                op::AUTH_SUCCESS,
                &ServerAuthSuccess {
                    digest: sign(&SecretString::from("guess"), "anything"),
                    heartbeat_interval: 30,
                    info: json!({}),
                },
            )
            .unwrap();
            server.write_packet(packet).await.unwrap();

            // No auth:success follows a detected mismatch.
            server
                .read_packet(&[op::AUTH_SUCCESS, op::AUTH_FAIL])
                .await
                .unwrap()
        };

        let (initiated, reply) = tokio::join!(
            initiate(&mut client, &creds, json!({}), DEFAULT_HANDSHAKE_TIMEOUT),
            forger
        );

        assert!(matches!(initiated, Err(HandshakeError::ServerDigestMismatch)));
        assert_eq!(reply.op, op::AUTH_FAIL);
        let fail: AuthFail = reply.payload().unwrap();
        assert_eq!(fail.reason, REASON_SERVER_MISMATCH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (mut client, _server) = streams();
        let creds = credentials("1512", "hello_world");

        let result = initiate(&mut client, &creds, json!({}), Duration::from_secs(15)).await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }

    #[tokio::test]
    async fn test_wrong_first_opcode_is_protocol_error() {
        let (mut client, mut server) = streams();
        client
            .write_packet(Packet::new(op::PING, json!(true)))
            .await
            .unwrap();

        let result = accept(
            &mut server,
            &store(),
            Duration::from_secs(30),
            DEFAULT_HANDSHAKE_TIMEOUT,
            |_| async { json!({}) },
        )
        .await;
        assert!(matches!(
            result,
            Err(HandshakeError::Protocol(ConnectionError::UnexpectedOp { .. }))
        ));
    }
}
