//! TLS handshake and the pre-sync packet handling that runs before the
//! client transitions into its steady-state event loop.

use std::convert::TryInto;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey};
use tokio_rustls::webpki::DNSNameRef;
use tokio_rustls::TlsConnector;

use crate::control_codec::ControlPacket;
use crate::crypt::CryptState;
use crate::event::Event;
use crate::server_state::ServerState;

pub async fn connect(
    domain: &str,
    port: u16,
    certfile: Option<impl AsRef<Path>>,
    keyfile: Option<impl AsRef<Path>>,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let mut config = ClientConfig::new();
    config.root_store.add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);

    if let (Some(certfile), Some(keyfile)) = (certfile, keyfile) {
        let cert_bytes = tokio::fs::read(certfile.as_ref()).await?;
        let mut cursor = Cursor::new(&cert_bytes);
        let certs = rustls_pemfile::certs(&mut cursor)
            .map_err(|_| ConnectError::InvalidCertificate)?
            .into_iter()
            .map(Certificate)
            .collect();

        let key_bytes = tokio::fs::read(keyfile.as_ref()).await?;
        let mut cursor = Cursor::new(&key_bytes);
        let key = rustls_pemfile::pkcs8_private_keys(&mut cursor)
            .map_err(|_| ConnectError::InvalidPrivateKey)?
            .into_iter()
            .map(PrivateKey)
            .next()
            .ok_or(ConnectError::InvalidPrivateKey)?;

        config.set_single_client_cert(certs, key).map_err(|_| ConnectError::InvalidPrivateKey)?;
    }

    let stream = TcpStream::connect((domain, port)).await?;
    let connector = TlsConnector::from(Arc::new(config));
    let domain_ref = DNSNameRef::try_from_ascii_str(domain).map_err(|_| ConnectError::InvalidDomain)?;

    Ok(connector.connect(domain_ref, stream).await?)
}

#[derive(Default)]
pub struct HandshakeState {
    crypt_state: Option<CryptState>,
}

pub enum ResultAction {
    Continue(HandshakeState),
    Disconnect(String),
    TransferConnected(CryptState, u32),
}

/// Handles one pre-sync control packet, mutating `server_state` and
/// returning both the handshake's next action and the hook events this
/// packet provoked (the caller dispatches them; handshake has no hook
/// table of its own).
pub async fn handle_packet(mut state: HandshakeState, server_state: &mut ServerState, packet: ControlPacket) -> (ResultAction, Vec<Event>) {
    let mut events = Vec::new();

    let action = match packet {
        ControlPacket::Ping(_) => ResultAction::Continue(state),
        ControlPacket::Reject(msg) => {
            let reason = msg.reason.clone().unwrap_or_default();
            error!("connection rejected by server: {}", reason);
            events.push(Event::ServerReject { reason: reason.clone(), reject_type: format!("{:?}", msg.r#type) });
            ResultAction::Disconnect(reason)
        }
        ControlPacket::Version(msg) => {
            info!("server version: {:?}", msg.version);
            events.push(Event::ServerVersion {
                version: msg.version.unwrap_or(0),
                release: msg.release.clone().unwrap_or_default(),
                os: msg.os.clone().unwrap_or_default(),
            });
            ResultAction::Continue(state)
        }
        ControlPacket::ServerSync(msg) => match state.crypt_state.take() {
            Some(crypt_state) => {
                let session = msg.session.unwrap_or(0);
                let max_bandwidth = msg.max_bandwidth.unwrap_or(-1);
                let welcome_text = msg.welcome_text.clone().unwrap_or_default();

                info!("server says: {}", welcome_text);
                server_state.mark_synced();
                events.push(Event::ServerSync { welcome_text, max_bandwidth });

                ResultAction::TransferConnected(crypt_state, session)
            }
            None => {
                error!("server didn't send crypt setup information during handshake");
                ResultAction::Disconnect("missing crypt setup".into())
            }
        },
        ControlPacket::CryptSetup(msg) => match handle_crypt_setup(&msg) {
            Ok(cs) => {
                state.crypt_state = Some(cs);
                ResultAction::Continue(state)
            }
            Err(e) => {
                error!("error setting up crypt state: {}", e);
                ResultAction::Disconnect(e.to_string())
            }
        },
        ControlPacket::UserState(p) => {
            events.extend(server_state.update_user(&p));
            ResultAction::Continue(state)
        }
        ControlPacket::UserRemove(p) => {
            server_state.remove_user(p.session);
            ResultAction::Continue(state)
        }
        ControlPacket::ChannelState(p) => {
            server_state.update_channel(&p);
            ResultAction::Continue(state)
        }
        ControlPacket::ChannelRemove(p) => {
            server_state.remove_channel(p.channel_id);
            ResultAction::Continue(state)
        }
        other => {
            debug!("unhandled pre-sync packet: type {}", other.type_id());
            ResultAction::Continue(state)
        }
    };

    (action, events)
}

/// Applies the CryptSetup keying rules: a full key response (key +
/// client_nonce + server_nonce all set) during handshake always carries all
/// three.
fn handle_crypt_setup(msg: &crate::proto::CryptSetup) -> Result<CryptState, CryptSetupError> {
    let key: [u8; 16] = msg.key.clone().unwrap_or_default().try_into().map_err(|_| CryptSetupError::InvalidKeySize)?;
    let encrypt_nonce: [u8; 16] =
        msg.client_nonce.clone().unwrap_or_default().try_into().map_err(|_| CryptSetupError::InvalidClientNonceSize)?;
    let decrypt_nonce: [u8; 16] =
        msg.server_nonce.clone().unwrap_or_default().try_into().map_err(|_| CryptSetupError::InvalidServerNonceSize)?;

    Ok(CryptState::from_parts(key, encrypt_nonce, decrypt_nonce))
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate PEM")]
    InvalidCertificate,
    #[error("invalid private key PEM")]
    InvalidPrivateKey,
    #[error("invalid domain name")]
    InvalidDomain,
}

#[derive(Debug, Error)]
enum CryptSetupError {
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("invalid client nonce size")]
    InvalidClientNonceSize,
    #[error("invalid server nonce size")]
    InvalidServerNonceSize,
}
