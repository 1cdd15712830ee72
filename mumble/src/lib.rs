//! A Mumble voice-chat client: TLS control channel, OCB-AES128 voice
//! transport, and a hook-based event facade (`MumbleClient`) built on top.

use std::path::PathBuf;

use async_broadcast as broadcast;
use futures::{SinkExt, StreamExt};
use log::info;
use petgraph::graph::NodeIndex;
use sysinfo::{System, SystemExt};
use tokio_util::codec::Framed;

use audiopipe::Core;
use msgtools::{proxy, Ac};

use crate::connect::{HandshakeState, ResultAction};
pub use crate::audio::FrameSize;
pub use crate::error::{ClientError, MessageError};
pub use crate::event::{Event, HookSink, HookTable};
pub use crate::server_state::{Channel, ChannelRef, ServerState, User, UserRef, VoiceTarget, VoiceTargetChannel};

mod audio;
mod connect;
mod control_codec;
mod crypt;
pub mod error;
pub mod event;
mod proto;
mod server_state;
mod tasks;
mod udp_codec;
mod varint;
mod voice;

pub use crate::control_codec::MAX_MESSAGE_LENGTH;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

const CLIENT_VERSION_MAJOR: u32 = 1;
const CLIENT_VERSION_MINOR: u32 = 2;
const CLIENT_VERSION_PATCH: u32 = 5;
const CLIENT_VERSION: u32 = (CLIENT_VERSION_MAJOR << 16) | (CLIENT_VERSION_MINOR << 8) | CLIENT_VERSION_PATCH;

/// Authentication parameters presented at connect time.
#[derive(Debug, Clone, Default)]
pub struct MumbleConfig {
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
}

/// Knobs fixed at connect time, before any protocol traffic has happened:
/// the TLS client certificate/key and hints that otherwise would only ever
/// settle reactively off ServerSync/bandwidth negotiation.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    /// Starting audio frame size, before any `max_bandwidth` adaptation.
    pub frame_size: Option<FrameSize>,
    /// Starting bandwidth cap, applied immediately rather than waiting for
    /// the server's `ServerSync.max_bandwidth`.
    pub max_bandwidth_hint: Option<u32>,
    /// Overrides the legacy-mode flag this client would otherwise derive
    /// from its own announced version (minor < 5 implies legacy).
    pub legacy_mode_override: Option<bool>,
}

proxy! {
    pub proxy MumbleClient {
        pub async fn broadcast_message(channels: Vec<ChannelRef>, users: Vec<UserRef>, text: String) -> Result<(), MessageError>;
        pub async fn set_comment(comment: String);
        pub async fn my_user() -> Ac<User>;
        pub async fn my_user_ref() -> UserRef;
        pub async fn my_channel() -> Ac<Channel>;
        pub async fn my_channel_ref() -> ChannelRef;
        pub async fn get_user(r: UserRef) -> Option<Ac<User>>;
        pub async fn get_channel(r: ChannelRef) -> Option<Ac<Channel>>;
        pub async fn state() -> Ac<ServerState>;
        pub async fn max_message_length() -> Option<u32>;
        pub async fn audio_input() -> Option<NodeIndex>;
        pub async fn event_subscriber() -> broadcast::Receiver<Event>;
        pub async fn register_voice_target(id: u32, target: VoiceTarget);
        pub async fn set_voice_target(id: u32);
        pub async fn close();
    }
}

impl MumbleClient {
    /// Connects to `host:port`, runs the TLS + authentication handshake, and
    /// spawns the background task that drives the connection from then on.
    ///
    /// `hooks` is consumed: every event the client ever emits from this point
    /// on dispatches through it, so register every callback before calling
    /// this (there is no way to add one to an already-running connection).
    pub async fn connect(
        host: &str,
        port: u16,
        config: MumbleConfig,
        options: ClientOptions,
        core: &Core,
        hooks: HookTable,
    ) -> Result<Self, ClientError> {
        info!("connecting to {}:{}", host, port);

        let legacy_mode = options
            .legacy_mode_override
            .unwrap_or(CLIENT_VERSION_MAJOR <= 1 && CLIENT_VERSION_MINOR < 5);

        let stream = connect::connect(host, port, options.certfile, options.keyfile).await?;
        let peer_addr = stream.get_ref().0.peer_addr().map_err(connect::ConnectError::from)?;

        let mut tcp = Framed::new(stream, control_codec::ControlCodec::new());

        tcp.send(get_version_packet().into()).await.map_err(|_| ClientError::HandshakeClosed)?;

        let auth = proto::Authenticate {
            username: Some(config.username),
            password: config.password,
            tokens: config.tokens,
            celt_versions: Vec::new(),
            opus: Some(true),
        };
        tcp.send(auth.into()).await.map_err(|_| ClientError::HandshakeClosed)?;

        let mut handshake_state = HandshakeState::default();
        let mut server_state = ServerState::new();

        let result = loop {
            match tcp.next().await {
                None => break None,
                Some(Err(_)) => break None,
                Some(Ok(packet)) => {
                    let (action, _events) = connect::handle_packet(handshake_state, &mut server_state, packet).await;
                    match action {
                        ResultAction::Continue(state) => handshake_state = state,
                        ResultAction::Disconnect(reason) => {
                            return Err(ClientError::Rejected(reason));
                        }
                        ResultAction::TransferConnected(crypt_state, session) => {
                            break Some((crypt_state, session));
                        }
                    }
                }
            }
        };

        let (crypt_state, session_id) = result.ok_or(ClientError::HandshakeClosed)?;

        let udp = udp_codec::UdpTransport::connect(peer_addr).await.map_err(connect::ConnectError::from)?;

        let output = core.add_output();
        let mut scheduler = audio::Scheduler::new(output).ok();
        if let Some(scheduler) = scheduler.as_mut() {
            if let Some(frame_size) = options.frame_size {
                scheduler.set_frame_size(frame_size);
            }
            if let Some(max_bandwidth) = options.max_bandwidth_hint {
                scheduler.set_max_bandwidth(max_bandwidth);
            }
        }

        let (client, recv) = MumbleClient::channel();

        let state = tasks::State::new(
            recv,
            tcp,
            udp,
            peer_addr,
            crypt_state,
            Ac::new(server_state),
            hooks,
            UserRef::new(session_id),
            scheduler,
            legacy_mode,
        );
        tokio::spawn(state.handle_messages());

        Ok(client)
    }

    pub async fn message_my_channel<S>(&self, text: S) -> proxy::Result<Result<(), MessageError>>
    where
        S: Into<String>,
    {
        let channel = self.my_channel_ref().await?;
        self.broadcast_message(vec![channel], vec![], text.into()).await
    }

    pub async fn message_channel<S>(&self, channel: ChannelRef, text: S) -> proxy::Result<Result<(), MessageError>>
    where
        S: Into<String>,
    {
        self.broadcast_message(vec![channel], vec![], text.into()).await
    }

    pub async fn message_user<S>(&self, user: UserRef, text: S) -> proxy::Result<Result<(), MessageError>>
    where
        S: Into<String>,
    {
        self.broadcast_message(vec![], vec![user], text.into()).await
    }

    pub async fn respond<S>(&self, ev: &Event, text: S) -> proxy::Result<Result<(), MessageError>>
    where
        S: Into<String>,
    {
        if let Event::Message { actor, receivers, channels, .. } = ev {
            let mut users: Vec<UserRef> = receivers.clone();
            if let Some(actor) = actor {
                users.push(*actor);
            }
            self.broadcast_message(channels.clone(), users, text.into()).await
        } else {
            self.broadcast_message(vec![], vec![], text.into()).await
        }
    }
}

fn get_version_packet() -> proto::Version {
    let info = System::new();

    proto::Version {
        version: Some(CLIENT_VERSION),
        release: Some(format!("mumble-rs {}", CRATE_VERSION)),
        os: Some(info.name().unwrap_or_else(|| "unknown".to_string())),
        os_version: Some(format!(
            "{}; {}",
            info.os_version().unwrap_or_else(|| "unknown".to_string()),
            info.kernel_version().unwrap_or_else(|| "unknown".to_string())
        )),
    }
}
