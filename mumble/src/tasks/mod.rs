use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_broadcast as broadcast;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use petgraph::graph::NodeIndex;
use tokio::net::TcpStream;
use tokio::time::interval;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;

use msgtools::Ac;

use crate::audio::Scheduler;
use crate::control_codec::{ControlCodec, ControlPacket};
use crate::crypt::CryptState;
use crate::event::{hook_name, Event, HookTable};
use crate::proto;
use crate::server_state::{ChannelRef, ServerState, UserRef};
use crate::udp_codec::UdpTransport;
use crate::voice::{self, VoiceCodec, VoiceFrame};
use crate::{MessageError, MumbleClientMessage, MumbleClientReceiver};

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct State {
    pipe: MumbleClientReceiver,
    tcp: Framed<TlsStream<TcpStream>, ControlCodec>,
    udp: UdpTransport,
    peer: SocketAddr,
    crypt: CryptState,
    server_state: Ac<ServerState>,
    hooks: HookTable,
    event_chan: broadcast::Sender<Event>,
    me: UserRef,
    scheduler: Option<Scheduler>,
    voice_target: u32,
    legacy_mode: bool,
    tcp_udp_tunnel: bool,
    udp_ping_misses: u32,
    tcp_packets: u32,
    udp_packets: u32,
    decrypt_failure_streak: u32,
}

/// Consecutive UDP decrypt failures that trigger a client-initiated
/// `CryptSetup` resync (`client_nonce` only).
const DECRYPT_FAILURE_RESYNC_THRESHOLD: u32 = 4;

impl State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipe: MumbleClientReceiver,
        tcp: Framed<TlsStream<TcpStream>, ControlCodec>,
        udp: UdpTransport,
        peer: SocketAddr,
        crypt: CryptState,
        server_state: Ac<ServerState>,
        hooks: HookTable,
        me: UserRef,
        scheduler: Option<Scheduler>,
        legacy_mode: bool,
    ) -> Self {
        let (event_chan, _) = broadcast::broadcast(20);

        State {
            pipe,
            tcp,
            udp,
            peer,
            crypt,
            server_state,
            hooks,
            event_chan,
            me,
            scheduler,
            voice_target: 0,
            legacy_mode,
            tcp_udp_tunnel: false,
            udp_ping_misses: 0,
            tcp_packets: 0,
            udp_packets: 0,
            decrypt_failure_streak: 0,
        }
    }

    pub fn audio_node(&self) -> Option<NodeIndex> {
        self.scheduler.as_ref().map(|s| s.output_node())
    }

    fn emit(&mut self, event: Event) {
        let name = hook_name(&event);
        self.hooks.call(name, &event);
        let _ = self.event_chan.broadcast(event);
    }

    pub async fn handle_messages(mut self) {
        let mut ping_timer = interval(PING_INTERVAL);
        let mut audio_timer = self.scheduler.as_ref().map(|s| interval(Duration::from_millis(s.frame_size().ms() as u64)));
        let mut udp_buf = vec![0u8; 2048];
        let mut close_callback = None;

        self.emit(Event::Connect);

        loop {
            let audio_tick = async {
                match &mut audio_timer {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                _ = ping_timer.tick() => {
                    if !self.send_pings().await {
                        break;
                    }
                }
                _ = audio_tick => {
                    self.encode_and_send_audio().await;
                }
                msg = self.pipe.next() => {
                    match msg {
                        None => break,
                        Some(msg) => {
                            if !self.handle_client_message(msg).await {
                                close_callback = Some(());
                                break;
                            }
                        }
                    }
                }
                frame = self.tcp.next() => {
                    match frame {
                        None => {
                            self.emit(Event::Disconnect { reason: "connection closed".into() });
                            break;
                        }
                        Some(Ok(packet)) => {
                            self.tcp_packets += 1;
                            if !self.handle_control_packet(packet).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("malformed control frame discarded: {}", e);
                        }
                    }
                }
                result = self.udp.recv(&mut self.crypt, &mut udp_buf) => {
                    match result {
                        Ok(plain) => {
                            self.udp_packets += 1;
                            self.decrypt_failure_streak = 0;
                            self.handle_udp_datagram(&plain);
                        }
                        Err(e) => {
                            debug!("udp receive/decrypt error: {}", e);
                            self.decrypt_failure_streak += 1;
                            if self.decrypt_failure_streak >= DECRYPT_FAILURE_RESYNC_THRESHOLD {
                                self.decrypt_failure_streak = 0;
                                self.request_crypt_resync().await;
                            }
                        }
                    }
                }
            }
        }

        let _ = self.tcp.close().await;
        let _ = close_callback;
    }

    async fn handle_client_message(&mut self, msg: MumbleClientMessage) -> bool {
        match msg {
            MumbleClientMessage::BroadcastMessage { channels, users, text, callback } => {
                let max_len = self.server_state.max_message_length();

                if let Some(max_len) = max_len {
                    if text.len() > max_len as usize {
                        let _ = callback.send(Err(MessageError::MessageTooLong(text.len(), max_len as usize)));
                        return true;
                    }
                }

                let msg = proto::TextMessage {
                    actor: None,
                    session: users.into_iter().map(|u| u.session_id()).collect(),
                    channel_id: channels.into_iter().map(|c| c.id()).collect(),
                    tree_id: Vec::new(),
                    message: Some(text),
                };

                if self.tcp.send(msg.into()).await.is_err() {
                    return false;
                }
                let _ = callback.send(Ok(()));
            }
            MumbleClientMessage::SetComment { comment, callback } => {
                let msg = proto::UserState { comment: Some(comment), ..Default::default() };
                if self.tcp.send(msg.into()).await.is_err() {
                    return false;
                }
                let _ = callback.send(());
            }
            MumbleClientMessage::MyUser { callback } => {
                let _ = callback.send(Ac::new(self.me.get(&self.server_state).expect("self user missing from roster")));
            }
            MumbleClientMessage::MyUserRef { callback } => {
                let _ = callback.send(self.me);
            }
            MumbleClientMessage::MyChannel { callback } => {
                let user = self.me.get(&self.server_state).expect("self user missing from roster");
                let channel = user.channel().get(&self.server_state).expect("self user's channel missing from roster");
                let _ = callback.send(Ac::new(channel));
            }
            MumbleClientMessage::MyChannelRef { callback } => {
                let user = self.me.get(&self.server_state).expect("self user missing from roster");
                let _ = callback.send(user.channel());
            }
            MumbleClientMessage::GetUser { r, callback } => {
                let _ = callback.send(r.get(&self.server_state).map(Ac::new));
            }
            MumbleClientMessage::GetChannel { r, callback } => {
                let _ = callback.send(r.get(&self.server_state).map(Ac::new));
            }
            MumbleClientMessage::State { callback } => {
                let _ = callback.send(self.server_state.clone());
            }
            MumbleClientMessage::MaxMessageLength { callback } => {
                let _ = callback.send(self.server_state.max_message_length());
            }
            MumbleClientMessage::AudioInput { callback } => {
                let _ = callback.send(self.audio_node());
            }
            MumbleClientMessage::EventSubscriber { callback } => {
                let _ = callback.send(self.event_chan.new_receiver());
            }
            MumbleClientMessage::RegisterVoiceTarget { id, target, callback } => {
                let msg = target.into_proto(id);
                let _ = self.tcp.send(msg.into()).await;
                let _ = callback.send(());
            }
            MumbleClientMessage::SetVoiceTarget { id, callback } => {
                self.voice_target = id;
                let _ = callback.send(());
            }
            MumbleClientMessage::Close { callback } => {
                let _ = callback.send(());
                return false;
            }
        }

        true
    }

    async fn send_pings(&mut self) -> bool {
        let timestamp = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_micros() as u64;

        let msg = proto::Ping {
            timestamp: Some(timestamp),
            good: Some(self.crypt.good()),
            late: Some(self.crypt.late()),
            lost: Some(self.crypt.lost()),
            resync: Some(self.crypt.resync()),
            udp_packets: Some(self.udp_packets),
            tcp_packets: Some(self.tcp_packets),
            udp_ping_avg: None,
            udp_ping_var: None,
            tcp_ping_avg: None,
            tcp_ping_var: None,
        };

        if self.tcp.send(msg.into()).await.is_err() {
            error!("failed to send TCP ping");
            return false;
        }
        self.emit(Event::PingTcp);

        let payload = if self.legacy_mode { voice::legacy_ping_payload(timestamp) } else { voice::protobuf_ping_payload(timestamp) };

        if self.tcp_udp_tunnel {
            let tunnel = proto::UdpTunnel { packet: Some(payload.to_vec()) };
            let _ = self.tcp.send(tunnel.into()).await;
        } else if self.udp.send(&mut self.crypt, &payload).await.is_err() {
            warn!("failed to send UDP ping");
        }
        self.emit(Event::PingUdp);

        self.udp_ping_misses += 1;
        if self.udp_ping_misses == 2 && !self.tcp_udp_tunnel {
            warn!("missed two consecutive UDP pings, falling back to TCP tunnel");
            self.tcp_udp_tunnel = true;
        }

        true
    }

    async fn encode_and_send_audio(&mut self) {
        let (frame, sequence) = match &mut self.scheduler {
            Some(scheduler) => match scheduler.tick() {
                Some(frame) => (frame, scheduler.sequence()),
                None => return,
            },
            None => return,
        };

        self.emit(Event::AudioStream { sample_rate: 48_000, channels: 2, frames: frame.opus_data.len() });

        if self.legacy_mode {
            let payload = voice::encode_legacy_opus(self.me.session_id(), sequence, &frame.opus_data, frame.is_terminator);
            self.send_voice_datagram(payload.to_vec()).await;
        } else {
            let voice_frame = VoiceFrame {
                sender_session: self.me.session_id(),
                sequence,
                codec: None,
                opus_data: frame.opus_data,
                is_terminator: frame.is_terminator,
                target: self.voice_target as u8,
            };
            let payload = voice::encode_protobuf_audio(&voice_frame);
            self.send_voice_datagram(payload.to_vec()).await;
        }

        if frame.is_terminator {
            self.emit(Event::AudioStreamEnd);
        }
    }

    async fn send_voice_datagram(&mut self, payload: Vec<u8>) {
        if self.tcp_udp_tunnel {
            let tunnel = proto::UdpTunnel { packet: Some(payload) };
            let _ = self.tcp.send(tunnel.into()).await;
        } else if self.udp.send(&mut self.crypt, &payload).await.is_err() {
            warn!("failed to send voice datagram over UDP");
        }
    }

    fn handle_udp_datagram(&mut self, datagram: &[u8]) {
        if datagram.is_empty() {
            return;
        }

        self.udp_ping_misses = 0;
        if self.tcp_udp_tunnel {
            debug!("UDP replies resumed, falling back off the TCP tunnel");
            self.tcp_udp_tunnel = false;
        }

        if self.legacy_mode {
            let (voice_type, target) = voice::parse_legacy_header(datagram[0]);
            let payload = &datagram[1..];

            if voice_type == 1 {
                self.emit(Event::PongUdp { good: self.crypt.good(), late: self.crypt.late(), lost: self.crypt.lost() });
                return;
            }

            let codec = match VoiceCodec::from_type(voice_type) {
                Some(c) => c,
                None => return,
            };

            match voice::parse_legacy_voice(codec, target, payload) {
                Ok(frame) => self.handle_voice_frame(frame),
                Err(e) => debug!("failed to parse legacy voice packet: {}", e),
            }
        } else {
            match datagram[0] {
                voice::PROTOBUF_PING_TAG => {
                    self.emit(Event::PongUdp { good: self.crypt.good(), late: self.crypt.late(), lost: self.crypt.lost() });
                }
                voice::PROTOBUF_AUDIO_TAG => match voice::parse_protobuf_audio(&datagram[1..]) {
                    Ok(frame) => self.handle_voice_frame(frame),
                    Err(e) => debug!("failed to parse protobuf voice packet: {}", e),
                },
                _ => {}
            }
        }
    }

    fn handle_voice_frame(&mut self, frame: VoiceFrame) {
        if let Some(event) = self.server_state.set_speaking(frame.sender_session, !frame.is_terminator) {
            self.emit(event);
        }

        self.emit(Event::UserSpeak {
            user: UserRef::new(frame.sender_session),
            channels: 1,
            bandwidth: frame.opus_data.len() as u32 * 8,
            samples_per_frame: 0,
        });

        if frame.is_terminator {
            if let Some(event) = self.server_state.set_speaking(frame.sender_session, false) {
                self.emit(event);
            }
        }
    }

    async fn handle_control_packet(&mut self, packet: ControlPacket) -> bool {
        match packet {
            ControlPacket::Ping(msg) => {
                let _ = msg;
                self.emit(Event::PongTcp { good: self.crypt.good(), late: self.crypt.late(), lost: self.crypt.lost() });
            }
            ControlPacket::UdpTunnel(p) => {
                if let Some(payload) = p.packet {
                    self.handle_udp_datagram(&payload);
                }
            }
            ControlPacket::Version(msg) => {
                if msg.version.unwrap_or(0) < 0x00010500 {
                    self.legacy_mode = true;
                }
                self.emit(Event::ServerVersion {
                    version: msg.version.unwrap_or(0),
                    release: msg.release.unwrap_or_default(),
                    os: msg.os.unwrap_or_default(),
                });
            }
            ControlPacket::Reject(msg) => {
                self.emit(Event::ServerReject {
                    reason: msg.reason.clone().unwrap_or_default(),
                    reject_type: format!("{:?}", msg.r#type),
                });
                self.emit(Event::Disconnect { reason: msg.reason.unwrap_or_default() });
                return false;
            }
            ControlPacket::ServerSync(msg) => {
                self.server_state.mark_synced();
                let welcome_text = msg.welcome_text.unwrap_or_default();
                let max_bandwidth = msg.max_bandwidth.unwrap_or(-1);
                if max_bandwidth >= 0 {
                    if let Some(scheduler) = &mut self.scheduler {
                        scheduler.set_max_bandwidth(max_bandwidth as u32);
                    }
                }
                self.emit(Event::ServerSync { welcome_text, max_bandwidth });
            }
            ControlPacket::ChannelRemove(p) => {
                let channel = ChannelRef::new(p.channel_id);
                self.server_state.remove_channel(p.channel_id);
                self.emit(Event::ChannelRemove { channel });
            }
            ControlPacket::ChannelState(p) => {
                self.server_state.update_channel(&p);
                let channel = ChannelRef::new(p.channel_id.unwrap_or(0));
                self.emit(Event::ChannelState { channel });
            }
            ControlPacket::UserRemove(p) => {
                if p.session == self.me.session_id() {
                    let reason = p.reason.clone().unwrap_or_default();
                    self.emit(Event::UserRemove {
                        user: self.me,
                        actor: p.actor.map(UserRef::new),
                        reason: reason.clone(),
                        ban: p.ban.unwrap_or(false),
                    });
                    self.emit(Event::Disconnect { reason: format!("kicked: {}", reason) });
                    return false;
                }

                let user = UserRef::new(p.session);
                self.server_state.remove_user(p.session);
                self.emit(Event::UserRemove {
                    user,
                    actor: p.actor.map(UserRef::new),
                    reason: p.reason.unwrap_or_default(),
                    ban: p.ban.unwrap_or(false),
                });
            }
            ControlPacket::UserState(p) => {
                let events = self.server_state.update_user(&p);
                for event in events {
                    self.emit(event);
                }
            }
            ControlPacket::BanList(_) => self.emit(Event::BanList),
            ControlPacket::TextMessage(p) => {
                self.emit(Event::Message {
                    actor: p.actor.map(UserRef::new),
                    receivers: p.session.into_iter().map(UserRef::new).collect(),
                    channels: p.channel_id.into_iter().map(ChannelRef::new).collect(),
                    message: p.message.unwrap_or_default(),
                });
            }
            ControlPacket::PermissionDenied(p) => {
                self.emit(Event::PermissionDenied { reason: p.reason.unwrap_or_default() });
            }
            ControlPacket::Acl(p) => {
                self.emit(Event::Acl { channel: ChannelRef::new(p.channel_id.unwrap_or(0)) });
            }
            ControlPacket::QueryUsers(_) => self.emit(Event::QueryUsers),
            ControlPacket::CryptSetup(p) => {
                self.apply_crypt_setup(&p);
                self.emit(Event::CryptSetup);
            }
            ControlPacket::ContextActionModify(p) => {
                self.emit(Event::ContextActionModify { action: p.action.unwrap_or_default() });
            }
            ControlPacket::UserList(_) => self.emit(Event::UserList),
            ControlPacket::PermissionQuery(p) => {
                let channel_id = p.channel_id.unwrap_or(0);
                let permissions = p.permissions.unwrap_or(0);
                self.server_state.update_permission_query(channel_id, permissions, p.flush.unwrap_or(false));
                self.emit(Event::PermissionQuery { channel: ChannelRef::new(channel_id), permissions });
            }
            ControlPacket::CodecVersion(p) => {
                self.emit(Event::CodecVersion { opus: p.opus.unwrap_or(false) });
            }
            ControlPacket::UserStats(p) => {
                self.emit(Event::UserStats { user: UserRef::new(p.session.unwrap_or(0)) });
            }
            ControlPacket::ServerConfig(p) => {
                self.server_state.update_server_config(&p);
                self.emit(Event::ServerConfig {
                    max_bandwidth: p.max_bandwidth,
                    allow_html: p.allow_html,
                    message_length: p.message_length,
                });
            }
            ControlPacket::SuggestConfig(p) => {
                self.emit(Event::SuggestConfig { version: p.version, positional: p.positional, push_to_talk: p.push_to_talk });
            }
            ControlPacket::PluginDataTransmission(p) => {
                self.emit(Event::PluginData {
                    sender: UserRef::new(p.sender_session.unwrap_or(0)),
                    data_id: p.data_id.unwrap_or_default(),
                    data: p.data.unwrap_or_default(),
                    receivers: p.receiver_sessions.into_iter().map(UserRef::new).collect(),
                });
            }
            other => {
                debug!("unhandled control packet type {}", other.type_id());
            }
        }

        true
    }

    /// Persistent UDP decrypt failure: ask the server to resync by sending a
    /// CryptSetup carrying only our own send nonce.
    async fn request_crypt_resync(&mut self) {
        warn!("persistent UDP decrypt failures, requesting a crypt resync");
        let msg = proto::CryptSetup { key: None, client_nonce: Some(self.crypt.encrypt_iv().to_vec()), server_nonce: None };
        let _ = self.tcp.send(msg.into()).await;
    }

    fn apply_crypt_setup(&mut self, msg: &proto::CryptSetup) {
        use std::convert::TryInto;

        if let Some(server_nonce) = &msg.server_nonce {
            if let Ok(nonce) = server_nonce.clone().try_into() {
                self.crypt.set_decrypt_iv(nonce);
            }
        }
    }
}
