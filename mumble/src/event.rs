//! The closed event enum dispatched to hooks, and the `HookSink` extension
//! point embedders implement to receive them.

use crate::server_state::{ChannelRef, UserRef};

#[derive(Debug, Clone)]
pub enum Event {
    Connect,
    Disconnect { reason: String },
    Error { message: String },

    ServerVersion { version: u32, release: String, os: String },
    ServerSync { welcome_text: String, max_bandwidth: i64 },
    ServerReject { reason: String, reject_type: String },
    ServerConfig { max_bandwidth: Option<u32>, allow_html: Option<bool>, message_length: Option<u32> },
    SuggestConfig { version: Option<u32>, positional: Option<bool>, push_to_talk: Option<bool> },

    PingTcp,
    PongTcp { good: u32, late: u32, lost: u32 },
    PingUdp,
    PongUdp { good: u32, late: u32, lost: u32 },

    ChannelState { channel: ChannelRef },
    ChannelRemove { channel: ChannelRef },

    UserState { user: UserRef },
    UserConnect { user: UserRef },
    UserRemove { user: UserRef, actor: Option<UserRef>, reason: String, ban: bool },
    UserChannel { user: UserRef, old_channel: ChannelRef, new_channel: ChannelRef },

    Message { actor: Option<UserRef>, receivers: Vec<UserRef>, channels: Vec<ChannelRef>, message: String },

    PermissionDenied { reason: String },
    PermissionQuery { channel: ChannelRef, permissions: u32 },
    Acl { channel: ChannelRef },
    BanList,
    UserList,
    QueryUsers,
    CodecVersion { opus: bool },
    UserStats { user: UserRef },
    ContextActionModify { action: String },
    PluginData { sender: UserRef, data_id: String, data: Vec<u8>, receivers: Vec<UserRef> },
    CryptSetup,

    AudioStream { sample_rate: u32, channels: u16, frames: usize },
    AudioStreamEnd,

    UserSpeak { user: UserRef, channels: u8, bandwidth: u32, samples_per_frame: u32 },
    UserStartSpeaking { user: UserRef },
    UserStopSpeaking { user: UserRef },
}

/// Return value a hook callback may hand back to its caller. Left
/// deliberately loose: most hooks ignore it.
#[derive(Debug, Clone, Default)]
pub struct Return(pub Option<String>);

/// The embedder-facing extension point: receives every [`Event`] the client
/// emits and may return a value back up the call chain. `OnError` dispatch is
/// NOT re-entrancy-protected: a sink that panics or errors while handling
/// `Event::Error` is a client bug, not something this crate guards against.
pub trait HookSink: Send {
    fn invoke(&mut self, event: &Event) -> Option<Return>;
}

/// Hook dispatch table: hook name -> named callbacks, registered and
/// invoked by the hook name a given [`Event`] maps to (see [`hook_name`]).
#[derive(Default)]
pub struct HookTable {
    hooks: std::collections::HashMap<String, Vec<(String, Box<dyn FnMut(&Event) -> Option<Return> + Send>)>>,
}

impl HookTable {
    pub fn new() -> Self {
        HookTable::default()
    }

    pub fn hook<F>(&mut self, name: impl Into<String>, callback_name: impl Into<String>, f: F)
    where
        F: FnMut(&Event) -> Option<Return> + Send + 'static,
    {
        let name = name.into();
        let callback_name = callback_name.into();
        let list = self.hooks.entry(name).or_default();

        if let Some(slot) = list.iter_mut().find(|(n, _)| *n == callback_name) {
            slot.1 = Box::new(f);
        } else {
            list.push((callback_name, Box::new(f)));
        }
    }

    pub fn unhook(&mut self, name: &str, callback_name: &str) {
        if let Some(list) = self.hooks.get_mut(name) {
            list.retain(|(n, _)| n != callback_name);
        }
    }

    /// Invokes every callback registered under `name`, returning the first
    /// non-`None` return value.
    pub fn call(&mut self, name: &str, event: &Event) -> Option<Return> {
        let mut result = None;

        if let Some(list) = self.hooks.get_mut(name) {
            for (_, callback) in list.iter_mut() {
                if let Some(r) = callback(event) {
                    if result.is_none() {
                        result = Some(r);
                    }
                }
            }
        }

        result
    }
}

/// Maps an [`Event`] to the hook name it is dispatched under.
pub fn hook_name(event: &Event) -> &'static str {
    match event {
        Event::Connect => "OnConnect",
        Event::Disconnect { .. } => "OnDisconnect",
        Event::Error { .. } => "OnError",
        Event::ServerVersion { .. } => "OnServerVersion",
        Event::ServerSync { .. } => "OnServerSync",
        Event::ServerReject { .. } => "OnServerReject",
        Event::ServerConfig { .. } => "OnServerConfig",
        Event::SuggestConfig { .. } => "OnSuggestConfig",
        Event::PingTcp => "OnPingTCP",
        Event::PongTcp { .. } => "OnPongTCP",
        Event::PingUdp => "OnPingUDP",
        Event::PongUdp { .. } => "OnPongUDP",
        Event::ChannelState { .. } => "OnChannelState",
        Event::ChannelRemove { .. } => "OnChannelRemove",
        Event::UserState { .. } => "OnUserState",
        Event::UserConnect { .. } => "OnUserConnect",
        Event::UserRemove { .. } => "OnUserRemove",
        Event::UserChannel { .. } => "OnUserChannel",
        Event::Message { .. } => "OnMessage",
        Event::PermissionDenied { .. } => "OnPermissionDenied",
        Event::PermissionQuery { .. } => "OnPermissionQuery",
        Event::Acl { .. } => "OnACL",
        Event::BanList => "OnBanList",
        Event::UserList => "OnUserList",
        Event::QueryUsers => "OnQueryUsers",
        Event::CodecVersion { .. } => "OnCodecVersion",
        Event::UserStats { .. } => "OnUserStats",
        Event::ContextActionModify { .. } => "OnContextActionModify",
        Event::PluginData { .. } => "OnPluginData",
        Event::CryptSetup => "OnCryptSetup",
        Event::AudioStream { .. } => "OnAudioStream",
        Event::AudioStreamEnd => "OnAudioStreamEnd",
        Event::UserSpeak { .. } => "OnUserSpeak",
        Event::UserStartSpeaking { .. } => "OnUserStartSpeaking",
        Event::UserStopSpeaking { .. } => "OnUserStopSpeaking",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn call_invokes_every_registered_callback() {
        let mut table = HookTable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        table.hook("OnConnect", "a", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            None
        });

        let c2 = count.clone();
        table.hook("OnConnect", "b", move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
            None
        });

        table.call("OnConnect", &Event::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unhook_removes_only_the_named_callback() {
        let mut table = HookTable::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        table.hook("OnConnect", "a", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            None
        });
        table.hook("OnConnect", "b", move |_| None);

        table.unhook("OnConnect", "b");
        table.call("OnConnect", &Event::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_names_match_the_catalogue() {
        assert_eq!(hook_name(&Event::UserConnect { user: UserRef::new(1) }), "OnUserConnect");
        assert_eq!(hook_name(&Event::AudioStreamEnd), "OnAudioStreamEnd");
    }
}
