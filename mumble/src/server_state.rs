//! The channel tree and user roster: the client's authoritative view of
//! server state, mutated by the TCP dispatch table and queried by id-based
//! weak references everywhere else.

use std::collections::HashMap;

use bit_set::BitSet;

use crate::event::Event;
use crate::proto;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChannelRef {
    id: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UserRef {
    id: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Channel {
    id: u32,
    name: String,
    parent: ChannelRef,
    links: BitSet,
    description: String,
    description_hash: Vec<u8>,
    temporary: bool,
    position: i32,
    max_users: u32,
    is_enter_restricted: bool,
    can_enter: bool,
    permissions: Option<u32>,
    listening_volume: Option<f32>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct User {
    id: u32,
    name: String,
    registered_id: Option<u32>,
    channel: ChannelRef,
    mute: bool,
    deaf: bool,
    self_mute: bool,
    self_deaf: bool,
    suppress: bool,
    comment: String,
    comment_hash: Vec<u8>,
    texture_hash: Vec<u8>,
    cert_hash: Option<String>,
    priority_speaker: bool,
    recording: bool,
    speaking: bool,
    listening_channels: BitSet,
    connected: bool,
}

/// A slot the server has been told to route voice packets marked with it.
/// Slot 0 is normal speech to the current channel and is never registered
/// explicitly; valid registrable slots are 1..30.
#[derive(Debug, Clone, Default)]
pub struct VoiceTarget {
    sessions: Vec<u32>,
    channels: Vec<VoiceTargetChannel>,
}

#[derive(Debug, Clone)]
pub struct VoiceTargetChannel {
    pub channel_id: u32,
    pub group: Option<String>,
    pub links: bool,
    pub children: bool,
}

impl VoiceTarget {
    pub fn new() -> Self {
        VoiceTarget::default()
    }

    pub fn add_session(mut self, session_id: u32) -> Self {
        self.sessions.push(session_id);
        self
    }

    pub fn add_channel(mut self, channel_id: u32, group: Option<String>, links: bool, children: bool) -> Self {
        self.channels.push(VoiceTargetChannel { channel_id, group, links, children });
        self
    }

    pub(crate) fn into_proto(self, id: u32) -> proto::VoiceTarget {
        use proto::voice_target::Target;

        let mut targets = Vec::new();
        if !self.sessions.is_empty() {
            targets.push(Target { session: self.sessions, ..Default::default() });
        }

        for ch in self.channels {
            targets.push(Target {
                session: Vec::new(),
                channel_id: Some(ch.channel_id),
                group: ch.group,
                links: Some(ch.links),
                children: Some(ch.children),
            });
        }

        proto::VoiceTarget { id: Some(id), targets }
    }
}

#[derive(Debug, Clone)]
pub struct ServerState {
    channels: HashMap<u32, Channel>,
    users: HashMap<u32, User>,
    max_message_length: Option<u32>,
    synced: bool,
}

impl ChannelRef {
    pub const fn new(id: u32) -> Self {
        ChannelRef { id }
    }

    pub const fn root() -> Self {
        ChannelRef { id: 0 }
    }

    pub fn get(&self, st: &ServerState) -> Option<Channel> {
        st.channels.get(&self.id).cloned()
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl UserRef {
    pub const fn new(id: u32) -> Self {
        UserRef { id }
    }

    pub fn get(&self, st: &ServerState) -> Option<User> {
        st.users.get(&self.id).cloned()
    }

    pub fn session_id(&self) -> u32 {
        self.id
    }
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent(&self) -> ChannelRef {
        self.parent
    }

    pub fn links(&self) -> &BitSet {
        &self.links
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn description_hash(&self) -> &[u8] {
        &self.description_hash
    }

    pub fn temporary(&self) -> bool {
        self.temporary
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn max_users(&self) -> Option<u32> {
        if self.max_users != 0 {
            Some(self.max_users)
        } else {
            None
        }
    }

    pub fn is_enter_restricted(&self) -> bool {
        self.is_enter_restricted
    }

    pub fn can_enter(&self) -> bool {
        self.can_enter
    }

    pub fn permissions(&self) -> Option<u32> {
        self.permissions
    }

    pub fn listening_volume(&self) -> Option<f32> {
        self.listening_volume
    }

    pub fn to_ref(&self) -> ChannelRef {
        ChannelRef::new(self.id)
    }
}

impl User {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn registered_id(&self) -> Option<u32> {
        self.registered_id
    }

    pub fn channel(&self) -> ChannelRef {
        self.channel
    }

    pub fn mute(&self) -> bool {
        self.mute
    }

    pub fn deaf(&self) -> bool {
        self.deaf
    }

    pub fn self_mute(&self) -> bool {
        self.self_mute
    }

    pub fn self_deaf(&self) -> bool {
        self.self_deaf
    }

    pub fn suppress(&self) -> bool {
        self.suppress
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn priority_speaker(&self) -> bool {
        self.priority_speaker
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    pub fn speaking(&self) -> bool {
        self.speaking
    }

    pub fn listening_channels(&self) -> &BitSet {
        &self.listening_channels
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn to_ref(&self) -> UserRef {
        UserRef::new(self.id)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState::new()
    }
}

impl ServerState {
    pub fn new() -> Self {
        ServerState {
            channels: Default::default(),
            users: Default::default(),
            max_message_length: None,
            synced: false,
        }
    }

    pub fn user(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn max_message_length(&self) -> Option<u32> {
        self.max_message_length
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Upserts a user from a `UserState` message, returning the hook events
    /// this update provokes (channel move, first-sight connect), in order.
    pub fn update_user(&mut self, state: &proto::UserState) -> Vec<Event> {
        let mut events = Vec::new();
        let session_id = match state.session {
            Some(id) => id,
            None => return events,
        };

        let first_sight = !self.users.contains_key(&session_id);

        let user = self.users.entry(session_id).or_insert_with(|| User {
            id: session_id,
            name: String::new(),
            registered_id: None,
            channel: ChannelRef::root(),
            mute: false,
            deaf: false,
            self_mute: false,
            self_deaf: false,
            suppress: false,
            comment: String::new(),
            comment_hash: Vec::new(),
            texture_hash: Vec::new(),
            cert_hash: None,
            priority_speaker: false,
            recording: false,
            speaking: false,
            listening_channels: BitSet::new(),
            connected: false,
        });

        if let Some(name) = &state.name {
            user.name = name.clone();
        }
        if let Some(uid) = state.user_id {
            user.registered_id = Some(uid);
        }
        if let Some(m) = state.mute {
            user.mute = m;
        }
        if let Some(d) = state.deaf {
            user.deaf = d;
        }
        if let Some(m) = state.self_mute {
            user.self_mute = m;
        }
        if let Some(d) = state.self_deaf {
            user.self_deaf = d;
        }
        if let Some(s) = state.suppress {
            user.suppress = s;
        }
        if let Some(c) = &state.comment {
            user.comment = c.clone();
        }
        if let Some(h) = &state.comment_hash {
            user.comment_hash = h.clone();
        }
        if let Some(h) = &state.texture_hash {
            user.texture_hash = h.clone();
        }
        if let Some(p) = state.priority_speaker {
            user.priority_speaker = p;
        }
        if let Some(r) = state.recording {
            user.recording = r;
        }
        for ch in &state.listening_channel_add {
            user.listening_channels.insert(*ch as usize);
        }
        for ch in &state.listening_channel_remove {
            user.listening_channels.remove(*ch as usize);
        }

        if let Some(channel_id) = state.channel_id {
            let new = ChannelRef::new(channel_id);
            if user.channel != new {
                let old = user.channel;
                user.channel = new;

                if !first_sight {
                    events.push(Event::UserChannel { user: user.to_ref(), old_channel: old, new_channel: new });
                }
            }
        }

        let user_ref = user.to_ref();

        if self.synced && first_sight {
            events.push(Event::UserConnect { user: user_ref });
        }

        if let Some(user) = self.users.get_mut(&session_id) {
            if self.synced && !user.connected {
                user.connected = true;
            }
        }

        events.push(Event::UserState { user: user_ref });
        events
    }

    pub fn remove_user(&mut self, session_id: u32) -> Option<User> {
        self.users.remove(&session_id)
    }

    /// Upserts a channel from a `ChannelState` message, applying the
    /// links-add/links-remove/links-replace set algebra (replace wins when
    /// `links` is non-empty, then add/remove are applied on top).
    pub fn update_channel(&mut self, state: &proto::ChannelState) {
        let channel_id = match state.channel_id {
            Some(id) => id,
            None => return,
        };

        let channel = self.channels.entry(channel_id).or_insert_with(|| Channel {
            id: channel_id,
            name: String::new(),
            parent: ChannelRef::root(),
            links: BitSet::new(),
            description: String::new(),
            description_hash: Vec::new(),
            temporary: false,
            position: 0,
            max_users: 0,
            is_enter_restricted: false,
            can_enter: true,
            permissions: None,
            listening_volume: None,
        });

        if let Some(name) = &state.name {
            channel.name = name.clone();
        }
        if let Some(parent) = state.parent {
            channel.parent = ChannelRef::new(parent);
        }
        if !state.links.is_empty() {
            channel.links.clear();
            channel.links.extend(state.links.iter().map(|v| *v as usize));
        }
        channel.links.extend(state.links_add.iter().map(|v| *v as usize));
        for el in &state.links_remove {
            channel.links.remove(*el as usize);
        }
        if let Some(desc) = &state.description {
            channel.description = desc.clone();
        }
        if let Some(hash) = &state.description_hash {
            channel.description_hash = hash.clone();
        }
        if let Some(t) = state.temporary {
            channel.temporary = t;
        }
        if let Some(p) = state.position {
            channel.position = p;
        }
        if let Some(max) = state.max_users {
            channel.max_users = max;
        }
        if let Some(r) = state.is_enter_restricted {
            channel.is_enter_restricted = r;
        }
        if let Some(c) = state.can_enter {
            channel.can_enter = c;
        }
    }

    pub fn remove_channel(&mut self, channel_id: u32) -> Option<Channel> {
        self.channels.remove(&channel_id)
    }

    pub fn update_server_config(&mut self, config: &proto::ServerConfig) {
        if let Some(len) = config.message_length {
            self.max_message_length = Some(len);
        }
    }

    /// Updates a channel's cached permission bitmask; `flush` clears every
    /// other channel's cache, matching the server's intent that downstream
    /// permission checks must be re-queried.
    pub fn update_permission_query(&mut self, channel_id: u32, permissions: u32, flush: bool) {
        if flush {
            for channel in self.channels.values_mut() {
                channel.permissions = None;
            }
        }

        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.permissions = Some(permissions);
        }
    }

    /// Marks `session_id`'s speaking flag, returning the transition hook
    /// (`OnUserStartSpeaking`/`OnUserStopSpeaking`) if the flag changed.
    pub fn set_speaking(&mut self, session_id: u32, speaking: bool) -> Option<Event> {
        let user = self.users.get_mut(&session_id)?;
        if user.speaking == speaking {
            return None;
        }
        user.speaking = speaking;

        let user_ref = UserRef::new(session_id);
        Some(if speaking { Event::UserStartSpeaking { user: user_ref } } else { Event::UserStopSpeaking { user: user_ref } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_state(session: u32) -> proto::UserState {
        proto::UserState { session: Some(session), ..Default::default() }
    }

    #[test]
    fn first_sight_before_sync_does_not_emit_connect() {
        let mut st = ServerState::new();
        let events = st.update_user(&user_state(1));
        assert!(!events.iter().any(|e| matches!(e, Event::UserConnect { .. })));
    }

    #[test]
    fn first_sight_after_sync_emits_connect_and_flips_connected() {
        let mut st = ServerState::new();
        st.mark_synced();
        let events = st.update_user(&user_state(1));
        assert!(events.iter().any(|e| matches!(e, Event::UserConnect { .. })));
        assert!(st.user(1).unwrap().connected());
    }

    #[test]
    fn channel_change_on_existing_user_emits_user_channel() {
        let mut st = ServerState::new();
        st.update_user(&user_state(1));

        let mut moved = user_state(1);
        moved.channel_id = Some(5);
        let events = st.update_user(&moved);

        assert!(events.iter().any(|e| matches!(e, Event::UserChannel { new_channel, .. } if new_channel.id() == 5)));
        assert_eq!(st.user(1).unwrap().channel().id(), 5);
    }

    #[test]
    fn channel_links_add_and_remove_apply_on_top_of_replace() {
        let mut st = ServerState::new();
        let mut state = proto::ChannelState { channel_id: Some(1), ..Default::default() };
        state.links = vec![2, 3];
        st.update_channel(&state);

        let mut update = proto::ChannelState { channel_id: Some(1), ..Default::default() };
        update.links_add = vec![4];
        update.links_remove = vec![2];
        st.update_channel(&update);

        let links = st.channel(1).unwrap().links().clone();
        assert!(!links.contains(2));
        assert!(links.contains(3));
        assert!(links.contains(4));
    }

    #[test]
    fn permission_query_flush_clears_other_channels() {
        let mut st = ServerState::new();
        st.update_channel(&proto::ChannelState { channel_id: Some(1), ..Default::default() });
        st.update_channel(&proto::ChannelState { channel_id: Some(2), ..Default::default() });
        st.update_permission_query(1, 0xFF, false);
        st.update_permission_query(2, 0x00, true);

        assert_eq!(st.channel(1).unwrap().permissions(), None);
        assert_eq!(st.channel(2).unwrap().permissions(), Some(0));
    }

    #[test]
    fn speaking_transition_fires_only_on_change() {
        let mut st = ServerState::new();
        st.update_user(&user_state(1));

        assert!(matches!(st.set_speaking(1, true), Some(Event::UserStartSpeaking { .. })));
        assert!(st.set_speaking(1, true).is_none());
        assert!(matches!(st.set_speaking(1, false), Some(Event::UserStopSpeaking { .. })));
    }

    #[test]
    fn speaking_transitions_stay_well_nested_across_a_session() {
        // Simulates a run of inbound voice frames: two talkspurts from the
        // same user, each a start, a couple of continuation frames, and a
        // terminator. The observed event sequence must alternate
        // start/stop exactly, never two starts or two stops in a row.
        let mut st = ServerState::new();
        st.update_user(&user_state(1));

        let frames = [true, true, true, false, true, true, false];
        let mut seen = Vec::new();
        for speaking in frames {
            if let Some(event) = st.set_speaking(1, speaking) {
                seen.push(event);
            }
        }

        assert_eq!(seen.len(), 4);
        let mut expect_start = true;
        for event in &seen {
            match event {
                Event::UserStartSpeaking { .. } => assert!(expect_start, "two starts in a row"),
                Event::UserStopSpeaking { .. } => assert!(!expect_start, "two stops in a row"),
                other => panic!("unexpected event {:?}", other),
            }
            expect_start = !expect_start;
        }
        assert!(!expect_start, "session must end on a stop, not a dangling start");
    }

    #[test]
    fn channel_parents_resolve_to_a_known_channel_or_root_after_removal() {
        let mut st = ServerState::new();
        st.update_channel(&proto::ChannelState { channel_id: Some(1), parent: Some(0), ..Default::default() });
        st.update_channel(&proto::ChannelState { channel_id: Some(2), parent: Some(1), ..Default::default() });
        st.update_channel(&proto::ChannelState { channel_id: Some(3), parent: Some(1), ..Default::default() });

        // Removing a leaf channel (3) must not disturb the parent links of
        // the channels that remain (1 and 2).
        st.remove_channel(3);

        for channel in st.channels() {
            let parent = channel.parent();
            assert!(
                parent == ChannelRef::root() || st.channel(parent.id()).is_some(),
                "channel {} has a parent {} absent from the roster",
                channel.id(),
                parent.id()
            );
        }
        assert_eq!(st.channel(2).unwrap().parent().id(), 1);
    }
}
