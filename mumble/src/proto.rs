//! Generated Protobuf control-message types (see `build.rs` and `proto/Mumble.proto`).

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/MumbleProto.rs"));

pub mod udp {
    include!(concat!(env!("OUT_DIR"), "/MumbleUDP.rs"));
}
