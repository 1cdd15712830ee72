fn main() {
    prost_build::compile_protos(&["proto/Mumble.proto", "proto/MumbleUDP.proto"], &["proto/"])
        .expect("failed to compile Mumble proto files");
}
