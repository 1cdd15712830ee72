//! Mixing, resampling and file-backed playback for a 48 kHz stereo audio
//! pipeline. This crate is the audio half of a Mumble client: it owns
//! nothing about the wire protocol, only PCM.

pub mod buffer;
pub mod core;
pub mod decode;
pub mod resample;
pub mod ring_buffer;
pub mod source;

pub use decode::{SeekMode, SoundSource, TrackTags};
pub use resample::{adapt_channels, mix_into, Resampler, TARGET_RATE};
pub use ring_buffer::RingBuffer;
pub use source::{FileSource, LoopMode};

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {
        assert_eq!(2 + 2, 4);
    }
}
