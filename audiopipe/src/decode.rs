//! The sound-file decode contract. This crate treats decoding as an external
//! collaborator: embedders may plug in any [`SoundSource`] implementation.
//! When the `file-source` feature is enabled (the default), a `symphonia`-backed
//! implementation is provided so the crate is useful without forcing every
//! embedder to write their own decoder.

use std::io;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SeekMode {
    Set,
    Current,
    End,
}

/// Metadata tags a sound file may carry. All fields are best-effort; absence
/// means the underlying format/file didn't carry that tag.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
    pub software: Option<String>,
    pub comment: Option<String>,
}

/// The embedder-supplied contract for a seekable, decodable sound file.
///
/// Implementations are driven exclusively from the audio producer task: no
/// method here should block for longer than a file read takes.
pub trait SoundSource: Send {
    /// Number of interleaved channels per frame.
    fn channels(&self) -> u16;

    /// Native sample rate of the file.
    fn sample_rate(&self) -> u32;

    /// Total length in frames, if known up front.
    fn len_frames(&self) -> Option<u64>;

    /// Decodes up to `buf.len() / channels()` frames of interleaved `f32`
    /// samples into `buf`, returning the number of samples written (always a
    /// multiple of `channels()`). Returns 0 at end of stream.
    fn read_f32(&mut self, buf: &mut [f32]) -> io::Result<usize>;

    /// Seeks to the given frame offset, relative to `mode`.
    fn seek(&mut self, mode: SeekMode, offset: i64) -> io::Result<u64>;

    fn tags(&self) -> TrackTags {
        TrackTags::default()
    }

    fn duration(&self) -> Option<Duration> {
        let frames = self.len_frames()?;
        Some(Duration::from_secs_f64(
            frames as f64 / self.sample_rate() as f64,
        ))
    }
}

#[cfg(feature = "file-source")]
pub use symphonia_backed::SymphoniaSource;

#[cfg(feature = "file-source")]
mod symphonia_backed {
    use std::fs::File;
    use std::io;
    use std::path::Path;

    use symphonia::core::audio::{SampleBuffer, SignalSpec};
    use symphonia::core::codecs::{Decoder, DecoderOptions};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode as SymSeekMode, SeekTo};
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;
    use symphonia::core::units::Time;

    use super::{SeekMode, SoundSource, TrackTags};

    /// A [`SoundSource`] backed by `symphonia`, supporting whatever container
    /// and codec combination the crate was built with (see the `file-source`
    /// feature's codec list in `audiopipe`'s `Cargo.toml`).
    pub struct SymphoniaSource {
        format: Box<dyn FormatReader>,
        decoder: Box<dyn Decoder>,
        track_id: u32,
        spec: SignalSpec,
        sample_buf: Option<SampleBuffer<f32>>,
        pending: Vec<f32>,
        pending_pos: usize,
        frame_pos: u64,
        tags: TrackTags,
    }

    impl SymphoniaSource {
        pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
            let file = File::open(path.as_ref())?;
            let mss = MediaSourceStream::new(Box::new(file), Default::default());

            let mut hint = Hint::new();
            if let Some(ext) = path.as_ref().extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }

            let probed = symphonia::default::get_probe()
                .format(
                    &hint,
                    mss,
                    &FormatOptions::default(),
                    &MetadataOptions::default(),
                )
                .map_err(sym_to_io)?;

            let mut format = probed.format;

            let track = format
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no audio track"))?
                .clone();

            let decoder = symphonia::default::get_codecs()
                .make(&track.codec_params, &DecoderOptions::default())
                .map_err(sym_to_io)?;

            let spec = SignalSpec::new(
                track.codec_params.sample_rate.unwrap_or(48_000),
                track
                    .codec_params
                    .channels
                    .unwrap_or(symphonia::core::audio::Channels::FRONT_LEFT),
            );

            let mut tags = TrackTags::default();
            if let Some(rev) = format.metadata().current() {
                for tag in rev.tags() {
                    let value = tag.value.to_string();
                    match tag.std_key {
                        Some(symphonia::core::meta::StandardTagKey::TrackTitle) => {
                            tags.title = Some(value)
                        }
                        Some(symphonia::core::meta::StandardTagKey::Artist) => {
                            tags.artist = Some(value)
                        }
                        Some(symphonia::core::meta::StandardTagKey::Copyright) => {
                            tags.copyright = Some(value)
                        }
                        Some(symphonia::core::meta::StandardTagKey::Encoder) => {
                            tags.software = Some(value)
                        }
                        Some(symphonia::core::meta::StandardTagKey::Comment) => {
                            tags.comment = Some(value)
                        }
                        _ => {}
                    }
                }
            }

            let track_id = track.id;

            Ok(SymphoniaSource {
                format,
                decoder,
                track_id,
                spec,
                sample_buf: None,
                pending: Vec::new(),
                pending_pos: 0,
                frame_pos: 0,
                tags,
            })
        }
    }

    fn sym_to_io(e: SymphoniaError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e.to_string())
    }

    impl SoundSource for SymphoniaSource {
        fn channels(&self) -> u16 {
            self.spec.channels.count() as u16
        }

        fn sample_rate(&self) -> u32 {
            self.spec.rate
        }

        fn len_frames(&self) -> Option<u64> {
            let track = self.format.tracks().iter().find(|t| t.id == self.track_id)?;
            track.codec_params.n_frames
        }

        fn read_f32(&mut self, buf: &mut [f32]) -> io::Result<usize> {
            let channels = self.channels().max(1) as usize;
            let mut written = 0;

            while written < buf.len() {
                if self.pending_pos < self.pending.len() {
                    let n = (self.pending.len() - self.pending_pos).min(buf.len() - written);
                    buf[written..written + n]
                        .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                    self.pending_pos += n;
                    written += n;
                    self.frame_pos += (n / channels) as u64;
                    continue;
                }

                let packet = match self.format.next_packet() {
                    Ok(p) => p,
                    Err(SymphoniaError::IoError(e))
                        if e.kind() == io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => return Err(sym_to_io(e)),
                };

                if packet.track_id() != self.track_id {
                    continue;
                }

                let decoded = match self.decoder.decode(&packet) {
                    Ok(d) => d,
                    Err(SymphoniaError::DecodeError(_)) => continue,
                    Err(e) => return Err(sym_to_io(e)),
                };

                let spec = *decoded.spec();
                let buf_cap = decoded.capacity() as u64;

                let sample_buf = self
                    .sample_buf
                    .get_or_insert_with(|| SampleBuffer::new(buf_cap, spec));
                sample_buf.copy_interleaved_ref(decoded);

                self.pending.clear();
                self.pending.extend_from_slice(sample_buf.samples());
                self.pending_pos = 0;
            }

            Ok(written)
        }

        fn seek(&mut self, mode: SeekMode, offset: i64) -> io::Result<u64> {
            let target_frame = match mode {
                SeekMode::Set => offset.max(0) as u64,
                SeekMode::Current => (self.frame_pos as i64 + offset).max(0) as u64,
                SeekMode::End => {
                    let len = self.len_frames().unwrap_or(0) as i64;
                    (len + offset).max(0) as u64
                }
            };

            let time = Time::new(target_frame / self.sample_rate() as u64, 0.0);

            self.format
                .seek(
                    SymSeekMode::Accurate,
                    SeekTo::Time {
                        time,
                        track_id: Some(self.track_id),
                    },
                )
                .map_err(sym_to_io)?;

            self.pending.clear();
            self.pending_pos = 0;
            self.frame_pos = target_frame;

            Ok(target_frame)
        }

        fn tags(&self) -> TrackTags {
            self.tags.clone()
        }
    }
}
