//! A seekable, fadeable, loopable PCM producer backed by a [`SoundSource`].
//!
//! A `FileSource` is split into two halves sharing a `Mutex`: the producer
//! side (driven by the background decode task, see [`FileSource::refill`])
//! decodes, adapts and resamples audio into a ring buffer; the consumer side
//! (driven by the mixer tick) drains frames out, applies the fade envelope
//! and volume, and reports end-of-stream/loop transitions back up.

use std::sync::{Arc, Mutex};

use crate::decode::{SeekMode, SoundSource};
use crate::resample::{adapt_channels, Resampler, TARGET_RATE};
use crate::ring_buffer::RingBuffer;

/// One ring-buffer's worth of headroom, in frames, the producer tries to
/// maintain. The ring is sized to hold at least two of these so the mixer
/// never underruns between producer wakeups.
const FRAMES_PER_REFILL: usize = 960; // 20ms at 48kHz

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LoopMode {
    Off,
    Infinite,
    Remaining(u32),
}

#[derive(Debug, Clone, Copy)]
struct FadeState {
    frames_remaining: u32,
    total_frames: u32,
    from_volume: f32,
    to_volume: f32,
    stop_at_end: bool,
}

struct Shared {
    ring: RingBuffer,
    resampler: Resampler,
    source_channels: u16,
    volume: f32,
    fade: Option<FadeState>,
    loop_mode: LoopMode,
    playing: bool,
    stopped: bool,
    ended: bool,
    frame_pos: u64,
}

/// A file-backed audio source. Cloning shares the same underlying state (the
/// producer task and the mixer hold separate clones).
#[derive(Clone)]
pub struct FileSource {
    inner: Arc<Mutex<Shared>>,
    decoder: Arc<Mutex<Box<dyn SoundSource>>>,
}

impl FileSource {
    pub fn new(decoder: Box<dyn SoundSource>, ring_capacity_frames: usize) -> Self {
        let source_rate = decoder.sample_rate();
        let source_channels = decoder.channels();

        FileSource {
            inner: Arc::new(Mutex::new(Shared {
                ring: RingBuffer::with_capacity(ring_capacity_frames.max(FRAMES_PER_REFILL * 2) * 2),
                resampler: Resampler::new(source_rate),
                source_channels,
                volume: 1.0,
                fade: None,
                loop_mode: LoopMode::Off,
                playing: false,
                stopped: true,
                ended: false,
                frame_pos: 0,
            })),
            decoder: Arc::new(Mutex::new(decoder)),
        }
    }

    pub fn play(&self) {
        let mut s = self.inner.lock().unwrap();
        if s.stopped {
            s.frame_pos = 0;
            let mut dec = self.decoder.lock().unwrap();
            let _ = dec.seek(SeekMode::Set, 0);
            s.resampler.reset();
            s.ring.clear();
        }
        s.stopped = false;
        s.ended = false;
        s.playing = true;
    }

    pub fn pause(&self) {
        self.inner.lock().unwrap().playing = false;
    }

    pub fn stop(&self) {
        let mut s = self.inner.lock().unwrap();
        s.playing = false;
        s.stopped = true;
        s.ring.clear();
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().playing
    }

    /// `true` once the source has reached end-of-stream (and isn't looping)
    /// and should be dropped from the active set.
    pub fn has_ended(&self) -> bool {
        self.inner.lock().unwrap().ended
    }

    pub fn seek(&self, mode: SeekMode, offset_frames: i64) -> std::io::Result<u64> {
        let mut dec = self.decoder.lock().unwrap();
        let source_rate = dec.sample_rate() as i64;
        let target_rate = TARGET_RATE as i64;
        // offsets are expressed in 48kHz frames; translate into source frames.
        let source_offset = offset_frames * source_rate / target_rate.max(1);
        let pos = dec.seek(mode, source_offset)?;

        let mut s = self.inner.lock().unwrap();
        s.resampler.reset();
        s.ring.clear();
        s.frame_pos = pos * target_rate as u64 / source_rate.max(1) as u64;
        s.ended = false;
        Ok(s.frame_pos)
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner.lock().unwrap().volume = volume.max(0.0);
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().unwrap().volume
    }

    /// Ramps the volume linearly to `volume` over `seconds`.
    pub fn fade_to(&self, volume: f32, seconds: f32) {
        let mut s = self.inner.lock().unwrap();
        let from = s.volume;
        let frames = ((seconds.max(0.0)) * TARGET_RATE as f32) as u32;
        s.fade = Some(FadeState {
            frames_remaining: frames.max(1),
            total_frames: frames.max(1),
            from_volume: from,
            to_volume: volume.max(0.0),
            stop_at_end: false,
        });
    }

    /// Ramps volume to zero over `seconds`, then stops the source.
    pub fn fade_out(&self, seconds: f32) {
        let mut s = self.inner.lock().unwrap();
        let from = s.volume;
        let frames = ((seconds.max(0.0)) * TARGET_RATE as f32) as u32;
        s.fade = Some(FadeState {
            frames_remaining: frames.max(1),
            total_frames: frames.max(1),
            from_volume: from,
            to_volume: 0.0,
            stop_at_end: true,
        });
    }

    pub fn set_looping(&self, mode: LoopMode) {
        self.inner.lock().unwrap().loop_mode = mode;
    }

    pub fn len_samples(&self) -> Option<u64> {
        self.decoder.lock().unwrap().len_frames().map(|f| {
            f * self.decoder.lock().unwrap().channels().max(1) as u64
        })
    }

    pub fn len_frames(&self) -> Option<u64> {
        self.decoder.lock().unwrap().len_frames()
    }

    pub fn len_seconds(&self) -> Option<f64> {
        let dec = self.decoder.lock().unwrap();
        let frames = dec.len_frames()?;
        Some(frames as f64 / dec.sample_rate() as f64)
    }

    pub fn tags(&self) -> crate::decode::TrackTags {
        self.decoder.lock().unwrap().tags()
    }

    /// Called from the background producer task. Decodes, channel-adapts and
    /// resamples until the ring buffer's free space drops below half its
    /// capacity (the wake threshold named in the audio source contract), or
    /// the source hits end-of-stream/loop boundary.
    ///
    /// Returns `true` if the source produced any new samples this call.
    pub fn refill(&self) -> bool {
        let (should_refill, source_channels) = {
            let s = self.inner.lock().unwrap();
            if !s.playing || s.stopped {
                return false;
            }
            (s.ring.free() >= s.ring.capacity() / 2, s.source_channels)
        };

        if !should_refill {
            return false;
        }

        let mut dec = self.decoder.lock().unwrap();
        let mut scratch = vec![0.0f32; FRAMES_PER_REFILL * source_channels.max(1) as usize];
        let mut produced = false;

        loop {
            let read = match dec.read_f32(&mut scratch) {
                Ok(n) => n,
                Err(_) => 0,
            };

            if read == 0 {
                let mut s = self.inner.lock().unwrap();
                match s.loop_mode {
                    LoopMode::Infinite => {
                        drop(s);
                        let _ = dec.seek(SeekMode::Set, 0);
                        let mut s = self.inner.lock().unwrap();
                        s.resampler.reset();
                        s.frame_pos = 0;
                        continue;
                    }
                    LoopMode::Remaining(n) if n > 0 => {
                        s.loop_mode = LoopMode::Remaining(n - 1);
                        drop(s);
                        let _ = dec.seek(SeekMode::Set, 0);
                        let mut s = self.inner.lock().unwrap();
                        s.resampler.reset();
                        s.frame_pos = 0;
                        continue;
                    }
                    _ => {
                        s.playing = false;
                        s.stopped = true;
                        s.ended = true;
                        break;
                    }
                }
            }

            let channels = source_channels.max(1) as usize;
            let frames: Vec<[f32; 2]> = scratch[..read]
                .chunks(channels)
                .map(|f| adapt_channels(f, source_channels))
                .collect();

            let mut s = self.inner.lock().unwrap();
            let mut out = vec![[0.0f32; 2]; frames.len() + 1];
            let mut iter = frames.into_iter();
            let n = s.resampler.process(&mut iter, &mut out);

            let interleaved: Vec<f32> = out[..n].iter().flat_map(|f| [f[0], f[1]]).collect();
            let written = s.ring.write(&interleaved) / 2;
            s.frame_pos += written as u64;
            produced = produced || written > 0;

            if s.ring.free() < s.ring.capacity() / 4 {
                break;
            }
        }

        produced
    }

    /// Drains up to `out.len()` stereo frames (already resampled to 48kHz)
    /// with fade and volume applied, returning the number of frames written.
    pub fn read_mixed(&self, out: &mut [[f32; 2]]) -> usize {
        let mut s = self.inner.lock().unwrap();
        if !s.playing {
            return 0;
        }

        let mut buf = vec![0.0f32; out.len() * 2];
        let got = s.ring.read(&mut buf) / 2;

        for i in 0..got {
            let gain = s.volume * fade_gain(&mut s.fade, 1);
            out[i] = [buf[i * 2] * gain, buf[i * 2 + 1] * gain];

            if let Some(f) = &s.fade {
                if f.frames_remaining == 0 && f.stop_at_end {
                    s.playing = false;
                    s.stopped = true;
                    s.ended = true;
                }
            }
        }

        got
    }
}

fn fade_gain(fade: &mut Option<FadeState>, frames: u32) -> f32 {
    match fade {
        None => 1.0,
        Some(f) => {
            let t = 1.0 - (f.frames_remaining as f32 / f.total_frames as f32);
            let gain = f.from_volume + (f.to_volume - f.from_volume) * t;
            f.frames_remaining = f.frames_remaining.saturating_sub(frames);
            if f.frames_remaining == 0 {
                let done = f.to_volume;
                let stop = f.stop_at_end;
                *fade = if stop { Some(FadeState { frames_remaining: 0, total_frames: 1, from_volume: done, to_volume: done, stop_at_end: true }) } else { None };
            }
            gain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::TrackTags;
    use std::io;

    struct SineSource {
        channels: u16,
        rate: u32,
        pos: u64,
        len: u64,
    }

    impl SoundSource for SineSource {
        fn channels(&self) -> u16 {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn len_frames(&self) -> Option<u64> {
            Some(self.len)
        }

        fn read_f32(&mut self, buf: &mut [f32]) -> io::Result<usize> {
            let channels = self.channels as usize;
            let frames_left = (self.len - self.pos).min((buf.len() / channels) as u64);
            let n = frames_left as usize * channels;

            for (i, sample) in buf[..n].iter_mut().enumerate() {
                let frame = i / channels;
                *sample = ((self.pos as usize + frame) as f32 * 0.01).sin();
            }

            self.pos += frames_left;
            Ok(n)
        }

        fn seek(&mut self, mode: SeekMode, offset: i64) -> io::Result<u64> {
            self.pos = match mode {
                SeekMode::Set => offset.max(0) as u64,
                SeekMode::Current => (self.pos as i64 + offset).max(0) as u64,
                SeekMode::End => (self.len as i64 + offset).max(0) as u64,
            };
            Ok(self.pos)
        }

        fn tags(&self) -> TrackTags {
            TrackTags::default()
        }
    }

    fn make_source(len_frames: u64) -> FileSource {
        let dec = SineSource { channels: 2, rate: TARGET_RATE, pos: 0, len: len_frames };
        FileSource::new(Box::new(dec), 4096)
    }

    #[test]
    fn play_then_refill_produces_samples() {
        let src = make_source(10_000);
        src.play();
        assert!(src.refill());

        let mut out = vec![[0.0f32; 2]; 100];
        let n = src.read_mixed(&mut out);
        assert!(n > 0);
    }

    #[test]
    fn stop_clears_ring_and_marks_stopped() {
        let src = make_source(10_000);
        src.play();
        src.refill();
        src.stop();
        assert!(!src.is_playing());

        let mut out = vec![[0.0f32; 2]; 10];
        assert_eq!(src.read_mixed(&mut out), 0);
    }

    #[test]
    fn end_of_stream_without_loop_marks_ended() {
        let src = make_source(100);
        src.play();
        for _ in 0..10 {
            src.refill();
        }
        assert!(src.has_ended());
        assert!(!src.is_playing());
    }

    #[test]
    fn infinite_loop_keeps_playing_past_end() {
        let src = make_source(100);
        src.set_looping(LoopMode::Infinite);
        src.play();
        for _ in 0..10 {
            src.refill();
        }
        assert!(!src.has_ended());
        assert!(src.is_playing());
    }

    #[test]
    fn remaining_loop_count_decrements_then_stops() {
        let src = make_source(50);
        src.set_looping(LoopMode::Remaining(1));
        src.play();
        for _ in 0..10 {
            src.refill();
        }
        assert!(src.has_ended());
    }

    #[test]
    fn fade_out_eventually_stops_source() {
        let src = make_source(200_000);
        src.play();
        src.refill();
        src.fade_out(0.001); // ~48 frames at 48kHz

        let mut out = vec![[0.0f32; 2]; 4096];
        let mut stopped = false;
        for _ in 0..20 {
            src.refill();
            src.read_mixed(&mut out);
            if !src.is_playing() {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
    }
}
