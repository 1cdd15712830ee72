//! The per-tick audio scheduler: pulls mixed PCM out of the `audiopipe`
//! graph, runs the bandwidth-adaptive Opus encoder, and hands finished
//! frames to whichever transport (UDP or TCP tunnel) the caller wires up.

use audiopus::{Application, Channels, SampleRate};
use dasp::Signal;
use log::warn;
use petgraph::graph::NodeIndex;

use audiopipe::OutputSignal;

/// One of the four frame sizes Mumble voice packets may use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameSize {
    Ms10,
    Ms20,
    Ms40,
    Ms60,
}

impl FrameSize {
    pub fn ms(self) -> u32 {
        match self {
            FrameSize::Ms10 => 10,
            FrameSize::Ms20 => 20,
            FrameSize::Ms40 => 40,
            FrameSize::Ms60 => 60,
        }
    }

    pub fn samples_per_frame(self, sample_rate: u32) -> usize {
        (sample_rate as u64 * self.ms() as u64 / 1000) as usize
    }

    /// Coarsens to the next step in the adaptation order `{10 -> 20 -> 40}`.
    /// 60ms is never chosen automatically; it stays an explicit opt-in.
    fn coarsen(self) -> Option<FrameSize> {
        match self {
            FrameSize::Ms10 => Some(FrameSize::Ms20),
            FrameSize::Ms20 => Some(FrameSize::Ms40),
            FrameSize::Ms40 | FrameSize::Ms60 => None,
        }
    }
}

const BITRATE_FLOOR_BPS: u32 = 8_000;
const IP_UDP_OVERHEAD_BITS: u32 = (20 + 8) * 8;
const ENVELOPE_OVERHEAD_BITS: u32 = 6 * 8;

/// Tracks the encoder's current frame size and bitrate, adapted to stay
/// under a server-advertised bandwidth cap.
pub struct BandwidthAdapter {
    frame_size: FrameSize,
    bitrate_bps: u32,
}

impl BandwidthAdapter {
    pub fn new() -> Self {
        BandwidthAdapter { frame_size: FrameSize::Ms10, bitrate_bps: 72_000 }
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    pub fn set_frame_size(&mut self, frame_size: FrameSize) {
        self.frame_size = frame_size;
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_bps
    }

    /// Estimated on-wire cost in bits/s for the current `(frame_size,
    /// bitrate)` choice, including IP/UDP and envelope overhead.
    pub fn estimated_cost_bps(&self) -> u32 {
        let frames_per_sec = 1000 / self.frame_size.ms();
        let opus_bits_per_frame = self.bitrate_bps / frames_per_sec.max(1);
        (opus_bits_per_frame + IP_UDP_OVERHEAD_BITS + ENVELOPE_OVERHEAD_BITS) * frames_per_sec
    }

    /// Applies §4.5's bandwidth adaptation: coarsen frame size through
    /// `{10 -> 20 -> 40}` first, then lower bitrate in 1 kbit/s steps down
    /// to an 8 kbit/s floor, until estimated cost is at or under `max_bps`.
    pub fn adapt(&mut self, max_bps: u32) {
        while self.estimated_cost_bps() > max_bps {
            if let Some(next) = self.frame_size.coarsen() {
                self.frame_size = next;
                continue;
            }

            if self.bitrate_bps > BITRATE_FLOOR_BPS {
                self.bitrate_bps -= 1_000;
                continue;
            }

            warn!("cannot fit under max_bandwidth {} bps even at the bitrate floor", max_bps);
            break;
        }
    }

    /// The Opus application mode the current bitrate implies.
    pub fn application(&self) -> Application {
        if self.bitrate_bps >= 64_000 {
            Application::LowDelay
        } else if self.bitrate_bps >= 32_000 {
            Application::Audio
        } else {
            Application::Voip
        }
    }
}

impl Default for BandwidthAdapter {
    fn default() -> Self {
        BandwidthAdapter::new()
    }
}

/// A finished, ready-to-transmit voice frame plus the sequence number and
/// terminator bit a caller attaches to its wire encoding.
pub struct EncodedFrame {
    pub opus_data: Vec<u8>,
    pub is_terminator: bool,
}

/// Drives the periodic mix -> encode cycle. Owns the Opus encoder and the
/// running voice sequence number; does not own the transport.
pub struct Scheduler {
    output: OutputSignal,
    encoder: audiopus::coder::Encoder,
    adapter: BandwidthAdapter,
    sequence: u64,
    was_producing: bool,
    pcm_scratch: Vec<i16>,
}

impl Scheduler {
    pub fn new(output: OutputSignal) -> Result<Self, audiopus::Error> {
        let encoder = audiopus::coder::Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;

        Ok(Scheduler {
            output,
            encoder,
            adapter: BandwidthAdapter::new(),
            sequence: 0,
            was_producing: false,
            pcm_scratch: Vec::new(),
        })
    }

    pub fn set_max_bandwidth(&mut self, max_bps: u32) {
        self.adapter.adapt(max_bps);
        let _ = self.encoder.set_bitrate(audiopus::Bitrate::BitsPerSecond(self.adapter.bitrate_bps() as i32));
        let _ = self.encoder.set_application(self.adapter.application());
    }

    pub fn frame_size(&self) -> FrameSize {
        self.adapter.frame_size()
    }

    /// Overrides the starting frame size before any ServerSync/bandwidth
    /// negotiation has happened, per a caller-supplied hint.
    pub fn set_frame_size(&mut self, frame_size: FrameSize) {
        self.adapter.set_frame_size(frame_size);
    }

    /// Mixes and encodes exactly one tick's worth of audio. Returns `None`
    /// when there is nothing to send and nothing was being sent last tick
    /// (no end-of-speech boundary to flush).
    pub fn tick(&mut self) -> Option<EncodedFrame> {
        let frames = self.adapter.frame_size().samples_per_frame(48_000);

        self.pcm_scratch.clear();
        self.pcm_scratch.reserve(frames * 2);

        let mut is_empty = true;
        for _ in 0..frames {
            let frame = self.output.next();
            for sample in frame {
                let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                if pcm != 0 {
                    is_empty = false;
                }
                self.pcm_scratch.push(pcm);
            }
        }

        let producing_this_tick = !is_empty;
        let boundary = self.was_producing && !producing_this_tick;
        self.was_producing = producing_this_tick;

        if !producing_this_tick && !boundary {
            return None;
        }

        let mut opus_buf = vec![0u8; 4000];
        let len = match self.encoder.encode(&self.pcm_scratch, &mut opus_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!("opus encode failed: {}", e);
                return None;
            }
        };
        opus_buf.truncate(len);

        self.sequence = self.sequence.wrapping_add(1);

        Some(EncodedFrame { opus_data: opus_buf, is_terminator: boundary })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The graph node other inputs should route into (via
    /// `Core::add_input_to`) to have their audio mixed into what this
    /// scheduler encodes and sends.
    pub fn output_node(&self) -> NodeIndex {
        self.output.node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_adaptation_stays_under_cap() {
        let mut adapter = BandwidthAdapter::new();
        adapter.adapt(16_000);
        assert!(adapter.estimated_cost_bps() <= 16_000 || adapter.bitrate_bps() == BITRATE_FLOOR_BPS);
    }

    #[test]
    fn coarsening_order_is_10_20_40() {
        assert_eq!(FrameSize::Ms10.coarsen(), Some(FrameSize::Ms20));
        assert_eq!(FrameSize::Ms20.coarsen(), Some(FrameSize::Ms40));
        assert_eq!(FrameSize::Ms40.coarsen(), None);
    }

    #[test]
    fn application_mode_follows_bitrate_thresholds() {
        let mut adapter = BandwidthAdapter::new();
        adapter.bitrate_bps = 64_000;
        assert!(matches!(adapter.application(), Application::LowDelay));
        adapter.bitrate_bps = 32_000;
        assert!(matches!(adapter.application(), Application::Audio));
        adapter.bitrate_bps = 8_000;
        assert!(matches!(adapter.application(), Application::Voip));
    }
}
