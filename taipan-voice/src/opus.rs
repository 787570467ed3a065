//! Opus encoder binding.
//!
//! A thin wrapper over the native libopus encoder via `audiopus`, fixed to
//! the voice gateway's media format: 48 kHz stereo, 20 ms frames of
//! interleaved s16le PCM. The native encoder state is destroyed on drop.

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bandwidth, Bitrate, Channels, SampleRate, Signal};

use crate::error::VoiceError;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const FRAME_LENGTH_MS: u32 = 20;

/// Bytes per interleaved stereo s16 sample.
const SAMPLE_SIZE: usize = 4;

const DEFAULT_BITRATE_KBPS: i32 = 64;

/// Upper bound for one encoded frame; real frames are far smaller.
const MAX_OPUS_FRAME: usize = 4000;

/// PCM to opus encoder with the gateway's fixed parameters.
pub struct Encoder {
    state: OpusEncoder,
    bitrate_kbps: i32,
    expected_packet_loss: f32,
}

impl Encoder {
    /// Create an encoder with the default tuning: 64 kbps, FEC on, no
    /// expected loss, full bandwidth, automatic signal detection.
    pub fn new() -> Result<Self, VoiceError> {
        let state = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        let mut encoder = Self {
            state,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            expected_packet_loss: 0.0,
        };

        encoder.set_bitrate(DEFAULT_BITRATE_KBPS)?;
        encoder.set_fec(true)?;
        encoder.set_expected_packet_loss(0.0)?;
        encoder.set_bandwidth(Bandwidth::Fullband)?;
        encoder.set_signal_type(Signal::Auto)?;
        Ok(encoder)
    }

    /// Set the bitrate in kbps, clamped to [16, 512].
    pub fn set_bitrate(&mut self, kbps: i32) -> Result<(), VoiceError> {
        self.bitrate_kbps = kbps.clamp(16, 512);
        self.state
            .set_bitrate(Bitrate::BitsPerSec(self.bitrate_kbps * 1024))?;
        Ok(())
    }

    pub fn bitrate(&self) -> i32 {
        self.bitrate_kbps
    }

    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) -> Result<(), VoiceError> {
        self.state.set_bandwidth(bandwidth)?;
        Ok(())
    }

    pub fn set_signal_type(&mut self, signal: Signal) -> Result<(), VoiceError> {
        self.state.set_signal(signal)?;
        Ok(())
    }

    /// Enable or disable forward error correction.
    pub fn set_fec(&mut self, enabled: bool) -> Result<(), VoiceError> {
        self.state.set_inband_fec(enabled)?;
        Ok(())
    }

    /// Expected packet loss as a fraction in [0, 1].
    pub fn set_expected_packet_loss(&mut self, fraction: f32) -> Result<(), VoiceError> {
        self.expected_packet_loss = fraction.clamp(0.0, 1.0);
        self.state
            .set_packet_loss_perc((self.expected_packet_loss * 100.0) as u8)?;
        Ok(())
    }

    pub fn expected_packet_loss(&self) -> f32 {
        self.expected_packet_loss
    }

    /// Samples per channel covered by one frame.
    pub fn samples_per_frame(&self) -> usize {
        (SAMPLE_RATE / 1000 * FRAME_LENGTH_MS) as usize
    }

    /// Bytes of interleaved s16le stereo PCM in one frame.
    pub fn frame_size(&self) -> usize {
        self.samples_per_frame() * SAMPLE_SIZE
    }

    /// Frame duration in seconds.
    pub fn delay(&self) -> f64 {
        f64::from(FRAME_LENGTH_MS) / 1000.0
    }

    /// Encode one frame of interleaved s16le PCM into an opus packet.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, VoiceError> {
        if pcm.len() != self.frame_size() {
            return Err(VoiceError::BadPcmFrame {
                expected: self.frame_size(),
                got: pcm.len(),
            });
        }

        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let mut output = vec![0u8; MAX_OPUS_FRAME];
        let written = self.state.encode(&samples, &mut output)?;
        output.truncate(written);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_arithmetic_matches_the_media_format() {
        let encoder = Encoder::new().unwrap();
        assert_eq!(encoder.samples_per_frame(), 960);
        assert_eq!(encoder.frame_size(), 3840);
        assert!((encoder.delay() - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn bitrate_is_clamped() {
        let mut encoder = Encoder::new().unwrap();

        encoder.set_bitrate(1024).unwrap();
        assert_eq!(encoder.bitrate(), 512);

        encoder.set_bitrate(1).unwrap();
        assert_eq!(encoder.bitrate(), 16);

        encoder.set_bitrate(128).unwrap();
        assert_eq!(encoder.bitrate(), 128);
    }

    #[test]
    fn encodes_a_full_frame_of_silence() {
        let mut encoder = Encoder::new().unwrap();
        let pcm = vec![0u8; encoder.frame_size()];

        let packet = encoder.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < pcm.len());
    }

    #[test]
    fn wrong_sized_pcm_is_refused() {
        let mut encoder = Encoder::new().unwrap();
        let err = encoder.encode(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            VoiceError::BadPcmFrame { expected: 3840, got: 100 }
        ));
    }

    #[test]
    fn tuning_knobs_accept_their_ranges() {
        let mut encoder = Encoder::new().unwrap();
        encoder.set_bandwidth(Bandwidth::Wideband).unwrap();
        encoder.set_signal_type(Signal::Music).unwrap();
        encoder.set_fec(false).unwrap();
        encoder.set_expected_packet_loss(0.15).unwrap();
        assert!((encoder.expected_packet_loss() - 0.15).abs() < f32::EPSILON);
    }
}
