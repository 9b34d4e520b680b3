//! Per-track decode/resample session: demuxing and decoding via
//! `symphonia`, resampling to the player's target format via `rubato`,
//! and applying the per-track [`Fader`] and ReplayGain at extraction
//! time. Grounded in the teacher's `audio_decoder.rs` resampler-quality
//! tiers and channel-transform helpers, and in `fsp_player.c`'s
//! `fsp_extract_frames` for the fade/gain application order.

use log::{error, warn};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::media::AudioFileInfo;
use crate::model::{replaygain_linear, Fader};

pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const TARGET_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplerQuality {
    High,
    Highest,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open {0}: {1}")]
    Open(std::path::PathBuf, std::io::Error),
    #[error("no playable audio stream in {0}")]
    NoAudioTrack(std::path::PathBuf),
    #[error("decoder init failed for {0}: {1}")]
    DecoderInit(std::path::PathBuf, SymphoniaError),
    #[error("resampler init failed for {0}: {1}")]
    ResamplerInit(std::path::PathBuf, String),
    #[error("too many consecutive decode errors in {0}")]
    TooManyDecodeErrors(std::path::PathBuf),
}

fn sinc_params(quality: ResamplerQuality) -> SincInterpolationParameters {
    match quality {
        ResamplerQuality::High => SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        ResamplerQuality::Highest => SincInterpolationParameters {
            sinc_len: 512,
            f_cutoff: 0.97,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
    }
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let mut out = vec![Vec::with_capacity(samples.len() / channels.max(1)); channels];
    for (i, sample) in samples.iter().enumerate() {
        out[i % channels].push(*sample);
    }
    out
}

fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    if channels.is_empty() {
        return Vec::new();
    }
    let frames = channels[0].len();
    let mut out = Vec::with_capacity(frames * channels.len());
    for i in 0..frames {
        for ch in channels {
            out.push(ch[i]);
        }
    }
    out
}

/// A bounded extraction session over a single track. Owned exclusively by
/// the decoder thread; never shared.
pub struct AudiofileContext {
    path: std::path::PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    source_sample_rate: u32,
    source_channels: usize,
    resampler: Option<SincFixedIn<f32>>,
    resample_buffer: Vec<Vec<f32>>,
    input_exhausted: bool,
    resampler_flushed: bool,
    consecutive_decode_errors: u32,
    frames_emitted: u64,
    replay_gain: f32,
    fader: Fader,
    total_frames_estimate: u64,
}

impl AudiofileContext {
    pub fn open(info: &AudioFileInfo, quality: ResamplerQuality) -> Result<Self, PipelineError> {
        let path = info.path.clone();
        let file = std::fs::File::open(&path).map_err(|e| PipelineError::Open(path.clone(), e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|_| PipelineError::NoAudioTrack(path.clone()))?;
        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
            .ok_or_else(|| PipelineError::NoAudioTrack(path.clone()))?
            .clone();
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| PipelineError::DecoderInit(path.clone(), e))?;

        let source_sample_rate = track.codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);
        let source_channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(TARGET_CHANNELS);

        let resampler = if source_sample_rate != TARGET_SAMPLE_RATE {
            Some(
                SincFixedIn::<f32>::new(
                    TARGET_SAMPLE_RATE as f64 / source_sample_rate as f64,
                    2.0,
                    sinc_params(quality),
                    2048,
                    TARGET_CHANNELS,
                )
                .map_err(|e| PipelineError::ResamplerInit(path.clone(), e.to_string()))?,
            )
        } else {
            None
        };

        let replay_gain = replaygain_linear(info.track_gain_db, info.track_peak);

        Ok(AudiofileContext {
            path,
            format,
            decoder,
            track_id: track.id,
            source_sample_rate,
            source_channels,
            resampler,
            resample_buffer: vec![Vec::new(); TARGET_CHANNELS],
            input_exhausted: false,
            resampler_flushed: false,
            consecutive_decode_errors: 0,
            frames_emitted: 0,
            replay_gain,
            fader: info.fader,
            total_frames_estimate: info.duration_secs * TARGET_SAMPLE_RATE as u64,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.input_exhausted
            && self.resample_buffer.iter().all(Vec::is_empty)
            && (self.resampler.is_none() || self.resampler_flushed)
    }

    /// Pulls and decodes the next packet, applying channel remap and
    /// resampling, buffering the result for [`Self::extract_frames`].
    fn fill_resample_buffer(&mut self) -> Result<(), PipelineError> {
        if self.input_exhausted {
            return Ok(());
        }
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => {
                    self.input_exhausted = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}: error reading next packet: {e}", self.path.display());
                    self.input_exhausted = true;
                    return Ok(());
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.consecutive_decode_errors = 0;
                    let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                    sample_buf.copy_interleaved_ref(decoded);
                    let raw = sample_buf.samples();
                    let deinterleaved = deinterleave(raw, self.source_channels.max(1));
                    let remapped = remap_channels(&deinterleaved, TARGET_CHANNELS);
                    let resampled = match &mut self.resampler {
                        Some(resampler) => resampler
                            .process(&remapped, None)
                            .map_err(|e| PipelineError::ResamplerInit(self.path.clone(), e.to_string()))?,
                        None => remapped,
                    };
                    for (ch, samples) in self.resample_buffer.iter_mut().zip(resampled.into_iter()) {
                        ch.extend(samples);
                    }
                    return Ok(());
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    self.consecutive_decode_errors += 1;
                    warn!("{}: decode error: {msg}", self.path.display());
                    if self.consecutive_decode_errors > 50 {
                        return Err(PipelineError::TooManyDecodeErrors(self.path.clone()));
                    }
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder = symphonia::default::get_codecs()
                        .make(&self.decoder.codec_params().clone(), &DecoderOptions::default())
                        .map_err(|e| PipelineError::DecoderInit(self.path.clone(), e))?;
                    continue;
                }
                Err(SymphoniaError::IoError(_)) => {
                    self.input_exhausted = true;
                    return Ok(());
                }
                Err(e) => {
                    error!("{}: unrecoverable decode error: {e}", self.path.display());
                    self.input_exhausted = true;
                    return Ok(());
                }
            }
        }
    }

    /// Extracts up to `max_frames` stereo frames (interleaved L,R,...),
    /// with fader and ReplayGain gain already applied, per
    /// `fsp_extract_frames`. Returns fewer than requested only when the
    /// track is close to ending.
    pub fn extract_frames(&mut self, max_frames: usize) -> Result<Vec<f32>, PipelineError> {
        while self.resample_buffer[0].len() < max_frames && !self.input_exhausted {
            self.fill_resample_buffer()?;
        }
        if self.input_exhausted && self.resampler.is_some() && !self.resampler_flushed {
            if let Some(resampler) = &mut self.resampler {
                if let Ok(flushed) = resampler.process(&vec![Vec::new(); TARGET_CHANNELS], None) {
                    for (ch, samples) in self.resample_buffer.iter_mut().zip(flushed.into_iter()) {
                        ch.extend(samples);
                    }
                }
            }
            self.resampler_flushed = true;
        }

        let available = self.resample_buffer[0].len().min(max_frames);
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut channels: Vec<Vec<f32>> = self
            .resample_buffer
            .iter_mut()
            .map(|ch| ch.drain(..available).collect())
            .collect();

        self.apply_gain(&mut channels, available);
        self.frames_emitted += available as u64;
        Ok(interleave(&channels))
    }

    fn apply_gain(&mut self, channels: &mut [Vec<f32>], frames: usize) {
        let duration_frames = self.total_frames_estimate.max(1);
        for i in 0..frames {
            let pos = self.frames_emitted + i as u64;
            let fader_gain = self.fader_gain_at(pos, duration_frames);
            let gain = fader_gain * self.replay_gain;
            for ch in channels.iter_mut() {
                ch[i] *= gain;
            }
        }
    }

    /// Gain at `pos` frames into the track, ramping between
    /// `fader.min_level` and `fader.max_level` rather than a fixed 0..1
    /// range, per spec §3/§6's `MinLevel`/`MaxLevel` fader bounds.
    fn fader_gain_at(&self, pos: u64, duration_frames: u64) -> f32 {
        let span = self.fader.max_level - self.fader.min_level;
        let mut gain = self.fader.max_level;
        if self.fader.fade_in_active {
            let progress = ((pos as f32) * self.fader.fade_in_slope).clamp(0.0, 1.0);
            gain = gain.min(self.fader.min_level + progress * span);
        }
        if self.fader.fade_out_active {
            let remaining = duration_frames.saturating_sub(pos);
            let progress = ((remaining as f32) * self.fader.fade_out_slope).clamp(0.0, 1.0);
            gain = gain.min(self.fader.min_level + progress * span);
        }
        gain.clamp(self.fader.min_level, self.fader.max_level)
    }
}

/// Simple channel count remap: sums down to mono, duplicates up to
/// stereo/beyond. A full loudness-aware downmix (as the teacher does via
/// `audio_mixer::Mixer` for >2 source channels) is out of scope for a
/// player whose target output is fixed stereo, but the mixer crate stays
/// available for zones that declare wider source material.
fn remap_channels(source: &[Vec<f32>], target_channels: usize) -> Vec<Vec<f32>> {
    if source.len() == target_channels {
        return source.to_vec();
    }
    let frames = source.first().map(Vec::len).unwrap_or(0);
    if source.len() > target_channels && target_channels > 0 {
        use audio_mixer::{Channel as MixChannel, Mixer};
        let input_layout: Vec<MixChannel> = channel_layout_for_count(source.len());
        let output_layout: Vec<MixChannel> = channel_layout_for_count(target_channels);
        let mut mixer = Mixer::new(input_layout, output_layout);
        let mut out = vec![Vec::with_capacity(frames); target_channels];
        for frame_idx in 0..frames {
            let frame: Vec<f32> = source.iter().map(|ch| ch[frame_idx]).collect();
            let mut output_frame = vec![0.0f32; target_channels];
            mixer.mix(&frame, &mut output_frame);
            for (ch, sample) in out.iter_mut().zip(output_frame) {
                ch.push(sample);
            }
        }
        out
    } else {
        // Fewer source channels than target: duplicate the last channel.
        let mut out = Vec::with_capacity(target_channels);
        for i in 0..target_channels {
            out.push(source.get(i).cloned().unwrap_or_else(|| source.last().cloned().unwrap_or_default()));
        }
        out
    }
}

fn channel_layout_for_count(count: usize) -> Vec<audio_mixer::Channel> {
    use audio_mixer::Channel as MixChannel;
    match count {
        1 => vec![MixChannel::FrontCenter],
        2 => vec![MixChannel::FrontLeft, MixChannel::FrontRight],
        _ => (0..count).map(|_| MixChannel::FrontCenter).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deinterleave_then_interleave_round_trips() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let channels = deinterleave(&samples, 2);
        assert_eq!(channels, vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]]);
        assert_eq!(interleave(&channels), samples);
    }

    #[test]
    fn remap_identity_when_channel_count_matches() {
        let stereo = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let out = remap_channels(&stereo, 2);
        assert_eq!(out, stereo);
    }

    #[test]
    fn remap_mono_to_stereo_duplicates_channel() {
        let mono = vec![vec![1.0, 2.0, 3.0]];
        let out = remap_channels(&mono, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], out[1]);
    }
}
