//! Player core: lock-free ring buffer, state fade, and the
//! scheduler/decoder/output-callback thread model.
//!
//! Grounded in `fsp_player.c`'s `fsp_scheduler_thread` /
//! `fsp_decoder_thread` / `fsp_on_process`, with ring-buffer transport
//! taken from the `ringbuf` crate (lock-free SPSC) rather than the
//! teacher's `Mutex<VecDeque<AudioQueueEntry>>`, since the spec requires
//! a true lock-free ring buffer that is never mutex-guarded or resized.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};
use thiserror::Error;

use crate::audio_decoder::{AudiofileContext, PipelineError, ResamplerQuality, TARGET_CHANNELS, TARGET_SAMPLE_RATE};
use crate::media::{load_audio_file_info, AudioFileInfo};
use crate::model::{Fader, StateFade};
use crate::schedule::{self, DrawnTrack};
use crate::config::Config;

/// Capacity in bytes: 4 seconds of 48kHz stereo f32 audio, per spec §3.
const RING_BUFFER_CAPACITY_BYTES: usize = 4 * 48_000 * 2 * 4;
const BYTES_PER_FRAME: usize = TARGET_CHANNELS * std::mem::size_of::<f32>();

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("no audio output device available")]
    NoOutputDevice,
    #[error("failed to build output stream: {0}")]
    StreamBuild(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    StreamPlay(#[from] cpal::PlayStreamError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("media error: {0}")]
    Media(#[from] crate::media::MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerState {
    Stopped = 0,
    Starting = 1,
    Playing = 2,
    Pausing = 3,
    Paused = 4,
    Resuming = 5,
    Stopping = 6,
}

impl PlayerState {
    fn from_u8(v: u8) -> PlayerState {
        match v {
            0 => PlayerState::Stopped,
            1 => PlayerState::Starting,
            2 => PlayerState::Playing,
            3 => PlayerState::Pausing,
            4 => PlayerState::Paused,
            5 => PlayerState::Resuming,
            _ => PlayerState::Stopping,
        }
    }
}

/// Ring buffer producer/consumer handles, wired to the decoder (write
/// side) and the output callback (read side). `mlock`ed once, on
/// construction, and never resized for the life of the `Player`.
struct RingBuffer {
    producer: ringbuf::HeapProd<f32>,
    consumer: ringbuf::HeapCons<f32>,
}

/// Locks the ring buffer's own backing pages in memory, per spec §3/§5.
/// Must run immediately after `split()`, while the buffer is still empty,
/// so `vacant_slices_mut` hands back the whole allocation as one or two
/// contiguous regions rather than whatever happens to be unoccupied mid
/// stream.
fn mlock_ring_buffer(producer: &mut ringbuf::HeapProd<f32>) {
    #[cfg(unix)]
    {
        use ringbuf::traits::Producer;
        let (a, b) = producer.vacant_slices_mut();
        for slice in [a, b] {
            if slice.is_empty() {
                continue;
            }
            let len = std::mem::size_of_val(slice);
            let rc = unsafe { libc::mlock(slice.as_ptr() as *const libc::c_void, len) };
            if rc != 0 {
                warn!("mlock of ring buffer pages failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

fn new_ring_buffer() -> RingBuffer {
    use ringbuf::traits::Split;
    let capacity_frames = RING_BUFFER_CAPACITY_BYTES / BYTES_PER_FRAME * TARGET_CHANNELS;
    let rb = ringbuf::HeapRb::<f32>::new(capacity_frames);
    let (mut producer, consumer) = rb.split();
    mlock_ring_buffer(&mut producer);
    RingBuffer { producer, consumer }
}

struct FileSlot {
    current: Option<(AudioFileInfo, AudiofileContext)>,
    next: Option<(AudioFileInfo, AudiofileContext)>,
}

/// Shared rendezvous state between the scheduler and decoder threads:
/// one mutex, two condvars, short critical sections, no I/O held under
/// the lock beyond the decode call itself.
struct Rendezvous {
    file_mutex: Mutex<FileSlot>,
    scheduler_cv: Condvar,
    space_available_cv: Condvar,
}

pub struct Player {
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    rendezvous: Arc<Rendezvous>,
    config: Arc<Mutex<Config>>,
    volume: Arc<Mutex<f32>>,
    current_info: Arc<Mutex<Option<AudioFileInfo>>>,
    next_info: Arc<Mutex<Option<AudioFileInfo>>>,
    current_started_at: Arc<Mutex<Option<SystemTime>>>,
    threads: Vec<JoinHandle<()>>,
    stream: Option<cpal::Stream>,
}

impl Player {
    pub fn new(config: Config) -> Self {
        Player {
            state: Arc::new(AtomicU8::new(PlayerState::Stopped as u8)),
            running: Arc::new(AtomicBool::new(false)),
            rendezvous: Arc::new(Rendezvous {
                file_mutex: Mutex::new(FileSlot { current: None, next: None }),
                scheduler_cv: Condvar::new(),
                space_available_cv: Condvar::new(),
            }),
            config: Arc::new(Mutex::new(config)),
            volume: Arc::new(Mutex::new(1.0)),
            current_info: Arc::new(Mutex::new(None)),
            next_info: Arc::new(Mutex::new(None)),
            current_started_at: Arc::new(Mutex::new(None)),
            threads: Vec::new(),
            stream: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlayerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Idempotent start: a no-op unless the player is fully stopped.
    pub fn start(&mut self) -> Result<(), PlayerError> {
        if self.state() != PlayerState::Stopped {
            return Ok(());
        }
        self.set_state(PlayerState::Starting);
        self.running.store(true, Ordering::Release);

        let ring = new_ring_buffer();
        let RingBuffer { producer, consumer } = ring;

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(PlayerError::NoOutputDevice)?;
        let stream_config = cpal::StreamConfig {
            channels: TARGET_CHANNELS as u16,
            sample_rate: cpal::SampleRate(TARGET_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Fixed(1024),
        };

        let state_for_cb = self.state.clone();
        let rendezvous_for_cb = self.rendezvous.clone();
        let mut consumer = consumer;
        let mut state_fade = StateFade::default();
        let prev_state_for_cb = Arc::new(AtomicU8::new(PlayerState::Stopped as u8));

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                render_output_buffer(
                    data,
                    &mut consumer,
                    &state_for_cb,
                    &prev_state_for_cb,
                    &mut state_fade,
                    &rendezvous_for_cb,
                );
            },
            move |err| error!("audio output stream error: {err}"),
            None,
        )?;
        stream.play()?;
        self.stream = Some(stream);

        self.threads.push(spawn_scheduler_thread(
            self.config.clone(),
            self.rendezvous.clone(),
            self.running.clone(),
            self.current_info.clone(),
            self.next_info.clone(),
            self.current_started_at.clone(),
        ));
        self.threads.push(spawn_decoder_thread(
            self.rendezvous.clone(),
            self.running.clone(),
            producer,
            self.current_info.clone(),
            self.next_info.clone(),
            self.current_started_at.clone(),
        ));

        self.set_state(PlayerState::Playing);
        Ok(())
    }

    /// Idempotent stop: a no-op unless the player is running or
    /// transitioning. Joins every spawned thread before returning.
    pub fn stop(&mut self) {
        if self.state() == PlayerState::Stopped || self.state() == PlayerState::Stopping {
            return;
        }
        self.set_state(PlayerState::Stopping);
        self.running.store(false, Ordering::Release);
        self.rendezvous.scheduler_cv.notify_all();
        self.rendezvous.space_available_cv.notify_all();
        self.stream.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.set_state(PlayerState::Stopped);
    }

    pub fn pause(&self) {
        if self.state() == PlayerState::Playing {
            self.set_state(PlayerState::Pausing);
        }
    }

    pub fn resume(&self) {
        if self.state() == PlayerState::Paused {
            self.set_state(PlayerState::Resuming);
        }
    }

    /// Returns `(current, next, elapsed_secs)`. `elapsed_secs` is derived
    /// from the wall-clock time since the current track was promoted,
    /// which is accurate enough for the metadata endpoint's once-a-second
    /// cache refresh without needing the decoder thread to publish a
    /// sample-accurate counter across threads.
    pub fn snapshot(&self) -> (Option<AudioFileInfo>, Option<AudioFileInfo>, u32) {
        let elapsed = self
            .current_started_at
            .lock()
            .unwrap()
            .and_then(|started| SystemTime::now().duration_since(started).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        (
            self.current_info.lock().unwrap().clone(),
            self.next_info.lock().unwrap().clone(),
            elapsed,
        )
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Computes how much of the currently-playing track is left, from its
/// declared duration and when it was promoted to `current`. Zero once the
/// track has already run past its own duration (or nothing is playing).
fn remaining_duration_of_current(
    current_info: &Mutex<Option<AudioFileInfo>>,
    current_started_at: &Mutex<Option<SystemTime>>,
) -> Duration {
    let Some(info) = current_info.lock().unwrap().clone() else {
        return Duration::ZERO;
    };
    let Some(started_at) = *current_started_at.lock().unwrap() else {
        return Duration::ZERO;
    };
    let elapsed = SystemTime::now().duration_since(started_at).unwrap_or(Duration::ZERO);
    Duration::from_secs(info.duration_secs).saturating_sub(elapsed)
}

/// Scheduler thread: keeps `current`/`next` populated ahead of the
/// decoder's needs. Computes `sched_time` as `now + remaining_duration(current)`
/// *before* asking the schedule engine for the next track, so a zone
/// boundary falling inside the current track's remaining runtime draws
/// from the zone that will actually be active once that track ends, per
/// §2/§4.6's `T = now + duration(current)`.
fn spawn_scheduler_thread(
    config: Arc<Mutex<Config>>,
    rendezvous: Arc<Rendezvous>,
    running: Arc<AtomicBool>,
    current_info: Arc<Mutex<Option<AudioFileInfo>>>,
    next_info: Arc<Mutex<Option<AudioFileInfo>>>,
    current_started_at: Arc<Mutex<Option<SystemTime>>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                let remaining = remaining_duration_of_current(&current_info, &current_started_at);
                let sched_time = chrono::Local::now()
                    + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero());
                let loaded = {
                    let mut cfg = config.lock().unwrap();
                    let _ = cfg.reload_if_changed();
                    schedule::current_zone_mut(&mut cfg.week_schedule, sched_time)
                        .and_then(|zone| schedule::next_track_in_zone(zone, SystemTime::now()))
                };

                let Some(track) = loaded else {
                    thread::sleep(Duration::from_millis(200));
                    continue;
                };

                match load_and_open(&track) {
                    Ok((info, ctx)) => {
                        let mut slot = rendezvous.file_mutex.lock().unwrap();
                        if slot.current.is_none() {
                            *current_info.lock().unwrap() = Some(info.clone());
                            *current_started_at.lock().unwrap() = Some(SystemTime::now());
                            slot.current = Some((info, ctx));
                        } else if slot.next.is_none() {
                            *next_info.lock().unwrap() = Some(info.clone());
                            slot.next = Some((info, ctx));
                        }
                        drop(slot);
                        rendezvous.space_available_cv.notify_all();
                    }
                    Err(e) => {
                        warn!("skipping unplayable track {}: {e}", track.path.display());
                        continue;
                    }
                }

                let wait_result = {
                    let slot = rendezvous.file_mutex.lock().unwrap();
                    rendezvous
                        .scheduler_cv
                        .wait_timeout(slot, Duration::from_millis(500))
                        .unwrap()
                };
                drop(wait_result);
            }
        })
        .expect("failed to spawn scheduler thread")
}

/// Probes a drawn track in strict mode (per §4.4's "probe via Media
/// loader (strict mode)") and finalizes its [`Fader`] from the owning
/// zone's declared fade durations against the track's now-known
/// duration, per `fsp_fader_setup`.
fn load_and_open(track: &DrawnTrack) -> Result<(AudioFileInfo, AudiofileContext), PlayerError> {
    let mut info = load_audio_file_info(&track.path, &track.zone_name, Fader::default(), true)?;
    info.fader = Fader::from_durations(
        track.fader_spec.fade_in_secs,
        track.fader_spec.fade_out_secs,
        info.duration_secs as f32,
        TARGET_SAMPLE_RATE as f32,
        track.fader_spec.min_level,
        track.fader_spec.max_level,
    );
    let ctx = AudiofileContext::open(&info, ResamplerQuality::High)?;
    Ok((info, ctx))
}

/// Decoder thread: waits for ring-buffer space, extracts frames from the
/// current track under `file_mutex`, promotes `next` -> `current` when
/// the current track finishes, and writes extracted frames into the
/// lock-free ring buffer.
fn spawn_decoder_thread(
    rendezvous: Arc<Rendezvous>,
    running: Arc<AtomicBool>,
    mut producer: ringbuf::HeapProd<f32>,
    current_info: Arc<Mutex<Option<AudioFileInfo>>>,
    next_info: Arc<Mutex<Option<AudioFileInfo>>>,
    current_started_at: Arc<Mutex<Option<SystemTime>>>,
) -> JoinHandle<()> {
    use ringbuf::traits::Producer;

    thread::Builder::new()
        .name("decoder".into())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                let frames = {
                    let mut slot = rendezvous.file_mutex.lock().unwrap();
                    let out = match &mut slot.current {
                        Some((_, ctx)) => ctx.extract_frames(4096).unwrap_or_default(),
                        None => Vec::new(),
                    };
                    if let Some((_, ctx)) = &slot.current {
                        if ctx.is_finished() {
                            if slot.next.is_some() {
                                slot.current = slot.next.take();
                                *current_info.lock().unwrap() = slot.current.as_ref().map(|(info, _)| info.clone());
                                *next_info.lock().unwrap() = None;
                                *current_started_at.lock().unwrap() = Some(SystemTime::now());
                                rendezvous.scheduler_cv.notify_all();
                            } else {
                                slot.current = None;
                                *current_info.lock().unwrap() = None;
                            }
                        }
                    }
                    out
                };

                if frames.is_empty() {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }

                let mut remaining: &[f32] = &frames;
                while !remaining.is_empty() && running.load(Ordering::Acquire) {
                    let written = producer.push_slice(remaining);
                    remaining = &remaining[written..];
                    if !remaining.is_empty() {
                        let slot = rendezvous.file_mutex.lock().unwrap();
                        let _ = rendezvous
                            .space_available_cv
                            .wait_timeout(slot, Duration::from_millis(5))
                            .unwrap();
                    }
                }
            }
        })
        .expect("failed to spawn decoder thread")
}

/// Output callback core (runs on cpal's real-time thread). Never blocks:
/// emits silence on underrun or while not playing, applies the state
/// fade when pausing/resuming, and signals `space_available_cv` after
/// draining frames so the decoder can refill.
fn render_output_buffer(
    data: &mut [f32],
    consumer: &mut ringbuf::HeapCons<f32>,
    state: &AtomicU8,
    prev_state: &AtomicU8,
    state_fade: &mut StateFade,
    rendezvous: &Rendezvous,
) {
    use ringbuf::traits::Consumer;

    let current = PlayerState::from_u8(state.load(Ordering::Acquire));
    let previous = PlayerState::from_u8(prev_state.load(Ordering::Acquire));

    if previous != PlayerState::Pausing && current == PlayerState::Pausing {
        state_fade.start(false);
    }
    if previous != PlayerState::Resuming && current == PlayerState::Resuming {
        state_fade.start(true);
    }
    prev_state.store(current as u8, Ordering::Release);

    match current {
        PlayerState::Stopped | PlayerState::Paused | PlayerState::Starting | PlayerState::Stopping => {
            data.fill(0.0);
            return;
        }
        _ => {}
    }

    let read = consumer.pop_slice(data);
    if read < data.len() {
        if current == PlayerState::Playing {
            warn!("ring buffer underrun: wanted {} frames, got {read}", data.len());
        }
        data[read..].fill(0.0);
    }
    rendezvous.space_available_cv.notify_all();

    if state_fade.is_active() || current == PlayerState::Pausing || current == PlayerState::Resuming {
        let frames = (data.len() / TARGET_CHANNELS) as u32;
        let gain = state_fade.step(frames.max(1));
        for sample in data.iter_mut() {
            *sample *= gain;
        }
        if !state_fade.is_active() {
            if current == PlayerState::Pausing {
                state.store(PlayerState::Paused as u8, Ordering::Release);
            } else if current == PlayerState::Resuming {
                state.store(PlayerState::Playing as u8, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for s in [
            PlayerState::Stopped,
            PlayerState::Starting,
            PlayerState::Playing,
            PlayerState::Pausing,
            PlayerState::Paused,
            PlayerState::Resuming,
            PlayerState::Stopping,
        ] {
            assert_eq!(PlayerState::from_u8(s as u8), s);
        }
    }
}
