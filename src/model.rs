//! Small value types shared across the scheduler, decoder and player.

/// Per-track fade envelope. An all-zero-slope `Fader` (the `Default`)
/// means "no fader" — the decoder skips the gain ramp entirely rather
/// than treating it as an instant fade. `min_level`/`max_level` bound the
/// ramp: fade-in rises from `min_level` to `max_level`, fade-out falls
/// from `max_level` back down to `min_level`, per spec §3/§6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fader {
    pub fade_in_slope: f32,
    pub fade_out_slope: f32,
    pub fade_in_active: bool,
    pub fade_out_active: bool,
    pub min_level: f32,
    pub max_level: f32,
}

impl Default for Fader {
    fn default() -> Self {
        Fader {
            fade_in_slope: 0.0,
            fade_out_slope: 0.0,
            fade_in_active: false,
            fade_out_active: false,
            min_level: 0.0,
            max_level: 1.0,
        }
    }
}

impl Fader {
    pub fn is_empty(&self) -> bool {
        self.fade_in_slope == 0.0 && self.fade_out_slope == 0.0
    }

    /// Builds the per-track fader from configured fade durations, levels
    /// and the track's own duration, per `fsp_fader_setup`. A fade whose
    /// duration is zero, negative, or at least as long as the track
    /// itself is not set up at all.
    pub fn from_durations(
        fadein_secs: f32,
        fadeout_secs: f32,
        duration_secs: f32,
        sample_rate: f32,
        min_level: f32,
        max_level: f32,
    ) -> Self {
        let mut fader = Fader {
            min_level,
            max_level,
            ..Fader::default()
        };
        if fadein_secs > 0.0 && fadein_secs < duration_secs {
            fader.fade_in_slope = 1.0 / (sample_rate * fadein_secs);
            fader.fade_in_active = true;
        }
        if fadeout_secs > 0.0 && fadeout_secs < duration_secs {
            fader.fade_out_slope = 1.0 / (sample_rate * fadeout_secs);
            fader.fade_out_active = true;
        }
        fader
    }
}

/// Declared (not yet applied) fade durations and gain bounds, carried from
/// the config loader through to the playlist that owns them, and from
/// there to the media loader, which finalizes them into a [`Fader`] once
/// a track's actual duration is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaderSpec {
    pub fade_in_secs: f32,
    pub fade_out_secs: f32,
    pub min_level: f32,
    pub max_level: f32,
}

impl Default for FaderSpec {
    fn default() -> Self {
        FaderSpec {
            fade_in_secs: 0.0,
            fade_out_secs: 0.0,
            min_level: 0.0,
            max_level: 1.0,
        }
    }
}

/// Linearizes ReplayGain tags into a single multiplicative gain, per
/// `fsp_replaygain_setup`. Missing tags behave as unity gain / no limit.
pub fn replaygain_linear(track_gain_db: Option<f32>, track_peak: Option<f32>) -> f32 {
    let replay_gain = track_gain_db.map(|db| 10f32.powf(db / 20.0)).unwrap_or(1.0);
    let gain_limit = match track_peak {
        Some(peak) if peak != 0.0 => 1.0 / peak,
        _ => 1.0,
    };
    replay_gain.min(gain_limit)
}

/// Global pause/resume fade envelope: a fixed 2-second (96,000 sample at
/// 48kHz) linear ramp applied across the whole mix, independent of the
/// per-track [`Fader`].
pub const STATE_FADE_TOTAL_SAMPLES: u32 = 96_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateFade {
    active: bool,
    fade_in: bool,
    samples_out: u32,
    slope: f32,
    gain: f32,
}

impl Default for StateFade {
    fn default() -> Self {
        StateFade {
            active: false,
            fade_in: true,
            samples_out: 0,
            slope: 1.0 / STATE_FADE_TOTAL_SAMPLES as f32,
            gain: 1.0,
        }
    }
}

impl StateFade {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Arms the fade. `fade_in == true` ramps 0.0 -> 1.0 (resume);
    /// `fade_in == false` ramps 1.0 -> 0.0 (pause).
    pub fn start(&mut self, fade_in: bool) {
        self.active = true;
        self.fade_in = fade_in;
        self.samples_out = 0;
        self.gain = if fade_in { 0.0 } else { 1.0 };
    }

    /// Advances the fade by `frames` samples, returning the gain to apply
    /// across this callback. Snaps to the terminal gain and deactivates
    /// once the ramp completes.
    pub fn step(&mut self, frames: u32) -> f32 {
        if !self.active {
            return if self.fade_in { 1.0 } else { 0.0 };
        }
        let gain_now = self.gain;
        self.samples_out += frames;
        if self.samples_out >= STATE_FADE_TOTAL_SAMPLES {
            self.active = false;
            self.gain = if self.fade_in { 1.0 } else { 0.0 };
        } else {
            let delta = self.slope * frames as f32;
            self.gain = if self.fade_in {
                (self.gain + delta).min(1.0)
            } else {
                (self.gain - delta).max(0.0)
            };
        }
        gain_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fader_is_empty() {
        assert!(Fader::default().is_empty());
    }

    #[test]
    fn fader_not_set_up_when_longer_than_track() {
        let fader = Fader::from_durations(10.0, 0.0, 5.0, 48_000.0, 0.0, 1.0);
        assert!(!fader.fade_in_active);
        assert!(fader.is_empty());
    }

    #[test]
    fn fader_slope_matches_formula() {
        let fader = Fader::from_durations(2.0, 0.0, 10.0, 48_000.0, 0.0, 1.0);
        assert!(fader.fade_in_active);
        assert!((fader.fade_in_slope - 1.0 / (48_000.0 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn fader_carries_min_max_level() {
        let fader = Fader::from_durations(2.0, 3.0, 10.0, 48_000.0, 0.1, 0.9);
        assert_eq!(fader.min_level, 0.1);
        assert_eq!(fader.max_level, 0.9);
    }

    #[test]
    fn replaygain_worked_example_from_spec() {
        // +6dB, peak 0.8 -> raw gain ~1.995, limit 1.25, effective 1.25.
        let gain = replaygain_linear(Some(6.0), Some(0.8));
        assert!((gain - 1.25).abs() < 1e-3);
    }

    #[test]
    fn replaygain_missing_peak_is_unity_limit() {
        let gain = replaygain_linear(Some(0.0), None);
        assert!((gain - 1.0).abs() < 1e-6);
    }

    #[test]
    fn replaygain_zero_peak_is_unity_limit() {
        let gain = replaygain_linear(Some(20.0), Some(0.0));
        assert!((gain - 1.0).abs() < 1e-6);
    }

    #[test]
    fn state_fade_reaches_terminal_gain_and_deactivates() {
        let mut fade = StateFade::default();
        fade.start(false); // pause: 1.0 -> 0.0
        let mut last = 1.0;
        while fade.is_active() {
            last = fade.step(4096);
        }
        assert!(last >= 0.0);
        assert!(!fade.is_active());
    }
}
