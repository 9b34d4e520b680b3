//! XML `WeekSchedule` config loading and mtime-triggered reload.
//!
//! Schema: a root element with exactly seven day-named children
//! (`Sun`...`Sat`, each optional/empty-by-default), each holding the
//! `Zone` elements active that day — grounded in `cfg_handler.c`, which
//! walks the same seven nested day subtrees rather than a flat zone list.
//! `Path`/`Shuffle`/fader fields are child elements with text content,
//! not attributes, again matching `cfg_handler.c`'s use of
//! `xmlNodeListGetString` over `xmlGetProp` for those fields.
//!
//! ```xml
//! <WeekSchedule>
//!   <Mon>
//!     <Zone Name="Morning Drive" Start="06:00:00">
//!       <Main>
//!         <Path>playlists/morning.m3u</Path>
//!         <Shuffle>true</Shuffle>
//!         <Fader>
//!           <FadeInDurationSecs>2.0</FadeInDurationSecs>
//!           <FadeOutDurationSecs>2.0</FadeOutDurationSecs>
//!           <MinLevel>0.0</MinLevel>
//!           <MaxLevel>1.0</MaxLevel>
//!         </Fader>
//!       </Main>
//!       <Fallback><Path>playlists/fallback.m3u</Path></Fallback>
//!       <Intermediate Name="Station ID">
//!         <Path>playlists/station-id.pls</Path>
//!         <SchedIntervalMins>15</SchedIntervalMins>
//!         <NumSchedItems>1</NumSchedItems>
//!       </Intermediate>
//!     </Zone>
//!   </Mon>
//! </WeekSchedule>
//! ```

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use thiserror::Error;

use crate::model::FaderSpec;
use crate::playlist::{IntermediatePlaylist, Playlist, PlaylistError};
use crate::util;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not readable: {0}")]
    NotReadable(PathBuf),
    #[error("io error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config xml: {0}")]
    Xml(#[from] quick_xml::de::DeError),
    #[error("invalid zone start time {0:?}: {1}")]
    BadStartTime(String, chrono::format::ParseError),
    #[error("zone {0:?} references playlist that failed to load: {1}")]
    ZonePlaylist(String, PlaylistError),
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename = "WeekSchedule")]
struct RawWeekSchedule {
    #[serde(rename = "Sun", default)]
    sun: RawDay,
    #[serde(rename = "Mon", default)]
    mon: RawDay,
    #[serde(rename = "Tue", default)]
    tue: RawDay,
    #[serde(rename = "Wed", default)]
    wed: RawDay,
    #[serde(rename = "Thu", default)]
    thu: RawDay,
    #[serde(rename = "Fri", default)]
    fri: RawDay,
    #[serde(rename = "Sat", default)]
    sat: RawDay,
}

#[derive(Debug, Deserialize, Default)]
struct RawDay {
    #[serde(rename = "Zone", default)]
    zones: Vec<RawZone>,
}

#[derive(Debug, Deserialize)]
struct RawZone {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@Start")]
    start: String,
    #[serde(rename = "Main")]
    main: RawPlaylist,
    #[serde(rename = "Fallback")]
    fallback: Option<RawPlaylist>,
    #[serde(rename = "Intermediate", default)]
    intermediates: Vec<RawIntermediate>,
}

#[derive(Debug, Deserialize)]
struct RawPlaylist {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Shuffle", default)]
    shuffle: bool,
    #[serde(rename = "Fader")]
    fader: Option<RawFader>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawFader {
    #[serde(rename = "FadeInDurationSecs", default)]
    fade_in_secs: f32,
    #[serde(rename = "FadeOutDurationSecs", default)]
    fade_out_secs: f32,
    #[serde(rename = "MinLevel", default)]
    min_level: f32,
    #[serde(rename = "MaxLevel", default = "default_max_level")]
    max_level: f32,
}

fn default_max_level() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RawIntermediate {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Shuffle", default)]
    shuffle: bool,
    #[serde(rename = "Fader")]
    fader: Option<RawFader>,
    /// Minutes, per spec — converted to a `Duration` on load.
    #[serde(rename = "SchedIntervalMins")]
    sched_interval_mins: u64,
    #[serde(rename = "NumSchedItems")]
    num_sched_items: u32,
}

#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    pub start: NaiveTime,
    pub main: Playlist,
    pub fallback: Option<Playlist>,
    pub intermediates: Vec<IntermediatePlaylist>,
}

#[derive(Debug, Clone, Default)]
pub struct DaySchedule {
    /// Kept sorted ascending by `start`.
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Default)]
pub struct WeekSchedule {
    pub days: [DaySchedule; 7],
}

impl WeekSchedule {
    pub fn day(&self, weekday: Weekday) -> &DaySchedule {
        &self.days[weekday.num_days_from_monday() as usize]
    }
}

pub struct Config {
    pub source_path: PathBuf,
    pub week_schedule: WeekSchedule,
    pub mtime: SystemTime,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !util::is_readable_file(path) {
            return Err(ConfigError::NotReadable(path.to_path_buf()));
        }
        let week_schedule = parse_week_schedule(path)?;
        Ok(Config {
            source_path: path.to_path_buf(),
            week_schedule,
            mtime: util::mtime_of(path).unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    /// Reloads from disk if the file's mtime has changed.
    ///
    /// Unlike the original `cfg_reload_if_needed`, which destroys the old
    /// schedule unconditionally before reparsing (so a malformed reload
    /// leaves the scheduler with nothing at all), this builds the
    /// replacement schedule first and only swaps it in on success. A
    /// failed reload logs an error and leaves the previous schedule — and
    /// `mtime` — untouched, so the next tick retries the same file.
    pub fn reload_if_changed(&mut self) -> Result<bool, ConfigError> {
        let current_mtime = match util::mtime_of(&self.source_path) {
            Some(m) => m,
            None => return Err(ConfigError::NotReadable(self.source_path.clone())),
        };
        if current_mtime == self.mtime {
            return Ok(false);
        }
        match parse_week_schedule(&self.source_path) {
            Ok(week_schedule) => {
                self.week_schedule = week_schedule;
                self.mtime = current_mtime;
                Ok(true)
            }
            Err(e) => {
                log::error!(
                    "config reload of {:?} failed, retaining last-known-good schedule: {e}",
                    self.source_path
                );
                Err(e)
            }
        }
    }
}

fn fader_spec_from_raw(raw: Option<RawFader>) -> FaderSpec {
    match raw {
        Some(f) => FaderSpec {
            fade_in_secs: f.fade_in_secs,
            fade_out_secs: f.fade_out_secs,
            min_level: f.min_level,
            max_level: f.max_level,
        },
        None => FaderSpec::default(),
    }
}

fn resolve_playlist_path(base_dir: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn load_playlist_ref(base_dir: &Path, zone_name: &str, raw: &RawPlaylist) -> Result<Playlist, ConfigError> {
    let path = resolve_playlist_path(base_dir, &raw.path);
    let fader_spec = fader_spec_from_raw(raw.fader);
    Playlist::load(&path, zone_name, raw.shuffle, fader_spec).map_err(|e| ConfigError::ZonePlaylist(zone_name.to_string(), e))
}

fn load_intermediate(base_dir: &Path, zone_name: &str, raw: &RawIntermediate) -> Result<IntermediatePlaylist, ConfigError> {
    let path = resolve_playlist_path(base_dir, &raw.path);
    let fader_spec = fader_spec_from_raw(raw.fader);
    let playlist =
        Playlist::load(&path, &raw.name, raw.shuffle, fader_spec).map_err(|e| ConfigError::ZonePlaylist(zone_name.to_string(), e))?;
    let interval = std::time::Duration::from_secs(raw.sched_interval_mins.saturating_mul(60));
    Ok(IntermediatePlaylist::new(playlist, interval, raw.num_sched_items))
}

fn build_zone(base_dir: &Path, raw_zone: &RawZone) -> Result<Zone, ConfigError> {
    let start = NaiveTime::parse_from_str(&raw_zone.start, "%H:%M:%S")
        .map_err(|e| ConfigError::BadStartTime(raw_zone.start.clone(), e))?;
    let main = load_playlist_ref(base_dir, &raw_zone.name, &raw_zone.main)?;
    let fallback = raw_zone
        .fallback
        .as_ref()
        .map(|r| load_playlist_ref(base_dir, &raw_zone.name, r))
        .transpose()?;
    let mut intermediates = Vec::with_capacity(raw_zone.intermediates.len());
    for raw_ipls in &raw_zone.intermediates {
        intermediates.push(load_intermediate(base_dir, &raw_zone.name, raw_ipls)?);
    }
    Ok(Zone {
        name: raw_zone.name.clone(),
        start,
        main,
        fallback,
        intermediates,
    })
}

fn parse_week_schedule(path: &Path) -> Result<WeekSchedule, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawWeekSchedule = quick_xml::de::from_str(&contents)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut week = WeekSchedule::default();
    for (weekday, raw_day) in [
        (Weekday::Sun, &raw.sun),
        (Weekday::Mon, &raw.mon),
        (Weekday::Tue, &raw.tue),
        (Weekday::Wed, &raw.wed),
        (Weekday::Thu, &raw.thu),
        (Weekday::Fri, &raw.fri),
        (Weekday::Sat, &raw.sat),
    ] {
        let mut zones = Vec::with_capacity(raw_day.zones.len());
        for raw_zone in &raw_day.zones {
            zones.push(build_zone(&base_dir, raw_zone)?);
        }
        zones.sort_by_key(|z| z.start);
        week.days[weekday.num_days_from_monday() as usize] = DaySchedule { zones };
    }
    Ok(week)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str, ext: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "clipsched-cfgtest-{:?}-{}.{}",
            std::thread::current().id(),
            contents.len(),
            ext
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn zones_are_sorted_ascending_by_start_within_a_day() {
        let playlist_path = write_temp("track.mp3\n", "m3u");
        let xml = format!(
            r#"<WeekSchedule>
                <Mon>
                    <Zone Name="Evening" Start="18:00:00"><Main><Path>{p}</Path></Main></Zone>
                    <Zone Name="Morning" Start="06:00:00"><Main><Path>{p}</Path></Main></Zone>
                </Mon>
            </WeekSchedule>"#,
            p = playlist_path.display()
        );
        let cfg_path = write_temp(&xml, "xml");
        let week = parse_week_schedule(&cfg_path).unwrap();
        let zones = &week.day(Weekday::Mon).zones;
        assert_eq!(zones.len(), 2);
        assert!(zones[0].start < zones[1].start);
        std::fs::remove_file(playlist_path).ok();
        std::fs::remove_file(cfg_path).ok();
    }

    #[test]
    fn zone_only_belongs_to_the_day_element_it_is_nested_under() {
        let playlist_path = write_temp("track.mp3\n", "m3u");
        let xml = format!(
            r#"<WeekSchedule>
                <Tue>
                    <Zone Name="Solo" Start="09:00:00"><Main><Path>{p}</Path></Main></Zone>
                </Tue>
            </WeekSchedule>"#,
            p = playlist_path.display()
        );
        let cfg_path = write_temp(&xml, "xml");
        let week = parse_week_schedule(&cfg_path).unwrap();
        assert_eq!(week.day(Weekday::Tue).zones.len(), 1);
        assert!(week.day(Weekday::Mon).zones.is_empty());
        std::fs::remove_file(playlist_path).ok();
        std::fs::remove_file(cfg_path).ok();
    }

    #[test]
    fn fader_levels_default_to_zero_and_one() {
        let playlist_path = write_temp("track.mp3\n", "m3u");
        let xml = format!(
            r#"<WeekSchedule>
                <Wed>
                    <Zone Name="Z" Start="00:00:00">
                        <Main>
                            <Path>{p}</Path>
                            <Fader><FadeInDurationSecs>1.0</FadeInDurationSecs></Fader>
                        </Main>
                    </Zone>
                </Wed>
            </WeekSchedule>"#,
            p = playlist_path.display()
        );
        let cfg_path = write_temp(&xml, "xml");
        let week = parse_week_schedule(&cfg_path).unwrap();
        let zone = &week.day(Weekday::Wed).zones[0];
        assert_eq!(zone.main.fader_spec.min_level, 0.0);
        assert_eq!(zone.main.fader_spec.max_level, 1.0);
        std::fs::remove_file(playlist_path).ok();
        std::fs::remove_file(cfg_path).ok();
    }

    #[test]
    fn bad_start_time_is_rejected() {
        let playlist_path = write_temp("track.mp3\n", "m3u");
        let xml = format!(
            r#"<WeekSchedule>
                <Thu>
                    <Zone Name="Z" Start="not-a-time"><Main><Path>{p}</Path></Main></Zone>
                </Thu>
            </WeekSchedule>"#,
            p = playlist_path.display()
        );
        let cfg_path = write_temp(&xml, "xml");
        assert!(parse_week_schedule(&cfg_path).is_err());
        std::fs::remove_file(playlist_path).ok();
        std::fs::remove_file(cfg_path).ok();
    }
}
