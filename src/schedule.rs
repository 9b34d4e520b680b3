//! Schedule engine: zone selection and track selection within a zone.
//!
//! Grounded in `scheduler.c`'s `sched_get_next`, with the inclusive
//! zone-start correction from the design notes applied (see
//! [`zone_index_for`]).

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Local, Weekday};

use crate::config::{WeekSchedule, Zone};
use crate::model::FaderSpec;

/// Selects the zone active at `now` for the given day's (ascending
/// start-sorted) zone list.
///
/// Walks the zones in reverse and picks the first whose `start` is at or
/// before `now`'s time-of-day. An exact match belongs to the zone that
/// starts then — not, as the original's strict `>` break condition would
/// have it, the previous zone. If `now` is earlier than every zone's
/// start, no zone declared today actually covers this instant (the span
/// from midnight up to the first zone's start belongs to whatever zone
/// was active at the end of the previous day, which is this function's
/// caller's problem, not this day's); per spec, that edge case falls back
/// to the day's first zone and is logged rather than silently picking the
/// wrong one.
pub fn zone_index_for(day_zones: &[Zone], now: chrono::NaiveTime) -> Option<usize> {
    if day_zones.is_empty() {
        return None;
    }
    for (idx, zone) in day_zones.iter().enumerate().rev() {
        if zone.start <= now {
            return Some(idx);
        }
    }
    log::warn!(
        "{now} precedes every zone's start today; falling back to the first zone ({:?})",
        day_zones[0].name
    );
    Some(0)
}

pub fn current_zone<'a>(week: &'a WeekSchedule, now: DateTime<Local>) -> Option<&'a Zone> {
    let weekday: Weekday = now.weekday();
    let day = week.day(weekday);
    let idx = zone_index_for(&day.zones, now.time())?;
    day.zones.get(idx)
}

pub fn current_zone_mut<'a>(week: &'a mut WeekSchedule, now: DateTime<Local>) -> Option<&'a mut Zone> {
    let weekday: Weekday = now.weekday();
    let idx = {
        let day = week.day(weekday);
        zone_index_for(&day.zones, now.time())?
    };
    let day = &mut week.days[weekday.num_days_from_monday() as usize];
    day.zones.get_mut(idx)
}

/// A track drawn from a zone, carrying the zone name and the declared
/// fader spec of whichever playlist (main, fallback or a firing
/// intermediate) actually produced it — the caller needs this to
/// finalize an [`crate::model::Fader`] once the track's actual duration
/// is known (the schedule engine itself never probes media — see
/// `fsp_scheduler_thread`'s division of labor between `sched_get_next`
/// and the caller's own media-loader call).
pub struct DrawnTrack {
    pub path: PathBuf,
    pub zone_name: String,
    pub fader_spec: FaderSpec,
}

/// Draws the next track from a zone, applying the intermediate → main →
/// fallback priority chain. Returns `None` only when every source the
/// zone has is exhausted. Each playlist reloads itself (if its mtime
/// changed) and skips unreadable entries as part of its own `next_item`.
pub fn next_track_in_zone(zone: &mut Zone, now: SystemTime) -> Option<DrawnTrack> {
    if let Some(ipls) = zone.intermediates.iter_mut().find(|i| i.is_ready(now)) {
        if let Some(path) = ipls.draw(now) {
            return Some(DrawnTrack {
                path,
                zone_name: zone.name.clone(),
                fader_spec: ipls.playlist.fader_spec,
            });
        }
    }
    if let Some(path) = zone.main.next_item() {
        return Some(DrawnTrack {
            path,
            zone_name: zone.name.clone(),
            fader_spec: zone.main.fader_spec,
        });
    }
    let fallback = zone.fallback.as_mut()?;
    let path = fallback.next_item()?;
    Some(DrawnTrack {
        path,
        zone_name: zone.name.clone(),
        fader_spec: fallback.fader_spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::Playlist;
    use chrono::NaiveTime;
    use std::fs;
    use std::path::PathBuf;

    fn write_temp(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("clipsched-scheduletest-{name}-{:?}", std::thread::current().id()));
        fs::write(&path, "audio").unwrap();
        path
    }

    fn dummy_playlist(name: &str) -> Playlist {
        let a = write_temp(&format!("{name}-a"));
        let b = write_temp(&format!("{name}-b"));
        Playlist {
            name: name.to_string(),
            path: PathBuf::from("/dev/null"),
            items: vec![a, b],
            shuffle: false,
            order: vec![0, 1],
            cursor: 0,
            mtime: None,
            fader_spec: FaderSpec::default(),
        }
    }

    fn dummy_zone(name: &str, start: NaiveTime) -> Zone {
        Zone {
            name: name.to_string(),
            start,
            main: dummy_playlist(name),
            fallback: None,
            intermediates: Vec::new(),
        }
    }

    #[test]
    fn exact_start_match_is_inclusive() {
        let zones = vec![
            dummy_zone("morning", NaiveTime::from_hms_opt(6, 0, 0).unwrap()),
            dummy_zone("evening", NaiveTime::from_hms_opt(18, 0, 0).unwrap()),
        ];
        let idx = zone_index_for(&zones, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn before_every_zone_falls_back_to_the_first_zone_of_day() {
        let zones = vec![
            dummy_zone("morning", NaiveTime::from_hms_opt(6, 0, 0).unwrap()),
            dummy_zone("evening", NaiveTime::from_hms_opt(18, 0, 0).unwrap()),
        ];
        let idx = zone_index_for(&zones, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn midnight_zone_is_always_selected_by_some_time() {
        let zones = vec![dummy_zone("overnight", NaiveTime::from_hms_opt(0, 0, 0).unwrap())];
        let idx = zone_index_for(&zones, NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn falls_through_main_to_fallback_when_main_exhausted() {
        let mut zone = dummy_zone("z", NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        zone.main.order.clear();
        zone.fallback = Some(dummy_playlist("fallback"));
        let now = SystemTime::UNIX_EPOCH;
        let item = next_track_in_zone(&mut zone, now);
        assert!(item.is_some());
    }
}
