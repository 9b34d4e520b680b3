//! Playlist loading (.m3u / .pls), Durstenfeld shuffling and mtime-based
//! reload — grounded in `pls_handler.c`'s extension dispatch and shuffle,
//! generalized to both supported formats instead of just one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::model::FaderSpec;
use crate::util;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist file not readable: {0}")]
    NotReadable(PathBuf),
    #[error("unsupported playlist extension: {0}")]
    UnsupportedExtension(PathBuf),
    #[error("io error reading playlist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("playlist {0} has no readable entries")]
    Empty(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub name: String,
    pub path: PathBuf,
    pub items: Vec<PathBuf>,
    pub shuffle: bool,
    pub order: Vec<usize>,
    pub cursor: usize,
    pub mtime: Option<SystemTime>,
    pub fader_spec: FaderSpec,
}

impl Playlist {
    pub fn load(path: &Path, name: &str, shuffle: bool, fader_spec: FaderSpec) -> Result<Self, PlaylistError> {
        if !util::is_readable_file(path) {
            return Err(PlaylistError::NotReadable(path.to_path_buf()));
        }
        let items = parse_playlist_file(path)?;
        if items.is_empty() {
            return Err(PlaylistError::Empty(path.to_path_buf()));
        }
        let mut playlist = Playlist {
            name: name.to_string(),
            path: path.to_path_buf(),
            items,
            shuffle,
            order: Vec::new(),
            cursor: 0,
            mtime: util::mtime_of(path),
            fader_spec,
        };
        playlist.reshuffle();
        Ok(playlist)
    }

    /// Rebuilds `order` — a fresh Fisher-Yates permutation when
    /// `shuffle == true`, identity order otherwise. A single-entry
    /// playlist permutes to itself, since the shuffle loop body never
    /// executes for `len <= 1`.
    pub fn reshuffle(&mut self) {
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        if self.shuffle {
            let mut seed = [0u8; 32];
            getrandom::fill(&mut seed).expect("system RNG unavailable");
            let mut rng = StdRng::from_seed(seed);
            order.shuffle(&mut rng);
        }
        self.order = order;
        self.cursor = 0;
    }

    /// Returns the next path in playback order, advancing (and wrapping)
    /// the cursor. Reloads from disk first if the file's mtime changed,
    /// then walks forward from the cursor for the first entry that still
    /// probes as readable, skipping (and logging) any that don't —
    /// per the draw-time contract, a stale or deleted entry is never
    /// handed back as a valid draw. Reshuffles once a full pass completes
    /// when `shuffle` is set, so repeat plays of the same playlist don't
    /// replay the same order forever.
    pub fn next_item(&mut self) -> Option<PathBuf> {
        if let Err(e) = self.reload_if_changed() {
            log::warn!("playlist {} failed to reload, keeping last-known-good contents: {e}", self.path.display());
        }
        if self.order.is_empty() {
            return None;
        }
        for _ in 0..self.order.len() {
            if self.cursor >= self.order.len() {
                if self.shuffle {
                    self.reshuffle();
                } else {
                    self.cursor = 0;
                }
            }
            let idx = self.order[self.cursor];
            self.cursor += 1;
            let Some(path) = self.items.get(idx).cloned() else {
                continue;
            };
            if util::is_readable_file(&path) {
                return Some(path);
            }
            log::warn!("skipping unreadable playlist entry {}", path.display());
        }
        None
    }

    /// Reloads the playlist from disk if its mtime has changed. Per spec,
    /// a changed playlist always restarts from scratch — the cursor is
    /// never preserved across a reload. A reload that parses to zero
    /// readable entries is rejected and the previous (last-known-good)
    /// contents and `mtime` are kept, mirroring [`crate::config::Config`]'s
    /// reload behavior.
    pub fn reload_if_changed(&mut self) -> Result<bool, PlaylistError> {
        let current_mtime = util::mtime_of(&self.path);
        if current_mtime == self.mtime {
            return Ok(false);
        }
        let items = parse_playlist_file(&self.path)?;
        if items.is_empty() {
            return Err(PlaylistError::Empty(self.path.clone()));
        }
        self.items = items;
        self.mtime = current_mtime;
        self.reshuffle();
        Ok(true)
    }
}

/// An intermediate (burst-fired) playlist. Modeled as composition over
/// [`Playlist`], never field-level inheritance, per the design notes.
#[derive(Debug, Clone)]
pub struct IntermediatePlaylist {
    pub playlist: Playlist,
    pub interval: Duration,
    pub items_per_firing: u32,
    pub last_scheduled: SystemTime,
    /// `-1` (encoded here as `None`) means idle/armed-for-next-interval;
    /// `Some(n)` means a burst is in progress with `n` draws remaining.
    pub pending_in_burst: Option<u32>,
}

impl IntermediatePlaylist {
    pub fn new(playlist: Playlist, interval: Duration, items_per_firing: u32) -> Self {
        IntermediatePlaylist {
            playlist,
            interval,
            items_per_firing,
            last_scheduled: SystemTime::UNIX_EPOCH,
            pending_in_burst: None,
        }
    }

    /// True once `now` is at or past `last_scheduled + interval` and no
    /// burst is already mid-flight (a mid-flight burst keeps firing
    /// regardless of the interval, until it drains).
    pub fn is_ready(&self, now: SystemTime) -> bool {
        if self.pending_in_burst.is_some() {
            return true;
        }
        match now.duration_since(self.last_scheduled) {
            Ok(elapsed) => elapsed >= self.interval,
            Err(_) => false,
        }
    }

    /// Draws the next item in the current (or newly-armed) burst. Returns
    /// `None` if the underlying playlist has no readable items at all.
    pub fn draw(&mut self, now: SystemTime) -> Option<PathBuf> {
        if self.pending_in_burst.is_none() {
            self.pending_in_burst = Some(self.items_per_firing);
        }
        let item = self.playlist.next_item();
        if let Some(remaining) = self.pending_in_burst {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                self.pending_in_burst = None;
                self.last_scheduled = now;
            } else {
                self.pending_in_burst = Some(remaining);
            }
        }
        item
    }
}

fn parse_playlist_file(path: &Path) -> Result<Vec<PathBuf>, PlaylistError> {
    let contents = fs::read_to_string(path).map_err(|source| PlaylistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("m3u") | Some("m3u8") => Ok(parse_m3u(&contents, &base_dir)),
        Some("pls") => Ok(parse_pls(&contents, &base_dir)),
        _ => Err(PlaylistError::UnsupportedExtension(path.to_path_buf())),
    }
}

fn resolve(entry: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(entry);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Drops any entry that doesn't exist or isn't a readable file, warning
/// once per dropped line rather than treating it as fatal.
fn filter_readable(entries: Vec<PathBuf>) -> Vec<PathBuf> {
    entries
        .into_iter()
        .filter(|path| {
            let readable = util::is_readable_file(path);
            if !readable {
                log::warn!("skipping unreadable playlist entry {}", path.display());
            }
            readable
        })
        .collect()
}

fn parse_m3u(contents: &str, base_dir: &Path) -> Vec<PathBuf> {
    let entries = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| resolve(line, base_dir))
        .collect();
    filter_readable(entries)
}

/// `.pls` parsing tolerates a `NumberOfEntries` that doesn't match the
/// actual `FileN=` keys present — it keeps reading `File1`, `File2`, ...
/// until one is missing, rather than trusting the declared count.
fn parse_pls(contents: &str, base_dir: &Path) -> Vec<PathBuf> {
    let mut files: std::collections::BTreeMap<u32, String> = std::collections::BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if let Some(idx_str) = key.strip_prefix("File").or_else(|| key.strip_prefix("file")) {
            if let Ok(idx) = idx_str.parse::<u32>() {
                files.insert(idx, value.trim().to_string());
            }
        }
    }
    let mut result = Vec::new();
    let mut n = 1;
    while let Some(entry) = files.get(&n) {
        result.push(resolve(entry, base_dir));
        n += 1;
    }
    filter_readable(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "clipsched-test-{}-{:?}-{}",
            name,
            std::thread::current().id(),
            contents.len()
        ));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn m3u_skips_blank_and_comment_lines() {
        let target = write_temp("real.mp3", "audio");
        let m3u_contents = format!("# comment\n\n{}\nmissing.mp3\n", target.display());
        let path = write_temp("a.m3u", &m3u_contents);
        let items = parse_m3u(&fs::read_to_string(&path).unwrap(), path.parent().unwrap());
        assert_eq!(items, vec![target.clone()]);
        fs::remove_file(path).ok();
        fs::remove_file(target).ok();
    }

    #[test]
    fn pls_tolerates_mismatched_number_of_entries_and_drops_unreadable() {
        let target = write_temp("real.mp3", "audio");
        let contents = format!("[playlist]\nFile1={}\nFile2=missing.mp3\nNumberOfEntries=99\n", target.display());
        let items = parse_pls(&contents, Path::new("/"));
        assert_eq!(items, vec![target.clone()]);
        fs::remove_file(target).ok();
    }

    #[test]
    fn load_rejects_a_playlist_with_no_readable_entries() {
        let path = write_temp("empty.m3u", "missing-one.mp3\nmissing-two.mp3\n");
        let err = Playlist::load(&path, "empty", false, FaderSpec::default());
        assert!(matches!(err, Err(PlaylistError::Empty(_))));
        fs::remove_file(path).ok();
    }

    #[test]
    fn next_item_skips_entries_deleted_after_load() {
        let a = write_temp("a.mp3", "audio");
        let b = write_temp("b.mp3", "audio");
        let m3u_contents = format!("{}\n{}\n", a.display(), b.display());
        let path = write_temp("order.m3u", &m3u_contents);
        let mut playlist = Playlist::load(&path, "p", false, FaderSpec::default()).unwrap();
        fs::remove_file(&a).ok();
        // `a` was readable at load time but is gone now: the draw must skip
        // it rather than hand back a dead path.
        let drawn = playlist.next_item();
        assert_eq!(drawn, Some(b.clone()));
        fs::remove_file(path).ok();
        fs::remove_file(b).ok();
    }

    #[test]
    fn single_entry_playlist_shuffles_to_itself() {
        let only = write_temp("only.mp3", "audio");
        let mut playlist = Playlist {
            name: "solo".into(),
            path: PathBuf::from("/dev/null"),
            items: vec![only.clone()],
            shuffle: true,
            order: Vec::new(),
            cursor: 0,
            mtime: None,
            fader_spec: FaderSpec::default(),
        };
        playlist.reshuffle();
        assert_eq!(playlist.order, vec![0]);
        fs::remove_file(only).ok();
    }

    #[test]
    fn intermediate_burst_fires_exactly_items_per_firing_then_waits() {
        let files: Vec<PathBuf> = (0..10).map(|i| write_temp(&format!("ipls{i}.mp3"), "audio")).collect();
        let playlist = Playlist {
            name: "ipls".into(),
            path: PathBuf::from("/dev/null"),
            items: files.clone(),
            shuffle: false,
            order: (0..10).collect(),
            cursor: 0,
            mtime: None,
            fader_spec: FaderSpec::default(),
        };
        let mut ipls = IntermediatePlaylist::new(playlist, Duration::from_secs(60), 3);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        assert!(!ipls.is_ready(SystemTime::UNIX_EPOCH));
        assert!(ipls.is_ready(t0));
        ipls.draw(t0);
        ipls.draw(t0);
        assert!(ipls.is_ready(t0)); // mid-burst: still ready regardless of interval
        ipls.draw(t0);
        assert_eq!(ipls.last_scheduled, t0);
        assert!(!ipls.is_ready(t0)); // burst just completed, interval not yet elapsed again
        for f in files {
            fs::remove_file(f).ok();
        }
    }
}
