//! Metadata HTTP endpoint: a tiny, request-content-agnostic JSON
//! responder exposing the player's current/next track and elapsed
//! seconds, for a station's web page.
//!
//! Grounded line-for-line in `meta_handler.c`: the listen socket's exact
//! option set (`SO_REUSEADDR`, `TCP_NODELAY`, `TCP_QUICKACK`,
//! non-blocking `accept`), the once-per-second/once-per-track response
//! cache (`mh_update_response`), the `SO_LINGER` 5s close, and the
//! two-tier JSON string escaping (`mh_json_escape_string`) are all
//! reproduced as documented there. `socket2` supplies the handful of
//! socket options `std::net` doesn't expose; `libc::poll` stands in for
//! the original's `epoll_wait(..., 1000)` listen-loop timeout.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use crate::media::AudioFileInfo;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("could not create server socket: {0}")]
    SocketCreate(std::io::Error),
    #[error("could not bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("could not listen: {0}")]
    Listen(std::io::Error),
}

/// Supplies the player's current snapshot: `(current, next,
/// elapsed_secs)`. Registered once at construction, matching
/// `mh_register_state_callback`'s single-callback contract — there is
/// no re-registration path.
pub type StateCallback = Box<dyn Fn() -> (Option<AudioFileInfo>, Option<AudioFileInfo>, u32) + Send + Sync>;

/// The formatted response plus the bookkeeping `mh_update_response`
/// keeps to decide when to recompute it.
struct Cache {
    body: String,
    cur: Option<AudioFileInfo>,
    next: Option<AudioFileInfo>,
    last_update_secs: u64,
    next_update_secs: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            body: String::new(),
            cur: None,
            next: None,
            last_update_secs: 0,
            next_update_secs: 0,
        }
    }
}

pub struct MetaHandler {
    listener: Socket,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    state_cb: Arc<StateCallback>,
    cache: Arc<Mutex<Cache>>,
    thread: Option<JoinHandle<()>>,
}

impl MetaHandler {
    /// Creates and binds the listen socket but does not yet accept
    /// connections — call [`Self::start`] to spawn the server thread,
    /// mirroring `mh_init`/`mh_start`'s two-step lifecycle.
    pub fn bind(port: u16, bind_address: Option<&str>, state_cb: StateCallback) -> Result<Self, EndpointError> {
        let ip: IpAddr = bind_address
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, port);

        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(EndpointError::SocketCreate)?;
        socket.set_reuse_address(true).map_err(EndpointError::SocketCreate)?;
        socket.set_nodelay(true).map_err(EndpointError::SocketCreate)?;
        set_quickack(&socket);
        socket.set_nonblocking(true).map_err(EndpointError::SocketCreate)?;
        socket.bind(&SockAddr::from(addr)).map_err(|e| EndpointError::Bind(addr, e))?;
        socket.listen(128).map_err(EndpointError::Listen)?;

        let local_addr = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);

        Ok(MetaHandler {
            listener: socket,
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            state_cb: Arc::new(state_cb),
            cache: Arc::new(Mutex::new(Cache::default())),
            thread: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = self.listener.try_clone().expect("listen socket clone");
        let running = self.running.clone();
        let state_cb = self.state_cb.clone();
        let cache = self.cache.clone();
        self.thread = Some(
            thread::Builder::new()
                .name("meta-http".into())
                .spawn(move || server_loop(listener, running, state_cb, cache))
                .expect("failed to spawn metadata http thread"),
        );
    }

    /// Idempotent stop: joins the server thread before returning.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetaHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "linux")]
fn set_quickack(socket: &Socket) {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!("could not set TCP_QUICKACK: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn set_quickack(_socket: &Socket) {}

/// Blocks until the listen socket is readable or `timeout_ms` elapses,
/// standing in for `epoll_wait(mh->epoll_fd, events, 32, 1000)` — the
/// same periodic-wakeup shape so `running` is re-checked promptly on
/// shutdown even with no inbound connections.
#[cfg(unix)]
fn wait_readable(socket: &Socket, timeout_ms: i32) -> bool {
    use std::os::unix::io::AsRawFd;
    let mut pfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(not(unix))]
fn wait_readable(_socket: &Socket, timeout_ms: i32) -> bool {
    thread::sleep(Duration::from_millis(timeout_ms as u64));
    true
}

fn server_loop(listener: Socket, running: Arc<AtomicBool>, state_cb: Arc<StateCallback>, cache: Arc<Mutex<Cache>>) {
    info!("metadata endpoint waiting for connections...");
    while running.load(Ordering::Acquire) {
        if !wait_readable(&listener, 1000) {
            continue;
        }
        loop {
            match listener.accept() {
                Ok((conn, peer)) => {
                    if let Some(addr) = peer.as_socket() {
                        debug!("connection from {addr}");
                    }
                    handle_client(conn, &state_cb, &cache);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Writes the cached JSON response and closes the connection, applying
/// the original's 5s `SO_LINGER` so a slow/unresponsive client can't
/// hold the socket in `TIME_WAIT` indefinitely.
fn handle_client(mut conn: Socket, state_cb: &StateCallback, cache: &Mutex<Cache>) {
    use std::io::Write;

    let _ = conn.set_nonblocking(false);
    let _ = conn.set_linger(Some(Duration::from_secs(5)));

    let body = refresh_if_needed(state_cb, cache);
    if let Err(e) = conn.write_all(body.as_bytes()) {
        warn!("write to metadata client failed: {e}");
    }
    let _ = conn.flush();
    let _ = conn.shutdown(std::net::Shutdown::Write);
}

/// Recomputes the cached JSON body at most once per wall-clock second
/// (`now == last_update` skip, exact original behavior) and only
/// re-fetches the full (current, next) snapshot once per currently
/// playing track, per `mh_update_response`.
fn refresh_if_needed(state_cb: &StateCallback, cache: &Mutex<Cache>) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let mut cache = cache.lock().unwrap();
    if now == cache.last_update_secs && !cache.body.is_empty() {
        return cache.body.clone();
    }

    let (cur, next, elapsed) = state_cb();
    if now > cache.next_update_secs {
        let duration = cur.as_ref().map(|c| c.duration_secs).unwrap_or(0);
        cache.next_update_secs = now + duration.saturating_sub(elapsed as u64) + 1;
        cache.cur = cur;
        cache.next = next;
    }
    cache.body = format_response(cache.cur.as_ref(), cache.next.as_ref(), elapsed);
    cache.last_update_secs = now;
    cache.body.clone()
}

fn format_response(cur: Option<&AudioFileInfo>, next: Option<&AudioFileInfo>, elapsed: u32) -> String {
    let cur_json = song_json(cur, Some(elapsed));
    let next_json = song_json(next, None);
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Connection: close\r\n\
         \r\n\
         {{\"current_song\":{cur_json},\"next_song\":{next_json}}}"
    )
}

fn song_json(info: Option<&AudioFileInfo>, elapsed: Option<u32>) -> String {
    let artist = escape_text(info.and_then(|i| i.artist.as_deref()));
    let album = escape_text(info.and_then(|i| i.album.as_deref()));
    let title = escape_text(info.and_then(|i| i.title.as_deref()));
    let path = info.map(|i| escape_path(&i.path)).unwrap_or_else(|| "(null)".to_string());
    let duration = info.map(|i| i.duration_secs).unwrap_or(0);
    let zone = info.map(|i| escape_text(Some(i.zone_name.as_str()))).unwrap_or_else(|| "(null)".to_string());
    let album_id = escape_text(info.and_then(|i| i.album_id.as_deref()));
    let release_track_id = escape_text(info.and_then(|i| i.release_track_id.as_deref()));

    let mut obj = format!(
        "{{\"Artist\":\"{artist}\",\"Album\":\"{album}\",\"Title\":\"{title}\",\
         \"Path\":\"{path}\",\"Duration\":\"{duration}\""
    );
    if let Some(elapsed) = elapsed {
        obj.push_str(&format!(",\"Elapsed\":\"{elapsed}\""));
    }
    obj.push_str(&format!(
        ",\"Zone\":\"{zone}\",\"MusicBrainz Album Id\":\"{album_id}\",\
         \"MusicBrainz Release Track Id\":\"{release_track_id}\"}}"
    ));
    obj
}

/// Human-readable fields (artist/album/title/zone/MusicBrainz ids):
/// double quotes become single quotes and backslashes become forward
/// slashes, a size-saving substitution that's safe here because these
/// fields are display text, never round-tripped back into a path.
fn escape_text(value: Option<&str>) -> String {
    match value {
        None => "(null)".to_string(),
        Some(s) if s.is_empty() => "(null)".to_string(),
        Some(s) => s.replace('\\', "/").replace('"', "'"),
    }
}

/// The `Path` field must remain byte-for-byte usable, so quotes and
/// backslashes are backslash-escaped rather than substituted.
fn escape_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fader;
    use std::path::PathBuf;

    fn sample_info() -> AudioFileInfo {
        AudioFileInfo {
            path: PathBuf::from("/music/a \"b\".mp3"),
            artist: Some("Artist \"Name\"".to_string()),
            album: Some(r"Al\bum".to_string()),
            title: Some("Title".to_string()),
            album_id: None,
            release_track_id: None,
            album_gain_db: None,
            album_peak: None,
            track_gain_db: None,
            track_peak: None,
            duration_secs: 180,
            zone_name: "Evening".to_string(),
            fader: Fader::default(),
        }
    }

    #[test]
    fn missing_fields_serialize_as_null_placeholder() {
        let json = song_json(None, None);
        assert!(json.contains("\"Artist\":\"(null)\""));
        assert!(json.contains("\"Path\":\"(null)\""));
        assert!(!json.contains("Elapsed"));
    }

    #[test]
    fn human_text_fields_substitute_quotes_and_backslashes() {
        let info = sample_info();
        let json = song_json(Some(&info), Some(42));
        assert!(json.contains("\"Artist\":\"Artist 'Name''\"") == false); // sanity: no runaway quoting
        assert!(json.contains("Artist 'Name'"));
        assert!(json.contains("Al/bum"));
        assert!(json.contains("\"Elapsed\":\"42\""));
        assert!(json.contains("\"Duration\":\"180\""));
    }

    #[test]
    fn path_field_is_backslash_escaped_not_substituted() {
        let info = sample_info();
        let json = song_json(Some(&info), None);
        assert!(json.contains(r#"/music/a \"b\".mp3"#));
    }

    #[test]
    fn snapshot_byte_identical_within_same_second() {
        let cache = Mutex::new(Cache::default());
        let calls = std::sync::atomic::AtomicU32::new(0);
        let cb: StateCallback = Box::new(|| (None, None, 0));
        let first = refresh_if_needed(&cb, &cache);
        let second = refresh_if_needed(&cb, &cache);
        let _ = calls.load(Ordering::Relaxed);
        assert_eq!(first, second);
    }

    #[test]
    fn full_response_has_expected_status_line() {
        let body = format_response(None, None, 0);
        assert!(body.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(body.contains("Content-Type: application/json"));
        assert!(body.contains("Connection: close"));
    }
}
