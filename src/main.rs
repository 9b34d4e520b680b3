//! clipsched binary entrypoint and top-level orchestration glue.

mod audio_decoder;
mod config;
mod http_endpoint;
mod media;
mod model;
mod player;
mod playlist;
mod runtime_config;
mod schedule;
mod signal_dispatcher;
mod util;

use std::path::PathBuf;

use log::info;
use signal_hook::consts::signal::{SIGUSR1, SIGUSR2};

use config::Config;
use http_endpoint::MetaHandler;
use player::Player;
use runtime_config::RuntimeConfig;
use signal_dispatcher::SignalDispatcher;

const USAGE: &str = "Usage: clipsched [-d debug_level] [-p port] <config_file>\n";

struct Args {
    config_path: PathBuf,
    port_override: Option<u16>,
    log_level_override: Option<String>,
}

/// Hand-rolled flag parsing matching the original's `getopt(argc, argv,
/// "s:d:m:p:")` shape: `-d` sets the log level, `-p` overrides the HTTP
/// port, the config file path is the sole trailing positional argument.
/// The original's `-m` debug-mask flag has no counterpart here — `log`'s
/// per-module filters (via `RUST_LOG`) already give finer-grained control
/// than a bitmask ever did.
fn parse_args(argv: &[String]) -> Option<Args> {
    let mut port_override = None;
    let mut log_level_override = None;
    let mut i = 1;
    let mut positional: Option<PathBuf> = None;

    while i < argv.len() {
        match argv[i].as_str() {
            "-d" => {
                i += 1;
                log_level_override = Some(argv.get(i)?.clone());
            }
            "-p" => {
                i += 1;
                port_override = Some(argv.get(i)?.parse().ok()?);
            }
            "-m" => {
                // Accepted for command-line compatibility with the original
                // tool but ignored: see the module doc comment above.
                i += 1;
                let _ = argv.get(i)?;
            }
            other if positional.is_none() => positional = Some(PathBuf::from(other)),
            _ => return None,
        }
        i += 1;
    }

    Some(Args {
        config_path: positional?,
        port_override,
        log_level_override,
    })
}

fn initialize_logging(level_override: Option<&str>) {
    let mut clog = colog::basic_builder();
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        clog.parse_filters(&rust_log);
    } else if let Some(level) = level_override {
        clog.filter(None, log::LevelFilter::Warn);
        clog.filter(Some("clipsched"), level.parse().unwrap_or(log::LevelFilter::Info));
    } else {
        clog.filter(None, log::LevelFilter::Warn);
        clog.filter(Some("clipsched"), log::LevelFilter::Info);
    }
    clog.init();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().collect();
    let Some(args) = parse_args(&argv) else {
        print!("{USAGE}");
        return Ok(());
    };

    initialize_logging(args.log_level_override.as_deref());
    install_panic_hook();

    let runtime_config_path = RuntimeConfig::default_path().unwrap_or_else(|| PathBuf::from("clipsched-runtime.toml"));
    let runtime_cfg = RuntimeConfig::load_or_default(&runtime_config_path);
    let port = args.port_override.unwrap_or(runtime_cfg.http.port);

    let dispatcher = SignalDispatcher::spawn()?;

    let config = Config::load(&args.config_path)?;
    let mut player = Player::new(config);
    player.start()?;
    info!("player started, watching {}", args.config_path.display());

    let player_for_state = std::sync::Arc::new(player);
    let player_for_cb = player_for_state.clone();
    let mut meta_handler = MetaHandler::bind(
        port,
        runtime_cfg.http.bind_address.as_deref(),
        Box::new(move || player_for_cb.snapshot()),
    )?;
    meta_handler.start();
    info!("metadata endpoint listening on {}", meta_handler.local_addr());

    {
        let player_for_sig = player_for_state.clone();
        dispatcher.register(move |sig| {
            if sig == SIGUSR1 {
                player_for_sig.pause();
            } else if sig == SIGUSR2 {
                player_for_sig.resume();
            }
        });
    }

    let mut dispatcher = dispatcher;
    while !dispatcher.shutdown_requested() {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("graceful exit...");
    meta_handler.stop();
    // Drop the handler (releasing its `state_cb` closure's `Player` clone)
    // before the dispatcher, whose pause/resume callback holds the other
    // clone, so `player_for_state` below is the sole remaining owner and
    // `Player::drop`'s `stop()` runs unobstructed.
    drop(meta_handler);
    dispatcher.join();
    drop(dispatcher);
    drop(player_for_state);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_a_config_path() {
        let argv = vec!["clipsched".to_string()];
        assert!(parse_args(&argv).is_none());
    }

    #[test]
    fn parses_port_and_debug_level_flags() {
        let argv = vec![
            "clipsched".to_string(),
            "-d".to_string(),
            "debug".to_string(),
            "-p".to_string(),
            "9100".to_string(),
            "/etc/clipsched/week.xml".to_string(),
        ];
        let args = parse_args(&argv).unwrap();
        assert_eq!(args.port_override, Some(9100));
        assert_eq!(args.log_level_override.as_deref(), Some("debug"));
        assert_eq!(args.config_path, PathBuf::from("/etc/clipsched/week.xml"));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let argv = vec!["clipsched".to_string(), "-z".to_string(), "week.xml".to_string()];
        assert!(parse_args(&argv).is_none());
    }
}
