//! Signal dispatcher: reimplements `sig_dispatcher.c`'s signalfd + epoll
//! dispatch table using the `signal-hook` crate's dedicated-thread
//! iterator, which is the idiomatic Rust replacement for hand-rolled
//! signal-fd plumbing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::info;
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

type Callback = Box<dyn Fn(i32) + Send + 'static>;

pub struct SignalDispatcher {
    shutdown_requested: Arc<AtomicBool>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    handle: Option<JoinHandle<()>>,
}

impl SignalDispatcher {
    /// Spawns the dispatcher thread. Blocks no signals itself — on Unix,
    /// callers that want every worker thread to inherit a common signal
    /// mask should block signals in `main` before spawning other threads,
    /// matching the original's early `pthread_sigmask` call.
    pub fn spawn() -> std::io::Result<Self> {
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let callbacks: Arc<Mutex<Vec<Callback>>> = Arc::new(Mutex::new(Vec::new()));

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2])?;
        let shutdown_for_thread = shutdown_requested.clone();
        let callbacks_for_thread = callbacks.clone();

        let handle = thread::Builder::new()
            .name("signal-dispatcher".into())
            .spawn(move || {
                for signal in &mut signals {
                    info!("received signal {signal}");
                    for cb in callbacks_for_thread.lock().unwrap().iter() {
                        cb(signal);
                    }
                    if signal == SIGINT || signal == SIGTERM {
                        shutdown_for_thread.store(true, Ordering::Release);
                        break;
                    }
                }
            })
            .expect("failed to spawn signal dispatcher thread");

        Ok(SignalDispatcher {
            shutdown_requested,
            callbacks,
            handle: Some(handle),
        })
    }

    pub fn register(&self, callback: impl Fn(i32) + Send + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn register_accepts_multiple_callbacks() {
        let dispatcher = SignalDispatcher::spawn().expect("spawn dispatcher");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        dispatcher.register(move |_sig| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!dispatcher.shutdown_requested());
    }
}
