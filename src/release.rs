//! Background release of free memory to the OS.
//!
//! Releasing on demand is [`Engine::release`]; this module only adds a thread
//! that does so at a steady rate.

use std::{
    io,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::engine::Engine;

const PERIOD: Duration = Duration::from_secs(1);

/// A thread releasing [`Parameters::background_release_rate`] bytes per second
/// of an engine's free memory to the OS. The thread stops when this handle is
/// dropped.
///
/// [`Parameters::background_release_rate`]: crate::Parameters::background_release_rate
#[derive(Debug)]
pub struct BackgroundReleaser {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundReleaser {
    /// Start releasing memory of `engine` in the background.
    pub fn spawn(engine: &'static Engine) -> io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread = thread::Builder::new()
            .name("spanmalloc-release".into())
            .spawn({
                let stop = stop.clone();
                move || run(engine, &stop)
            })?;
        Ok(BackgroundReleaser {
            stop,
            thread: Some(thread),
        })
    }
}

fn run(engine: &Engine, stop: &(Mutex<bool>, Condvar)) {
    let (stopped, wakeup) = stop;
    let Ok(mut guard) = stopped.lock() else {
        return;
    };
    loop {
        guard = match wakeup.wait_timeout(guard, PERIOD) {
            Ok((guard, _)) => guard,
            Err(_) => return,
        };
        if *guard {
            return;
        }
        let rate = engine.parameters().background_release_rate();
        if rate > 0 {
            engine.release(rate);
        }
    }
}

impl Drop for BackgroundReleaser {
    fn drop(&mut self) {
        let (stopped, wakeup) = &*self.stop;
        if let Ok(mut stopped) = stopped.lock() {
            *stopped = true;
        }
        wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FreeHint, Request};

    #[test]
    fn releases_in_the_background_until_dropped() {
        let _ = env_logger::try_init();
        let engine: &'static Engine = Box::leak(Box::new(Engine::new()));
        let mb = 1 << 20;
        let a = engine.allocate(None, Request::new(4 * mb, 1)).unwrap();
        unsafe { engine.deallocate(None, a.ptr, FreeHint::NONE) };
        assert_eq!(engine.stats().pageheap_unmapped_bytes, 0);

        engine.parameters().set_background_release_rate(mb);
        let releaser = BackgroundReleaser::spawn(engine).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while engine.stats().pageheap_unmapped_bytes == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        drop(releaser);
        assert_eq!(engine.stats().pageheap_unmapped_bytes, 4 * mb);
    }
}
