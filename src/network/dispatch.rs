//! Radio dispatch context
//!
//! Radios hand completed transmissions and received frames to a dedicated
//! thread that invokes the installed [`RadioCallbacks`]. This keeps callback
//! execution outside the async scheduler, like a radio driver task.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::error::RadioError;
use super::mac::MacAddress;
use super::radio::{RadioCallbacks, SendStatus};

/// Work item for the dispatch thread
#[derive(Debug)]
pub enum Dispatch {
    Sent { peer: MacAddress, status: SendStatus },
    Received { source: MacAddress, data: Vec<u8> },
}

/// Owns the dispatch thread of one radio
pub struct Dispatcher {
    tx: Mutex<Option<Sender<Dispatch>>>,
    callbacks: Arc<RwLock<Option<Arc<dyn RadioCallbacks>>>>,
}

impl Dispatcher {
    /// Start a dispatch thread delivering to `callbacks`
    pub fn spawn(name: &str, callbacks: Arc<dyn RadioCallbacks>) -> Result<Self, RadioError> {
        let (tx, rx) = unbounded::<Dispatch>();
        let callbacks = Arc::new(RwLock::new(Some(callbacks)));
        let installed = callbacks.clone();
        let thread_name = name.to_string();

        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for item in rx.iter() {
                    // Clone out of the lock so deinit never waits on a callback
                    let Some(cb) = installed.read().clone() else {
                        break;
                    };
                    match item {
                        Dispatch::Sent { peer, status } => {
                            trace!("{}: send complete to {} ({:?})", thread_name, peer, status);
                            cb.on_send(Some(peer), status);
                        }
                        Dispatch::Received { source, data } => {
                            trace!("{}: {} bytes from {}", thread_name, data.len(), source);
                            cb.on_receive(Some(source), Some(&data));
                        }
                    }
                }
                debug!("{}: dispatch thread stopped", thread_name);
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            callbacks,
        })
    }

    /// Queue an item for the dispatch thread; false once stopped
    pub fn post(&self, item: Dispatch) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Release the callbacks and let the thread exit
    pub fn stop(&self) {
        self.callbacks.write().take();
        self.tx.lock().take();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
        received: AtomicUsize,
    }

    impl RadioCallbacks for Counting {
        fn on_send(&self, _peer: Option<MacAddress>, _status: SendStatus) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }

        fn on_receive(&self, _source: Option<MacAddress>, data: Option<&[u8]>) {
            self.received
                .fetch_add(data.map(|d| d.len()).unwrap_or(0), Ordering::SeqCst);
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_dispatch_invokes_callbacks() {
        let counting = Arc::new(Counting::default());
        let dispatcher = Dispatcher::spawn("test-dispatch", counting.clone()).unwrap();

        assert!(dispatcher.post(Dispatch::Sent {
            peer: MacAddress::BROADCAST,
            status: SendStatus::Success,
        }));
        assert!(dispatcher.post(Dispatch::Received {
            source: MacAddress::random(),
            data: vec![1, 2, 3],
        }));

        assert!(wait_for(|| counting.sent.load(Ordering::SeqCst) == 1));
        assert!(wait_for(|| counting.received.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_stop_rejects_further_posts() {
        let counting = Arc::new(Counting::default());
        let dispatcher = Dispatcher::spawn("test-dispatch-stop", counting.clone()).unwrap();
        dispatcher.stop();

        assert!(!dispatcher.is_running());
        assert!(!dispatcher.post(Dispatch::Sent {
            peer: MacAddress::BROADCAST,
            status: SendStatus::Success,
        }));
        // The dispatcher no longer holds the callbacks
        assert!(wait_for(|| Arc::strong_count(&counting) == 1));
    }
}
