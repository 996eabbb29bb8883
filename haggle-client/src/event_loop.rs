//! Event loop: drains the session's event queue and invokes callbacks, on the caller's thread
//! or on a dedicated one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use haggle_core::DataObject;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::SessionHandle;
use crate::subscription::SubscriptionTable;

/// Everything the loop thread can be woken with.
pub(crate) enum LoopSignal {
    Event {
        category: u8,
        payload: Option<DataObject>,
    },
    /// Stop request for the loop run with this generation.
    Stop(u64),
    /// Connection to the daemon is gone.
    Ended,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    thread_id: Option<ThreadId>,
    thread: Option<JoinHandle<()>>,
}

/// Runs on the loop thread when a loop starts or ends, e.g. to attach thread-local host state.
pub type LoopHook = Box<dyn FnMut() + Send + 'static>;

#[derive(Default)]
struct LoopHooks {
    on_start: Option<LoopHook>,
    on_stop: Option<LoopHook>,
}

type Body = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct EventLoop {
    queue: Mutex<Option<Receiver<LoopSignal>>>,
    signals: Sender<LoopSignal>,
    state: Mutex<LoopState>,
    hooks: Mutex<LoopHooks>,
    generation: AtomicU64,
}

impl EventLoop {
    pub fn new(queue: Receiver<LoopSignal>, signals: Sender<LoopSignal>) -> Self {
        Self {
            queue: Mutex::new(Some(queue)),
            signals,
            state: Mutex::new(LoopState::default()),
            hooks: Mutex::new(LoopHooks::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Install start/stop hooks. Each can be set once per session.
    pub fn set_hooks(&self, on_start: Option<LoopHook>, on_stop: Option<LoopHook>) -> Result<()> {
        let mut hooks = self.hooks.lock();
        if (on_start.is_some() && hooks.on_start.is_some())
            || (on_stop.is_some() && hooks.on_stop.is_some())
        {
            return Err(Error::LoopHooksAlreadySet);
        }
        if on_start.is_some() {
            hooks.on_start = on_start;
        }
        if on_stop.is_some() {
            hooks.on_stop = on_stop;
        }
        Ok(())
    }

    /// Mark a new run as started. The caller holds the state lock until the run is fully set up.
    fn begin(&self, state: &mut LoopState, subs: &SubscriptionTable) -> Result<u64> {
        if state.running {
            return Err(Error::EventLoopRunning);
        }
        if subs.is_empty() {
            return Err(Error::NoSubscriptions);
        }
        // A finished detached thread has already released the state; joining it cannot block on us.
        if let Some(previous) = state.thread.take() {
            let _ = previous.join();
        }
        if self.queue.lock().is_none() {
            return Err(Error::EventLoopRunning);
        }
        state.running = true;
        state.thread_id = None;
        Ok(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Body of one run, on whichever thread hosts the loop.
    fn run(&self, subs: &SubscriptionTable, generation: u64) {
        let Some(queue) = self.queue.lock().take() else {
            self.finish(None);
            return;
        };
        if let Some(hook) = self.hooks.lock().on_start.as_mut() {
            hook();
        }
        let queue = drain(queue, subs, generation);
        if let Some(hook) = self.hooks.lock().on_stop.as_mut() {
            hook();
        }
        self.finish(Some(queue));
    }

    fn finish(&self, queue: Option<Receiver<LoopSignal>>) {
        if let Some(queue) = queue {
            *self.queue.lock() = Some(queue);
        }
        let mut state = self.state.lock();
        state.running = false;
        state.thread_id = None;
    }

    pub fn run_blocking(&self, subs: &SubscriptionTable) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            let generation = self.begin(&mut state, subs)?;
            state.thread_id = Some(std::thread::current().id());
            generation
        };
        self.run(subs, generation);
        Ok(())
    }

    pub fn run_detached(
        self: &Arc<Self>,
        subs: Arc<SubscriptionTable>,
        thread_name: String,
    ) -> Result<()> {
        self.start_detached(subs, |body| {
            std::thread::Builder::new().name(thread_name).spawn(body)
        })
    }

    fn start_detached<F>(self: &Arc<Self>, subs: Arc<SubscriptionTable>, spawn: F) -> Result<()>
    where
        F: FnOnce(Body) -> std::io::Result<JoinHandle<()>>,
    {
        // The state lock is held until the handle is stored, so `stop` always finds the thread.
        let mut state = self.state.lock();
        let generation = self.begin(&mut state, &subs)?;
        let this = self.clone();
        match spawn(Box::new(move || this.run(&subs, generation))) {
            Ok(handle) => {
                state.thread_id = Some(handle.thread().id());
                state.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The queue was never taken, so a later run can still start.
                state.running = false;
                Err(Error::Thread(e))
            }
        }
    }

    /// Ask the running loop to return. Joins a detached loop unless called from its own thread.
    pub fn stop(&self) -> Result<()> {
        let thread = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(Error::EventLoopNotRunning);
            }
            let generation = self.generation.load(Ordering::Acquire);
            let _ = self.signals.send(LoopSignal::Stop(generation));
            if state.thread_id == Some(std::thread::current().id()) {
                return Ok(());
            }
            state.thread.take()
        };
        if let Some(handle) = thread {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn drain(queue: Receiver<LoopSignal>, subs: &SubscriptionTable, generation: u64) -> Receiver<LoopSignal> {
    debug!(generation, "event loop started");
    while let Ok(signal) = queue.recv() {
        match signal {
            LoopSignal::Event { category, payload } => subs.dispatch(category, payload),
            LoopSignal::Stop(g) if g == generation => break,
            LoopSignal::Stop(_) => {}
            LoopSignal::Ended => {
                info!("daemon connection ended, event loop exiting");
                break;
            }
        }
    }
    debug!(generation, "event loop stopped");
    queue
}

impl SessionHandle {
    /// Deliver events on the calling thread until `stop`, session close or daemon disconnect.
    pub fn run_blocking(&self) -> Result<()> {
        let shared = self.shared()?;
        let subs = shared.subscriptions.clone();
        let event_loop = shared.event_loop.clone();
        // Do not keep the session alive while blocked.
        drop(shared);
        event_loop.run_blocking(&subs)
    }

    /// Deliver events on a dedicated thread. Returns once the thread is started.
    pub fn run_detached(&self) -> Result<()> {
        let shared = self.shared()?;
        shared.event_loop.run_detached(
            shared.subscriptions.clone(),
            format!("haggle-events-{}", self.name()),
        )
    }

    pub fn stop(&self) -> Result<()> {
        self.shared()?.event_loop.stop()
    }

    pub fn is_running(&self) -> bool {
        self.shared()
            .map(|s| s.event_loop.is_running())
            .unwrap_or(false)
    }

    /// Hooks run on the loop thread as each loop starts and ends. Each is set at most once.
    pub fn set_loop_hooks(&self, on_start: Option<LoopHook>, on_stop: Option<LoopHook>) -> Result<()> {
        self.shared()?.event_loop.set_hooks(on_start, on_stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::EventCategory;
    use std::sync::mpsc;
    use std::time::Duration;

    fn setup() -> (Arc<EventLoop>, Arc<SubscriptionTable>, mpsc::Receiver<u8>) {
        let (tx, rx) = mpsc::channel();
        let event_loop = Arc::new(EventLoop::new(rx, tx));
        let subs = Arc::new(SubscriptionTable::new());
        let (seen_tx, seen_rx) = mpsc::channel();
        subs.insert(
            EventCategory::NewDataObject,
            Box::new(move |e| {
                let _ = seen_tx.send(e.category().code());
            }),
        )
        .unwrap();
        (event_loop, subs, seen_rx)
    }

    fn push(event_loop: &EventLoop, tag: &str) {
        let _ = event_loop.signals.send(LoopSignal::Event {
            category: EventCategory::NewDataObject.code(),
            payload: Some(DataObject::new().with_attribute("tag", tag)),
        });
    }

    #[test]
    fn no_subscriptions_refused() {
        let (tx, rx) = mpsc::channel();
        let event_loop = EventLoop::new(rx, tx);
        let subs = SubscriptionTable::new();
        assert!(matches!(event_loop.run_blocking(&subs), Err(Error::NoSubscriptions)));
    }

    #[test]
    fn stop_when_idle() {
        let (event_loop, _subs, _seen) = setup();
        assert!(matches!(event_loop.stop(), Err(Error::EventLoopNotRunning)));
    }

    #[test]
    fn detached_delivers_and_stop_joins() {
        let (event_loop, subs, seen) = setup();
        event_loop.run_detached(subs.clone(), "test-loop".into()).unwrap();
        assert!(event_loop.is_running());
        assert!(matches!(
            event_loop.run_detached(subs.clone(), "second".into()),
            Err(Error::EventLoopRunning)
        ));
        push(&event_loop, "a");
        assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        event_loop.stop().unwrap();
        assert!(!event_loop.is_running());
        // Runnable again after a stop.
        event_loop.run_detached(subs, "again".into()).unwrap();
        push(&event_loop, "b");
        assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        event_loop.stop().unwrap();
    }

    #[test]
    fn ended_connection_ends_blocking_loop() {
        let (event_loop, subs, seen) = setup();
        push(&event_loop, "a");
        let _ = event_loop.signals.send(LoopSignal::Ended);
        event_loop.run_blocking(&subs).unwrap();
        assert_eq!(seen.try_recv().unwrap(), 2);
        assert!(!event_loop.is_running());
    }

    #[test]
    fn stale_stop_ignored() {
        let (event_loop, subs, seen) = setup();
        let _ = event_loop.signals.send(LoopSignal::Stop(0));
        push(&event_loop, "a");
        let _ = event_loop.signals.send(LoopSignal::Ended);
        event_loop.run_blocking(&subs).unwrap();
        assert_eq!(seen.try_recv().unwrap(), 2);
    }

    #[test]
    fn blocking_loop_on_live_session() {
        let (_bg, cfg) = crate::session::tests::daemon();
        let session = crate::Session::register(&cfg, "blocking").unwrap();
        assert!(matches!(session.run_blocking(), Err(Error::NoSubscriptions)));
        session
            .subscribe(EventCategory::DaemonShutdown, |_| {})
            .unwrap();
        let handle = session.handle();
        let runner = std::thread::spawn(move || handle.run_blocking());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !session.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(session.run_detached(), Err(Error::EventLoopRunning)));
        session.stop().unwrap();
        runner.join().unwrap().unwrap();
        assert!(!session.is_running());
    }

    #[test]
    fn hooks_run_on_loop_thread_around_delivery() {
        let (event_loop, subs, seen) = setup();
        let (tx, rx) = mpsc::channel();
        let start_tx = tx.clone();
        event_loop
            .set_hooks(
                Some(Box::new(move || {
                    let name = std::thread::current().name().map(str::to_string);
                    let _ = start_tx.send(("start", name));
                })),
                Some(Box::new(move || {
                    let _ = tx.send(("stop", None));
                })),
            )
            .unwrap();
        assert!(matches!(
            event_loop.set_hooks(Some(Box::new(|| {})), None),
            Err(Error::LoopHooksAlreadySet)
        ));
        event_loop.run_detached(subs, "hooked".into()).unwrap();
        push(&event_loop, "a");
        assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        event_loop.stop().unwrap();
        assert_eq!(rx.try_recv().unwrap(), ("start", Some("hooked".to_string())));
        assert_eq!(rx.try_recv().unwrap(), ("stop", None));
    }

    #[test]
    fn failed_spawn_keeps_loop_startable() {
        let (event_loop, subs, seen) = setup();
        let err = event_loop
            .start_detached(subs.clone(), |_body| {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Thread(_)));
        assert!(!event_loop.is_running());
        event_loop.run_detached(subs, "retry".into()).unwrap();
        push(&event_loop, "a");
        assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        event_loop.stop().unwrap();
    }

    #[test]
    fn stop_right_after_start_joins() {
        let (event_loop, subs, seen) = setup();
        for _ in 0..50 {
            event_loop.run_detached(subs.clone(), "quick".into()).unwrap();
            event_loop.stop().unwrap();
            assert!(!event_loop.is_running());
        }
        push(&event_loop, "late");
        assert!(seen.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn stop_from_callback_only_signals() {
        let (tx, rx) = mpsc::channel();
        let event_loop = Arc::new(EventLoop::new(rx, tx));
        let subs = Arc::new(SubscriptionTable::new());
        let inner = event_loop.clone();
        let (done_tx, done_rx) = mpsc::channel();
        subs.insert(
            EventCategory::NewDataObject,
            Box::new(move |_| {
                let _ = done_tx.send(inner.stop().is_ok());
            }),
        )
        .unwrap();
        event_loop.run_detached(subs, "self-stop".into()).unwrap();
        push(&event_loop, "a");
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while event_loop.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!event_loop.is_running());
    }
}
