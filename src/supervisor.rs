//! Always-listen loop: capture, hand the utterance off, repeat.
//!
//! Lifecycle is `stopped -> running -> stopping -> stopped`, tracked in an
//! `AtomicU8`. Stop is cooperative and observed between cycles, so a cycle in
//! progress always finishes. At most one loop thread exists at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::Listen;
use crate::speech::Speak;

const IDLE_PAUSE: Duration = Duration::from_millis(200);
const ERROR_PAUSE: Duration = Duration::from_millis(500);
const ERROR_NOTICE: &str = "Sorry, something went wrong while listening.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Whether the session should keep going after an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Receives each non-empty utterance captured by the loop.
pub trait UtteranceHandler: Send + Sync {
    fn handle(&self, utterance: &str) -> anyhow::Result<Flow>;
}

type ExitHook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    state: AtomicU8,
    active_loops: AtomicUsize,
    listener: Arc<dyn Listen>,
    handler: Arc<dyn UtteranceHandler>,
    speaker: Arc<dyn Speak>,
    idle_pause: Duration,
    error_pause: Duration,
    on_exit: Option<ExitHook>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sleep up to `pause`; `stop` unparks early.
    fn pause(&self, pause: Duration) {
        if self.state() == SessionState::Running {
            thread::park_timeout(pause);
        }
    }

    fn cycle(&self) -> anyhow::Result<Option<Flow>> {
        let Some(utterance) = self.listener.capture() else {
            return Ok(None);
        };
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Ok(None);
        }
        info!(utterance = %utterance, "Heard");
        self.handler.handle(utterance).map(Some)
    }

    fn run(&self) {
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        info!("Always-listen loop started");
        loop {
            match self.state() {
                SessionState::Running => {}
                SessionState::Stopping => {
                    if self.transition(SessionState::Stopping, SessionState::Stopped) {
                        break;
                    }
                    // Restarted while stopping; keep this loop.
                    continue;
                }
                SessionState::Stopped => break,
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.cycle())) {
                Ok(Ok(Some(Flow::Continue))) => {}
                Ok(Ok(Some(Flow::Exit))) => {
                    info!("Exit requested from always-listen");
                    self.transition(SessionState::Running, SessionState::Stopping);
                    if let Some(hook) = &self.on_exit {
                        hook();
                    }
                }
                Ok(Ok(None)) => self.pause(self.idle_pause),
                Ok(Err(e)) => {
                    error!("Always-listen cycle failed: {:#}", e);
                    self.speaker.say(ERROR_NOTICE);
                    self.pause(self.error_pause);
                }
                Err(_) => {
                    error!("Always-listen cycle panicked");
                    self.speaker.say(ERROR_NOTICE);
                    self.pause(self.error_pause);
                }
            }
        }
        self.active_loops.fetch_sub(1, Ordering::SeqCst);
        info!("Always-listen loop stopped");
    }
}

pub struct ListeningSupervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningSupervisor {
    pub fn new(
        listener: Arc<dyn Listen>,
        handler: Arc<dyn UtteranceHandler>,
        speaker: Arc<dyn Speak>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(SessionState::Stopped as u8),
                active_loops: AtomicUsize::new(0),
                listener,
                handler,
                speaker,
                idle_pause: IDLE_PAUSE,
                error_pause: ERROR_PAUSE,
                on_exit: None,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Must be called before the first `start`.
    pub fn with_pauses(mut self, idle: Duration, error: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.idle_pause = idle;
            shared.error_pause = error;
        }
        self
    }

    /// Called from the loop thread when an utterance ends the session.
    pub fn with_exit_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_exit = Some(Box::new(hook));
        }
        self
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Loop threads currently alive.
    pub fn active_loops(&self) -> usize {
        self.shared.active_loops.load(Ordering::SeqCst)
    }

    /// Start the loop. Returns `false` when it was already running.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.transition(SessionState::Stopping, SessionState::Running) {
            debug!("Always-listen resumed before its loop exited");
            return true;
        }
        if !self.shared.transition(SessionState::Stopped, SessionState::Running) {
            return false;
        }
        if let Some(previous) = worker.take() {
            // Already observed Stopped; exits promptly.
            if previous.join().is_err() {
                warn!("Previous always-listen thread panicked");
            }
        }
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("always-listen".into())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn always-listen thread: {}", e);
                self.shared.state.store(SessionState::Stopped as u8, Ordering::Release);
                false
            }
        }
    }

    /// Ask the loop to exit after its current cycle. Returns `false` if not running.
    pub fn stop(&self) -> bool {
        if !self.shared.transition(SessionState::Running, SessionState::Stopping) {
            return false;
        }
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.thread().unpark();
        }
        true
    }

    /// Wait for a stopped loop thread to finish.
    pub fn join(&self) {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Always-listen thread panicked");
            }
        }
    }
}

impl Drop for ListeningSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::ScriptedListener;
    use crate::speech::tests::RecordingSpeaker;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingHandler {
        heard: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        fail_on: Option<&'static str>,
        exit_on: Option<&'static str>,
        panic_on: Option<&'static str>,
    }

    impl UtteranceHandler for RecordingHandler {
        fn handle(&self, utterance: &str) -> anyhow::Result<Flow> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            self.heard.lock().unwrap().push(utterance.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on == Some(utterance) {
                panic!("handler blew up");
            }
            if self.fail_on == Some(utterance) {
                anyhow::bail!("model unreachable");
            }
            if self.exit_on == Some(utterance) {
                return Ok(Flow::Exit);
            }
            Ok(Flow::Continue)
        }
    }

    impl RecordingHandler {
        fn heard(&self) -> Vec<String> {
            self.heard.lock().unwrap().clone()
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn supervisor(
        answers: Vec<Option<&'static str>>,
        handler: Arc<RecordingHandler>,
        speaker: Arc<RecordingSpeaker>,
    ) -> ListeningSupervisor {
        ListeningSupervisor::new(Arc::new(ScriptedListener::new(answers)), handler, speaker)
            .with_pauses(Duration::from_millis(5), Duration::from_millis(5))
    }

    #[test]
    fn test_start_is_idempotent() {
        let handler = Arc::new(RecordingHandler::default());
        let sup = supervisor(vec![], handler, Arc::new(RecordingSpeaker::default()));
        assert_eq!(sup.state(), SessionState::Stopped);
        assert!(sup.start());
        assert!(!sup.start());
        assert!(wait_for(|| sup.active_loops() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(sup.active_loops(), 1);

        assert!(sup.stop());
        sup.join();
        assert_eq!(sup.state(), SessionState::Stopped);
        assert_eq!(sup.active_loops(), 0);
        assert!(!sup.stop());
    }

    #[test]
    fn test_cycles_are_sequential_and_ordered() {
        let handler = Arc::new(RecordingHandler::default());
        let sup = supervisor(
            vec![Some("one"), None, Some("  two "), Some(""), Some("three")],
            handler.clone(),
            Arc::new(RecordingSpeaker::default()),
        );
        sup.start();
        assert!(wait_for(|| handler.heard().len() == 3));
        sup.stop();
        sup.join();
        assert_eq!(handler.heard(), vec!["one", "two", "three"]);
        assert!(!handler.overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_cycle_speaks_notice_and_continues() {
        let handler = Arc::new(RecordingHandler {
            fail_on: Some("first"),
            panic_on: Some("second"),
            ..Default::default()
        });
        let speaker = Arc::new(RecordingSpeaker::default());
        let sup = supervisor(
            vec![Some("first"), Some("second"), Some("third")],
            handler.clone(),
            speaker.clone(),
        );
        sup.start();
        assert!(wait_for(|| handler.heard().len() == 3));
        assert!(sup.is_running());
        sup.stop();
        sup.join();
        assert_eq!(speaker.lines(), vec![ERROR_NOTICE; 2]);
    }

    #[test]
    fn test_exit_utterance_ends_session() {
        let handler = Arc::new(RecordingHandler {
            exit_on: Some("exit"),
            ..Default::default()
        });
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let sup = supervisor(
            vec![Some("hello"), Some("exit"), Some("never")],
            handler.clone(),
            Arc::new(RecordingSpeaker::default()),
        )
        .with_exit_hook(move || flag.store(true, Ordering::SeqCst));

        sup.start();
        assert!(wait_for(|| sup.state() == SessionState::Stopped));
        sup.join();
        assert!(exited.load(Ordering::SeqCst));
        assert_eq!(handler.heard(), vec!["hello", "exit"]);
    }

    #[test]
    fn test_restart_after_stop() {
        let handler = Arc::new(RecordingHandler::default());
        let sup = supervisor(vec![], handler, Arc::new(RecordingSpeaker::default()));
        sup.start();
        sup.stop();
        assert!(sup.start());
        assert!(wait_for(|| sup.is_running() && sup.active_loops() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(sup.active_loops(), 1);
        sup.stop();
        sup.join();
        assert_eq!(sup.state(), SessionState::Stopped);
    }
}
