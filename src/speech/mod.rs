//! Speech output channel.
//!
//! All spoken output funnels through one FIFO consumed by a single dedicated
//! render thread, so at most one unit is ever audible. Callers never block.
//! While a unit is rendering the shared [`PlaybackState`] is set; the capture
//! gate reads it to avoid recording the agent's own voice.

pub mod chunking;
pub mod engine;
pub mod playback;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHandle, Feature};
use chunking::split_into_chunks;
use engine::{FallbackRenderer, SpeechError, Synthesizer, SystemVoice, VoiceEngine, WavFileRenderer};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Set exactly while a speech unit is being rendered.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState(Arc<AtomicBool>);

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_speaking(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Mark playback active until the returned guard drops.
    pub(crate) fn begin(&self) -> SpeakingGuard {
        self.0.store(true, Ordering::SeqCst);
        SpeakingGuard(self.0.clone())
    }

    /// Wait until playback is clear or `max_wait` elapses.
    ///
    /// Returns `true` if playback is clear.
    pub fn wait_until_clear(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        while self.is_speaking() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
        true
    }
}

/// Clears playback when dropped, including on unwind.
pub(crate) struct SpeakingGuard(Arc<AtomicBool>);

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Anything that can queue speech.
pub trait Speak: Send + Sync {
    /// Queue `text` for speaking without waiting for it to be heard.
    fn say(&self, text: &str);

    /// Block until everything queued so far has been rendered, up to `timeout`.
    fn wait_until_idle(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Prefix `text` with "<agent> says: " unless it already names the agent.
pub fn with_agent_prefix(text: &str, agent: &str) -> String {
    if agent.is_empty() || text.to_lowercase().contains(&agent.to_lowercase()) {
        text.to_string()
    } else {
        format!("{} says: {}", agent, text)
    }
}

/// Builds a fresh primary engine; called at startup and on reinitialization.
pub type EngineFactory = Box<dyn Fn() -> Result<Box<dyn VoiceEngine>, SpeechError> + Send + Sync>;

/// Which path produced the audio for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Primary,
    Reinitialized,
    Fallback,
    Failed,
}

/// Primary engine with one reinitialize-and-retry, then a fallback renderer.
pub struct Renderer {
    factory: EngineFactory,
    engine: Mutex<Option<Box<dyn VoiceEngine>>>,
    fallback: Option<Box<dyn FallbackRenderer>>,
}

impl Renderer {
    /// Fails only when neither the primary engine nor a fallback is usable.
    pub fn new(
        factory: EngineFactory,
        fallback: Option<Box<dyn FallbackRenderer>>,
    ) -> Result<Self, SpeechError> {
        let engine = match factory() {
            Ok(engine) => {
                info!(engine = engine.name(), "Primary voice engine initialized");
                Some(engine)
            }
            Err(e) if fallback.is_some() => {
                warn!("Primary voice engine unavailable, using fallback only: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            factory,
            engine: Mutex::new(engine),
            fallback,
        })
    }

    /// Render one unit. Never panics on engine failure; total failure is logged.
    pub fn render(&self, text: &str, max_chunk_len: usize) -> RenderOutcome {
        let chunks = split_into_chunks(text, max_chunk_len);
        if chunks.is_empty() {
            return RenderOutcome::Primary;
        }

        let mut slot = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(engine) => match speak_all(engine.as_mut(), &chunks) {
                Ok(()) => return RenderOutcome::Primary,
                Err(e) => warn!(engine = engine.name(), "Voice engine failed, reinitializing: {}", e),
            },
            None => debug!("No primary voice engine, trying to initialize"),
        }

        *slot = None;
        match (self.factory)() {
            Ok(mut engine) => {
                let result = speak_all(engine.as_mut(), &chunks);
                *slot = Some(engine);
                match result {
                    Ok(()) => return RenderOutcome::Reinitialized,
                    Err(e) => warn!("Voice engine failed after reinitialization: {}", e),
                }
            }
            Err(e) => warn!("Voice engine reinitialization failed: {}", e),
        }
        drop(slot);

        match &self.fallback {
            Some(fallback) => match fallback.render(text) {
                Ok(()) => RenderOutcome::Fallback,
                Err(e) => {
                    error!(renderer = fallback.name(), "Fallback speech failed: {}", e);
                    RenderOutcome::Failed
                }
            },
            None => {
                error!("Speech failed and no fallback renderer is configured");
                RenderOutcome::Failed
            }
        }
    }
}

fn speak_all(engine: &mut dyn VoiceEngine, chunks: &[String]) -> Result<(), SpeechError> {
    for chunk in chunks {
        engine.speak(chunk)?;
    }
    Ok(())
}

/// Renderer backed by the OS synthesizer with the WAV-file fallback.
pub fn system_renderer(config: &ConfigHandle) -> Result<Renderer, SpeechError> {
    let voice = config.snapshot().voice;
    let fallback = Synthesizer::detect().ok().map(|synth| {
        Box::new(WavFileRenderer::new(
            synth,
            voice.rate,
            voice.voice.clone(),
            voice.volume,
        )) as Box<dyn FallbackRenderer>
    });

    let config = config.clone();
    let factory: EngineFactory = Box::new(move || {
        let voice = config.snapshot().voice;
        SystemVoice::detect(voice.rate, voice.voice)
            .map(|engine| Box::new(engine) as Box<dyn VoiceEngine>)
    });
    Renderer::new(factory, fallback)
}

/// The single speech output channel.
pub struct SpeechChannel {
    tx: mpsc::UnboundedSender<String>,
    playback: PlaybackState,
    pending: Arc<AtomicUsize>,
    config: ConfigHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpeechChannel {
    /// Start the render thread.
    pub fn spawn(config: ConfigHandle, renderer: Renderer) -> Self {
        Self::spawn_with_playback(config, renderer, PlaybackState::new())
    }

    /// Start the render thread, publishing playback through `playback`.
    pub fn spawn_with_playback(
        config: ConfigHandle,
        renderer: Renderer,
        playback: PlaybackState,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = {
            let playback = playback.clone();
            let pending = pending.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name("speech-render".into())
                .spawn(move || render_loop(rx, renderer, playback, pending, config))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn speech thread: {}", e);
                None
            }
        };

        Self {
            tx,
            playback,
            pending,
            config,
            worker: Mutex::new(worker),
        }
    }

    /// Queue `text` verbatim. Empty text is dropped.
    pub fn enqueue(&self, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(text).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Speech thread is gone, dropping utterance");
        }
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback.clone()
    }

    /// Units queued or rendering.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting work, drain the queue and join the render thread.
    pub fn shutdown(self) {
        let SpeechChannel { tx, worker, .. } = self;
        drop(tx);
        let handle = worker.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Speech thread panicked");
            }
        }
    }
}

impl Speak for SpeechChannel {
    fn say(&self, text: &str) {
        let config = self.config.snapshot();
        if config.features.is_enabled(Feature::TtsPrefix) {
            self.enqueue(with_agent_prefix(text, &config.agent_name));
        } else {
            self.enqueue(text);
        }
    }

    fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }
}

fn render_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    renderer: Renderer,
    playback: PlaybackState,
    pending: Arc<AtomicUsize>,
    config: ConfigHandle,
) {
    while let Some(text) = rx.blocking_recv() {
        let max_len = config.snapshot().voice.chunk_max_len;
        let outcome = {
            let _speaking = playback.begin();
            catch_unwind(AssertUnwindSafe(|| renderer.render(&text, max_len)))
        };
        match outcome {
            Ok(outcome) => debug!(?outcome, chars = text.len(), "Speech unit rendered"),
            Err(_) => error!("Voice engine panicked while rendering"),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Speech thread exiting");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AgentConfig;

    /// Records every unit handed to `say`, for use by other modules' tests.
    #[derive(Default)]
    pub(crate) struct RecordingSpeaker {
        pub spoken: Mutex<Vec<String>>,
    }

    impl RecordingSpeaker {
        pub fn lines(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    impl Speak for RecordingSpeaker {
        fn say(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }
    }

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    /// Engine that logs chunks and can be told to fail.
    struct ScriptedEngine {
        journal: Arc<Journal>,
        playback: PlaybackState,
        fail: bool,
    }

    impl VoiceEngine for ScriptedEngine {
        fn speak(&mut self, chunk: &str) -> Result<(), SpeechError> {
            if self.fail {
                return Err(SpeechError::Synthesis("scripted failure".into()));
            }
            let now = self.journal.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.max_in_flight.fetch_max(now, Ordering::SeqCst);
            assert!(self.playback.is_speaking());
            std::thread::sleep(Duration::from_millis(2));
            self.journal.events.lock().unwrap().push(chunk.to_string());
            self.journal.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct ScriptedFallback {
        journal: Arc<Journal>,
        fail: bool,
    }

    impl FallbackRenderer for ScriptedFallback {
        fn render(&self, text: &str) -> Result<(), SpeechError> {
            if self.fail {
                return Err(SpeechError::Playback("no device".into()));
            }
            self.journal.events.lock().unwrap().push(format!("fallback:{text}"));
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted-fallback"
        }
    }

    fn plain_config() -> ConfigHandle {
        let mut config = AgentConfig::default();
        config.features.tts_prefix = false;
        ConfigHandle::new(config)
    }

    /// `fail_first` engines fail; later ones succeed.
    fn renderer(
        journal: &Arc<Journal>,
        playback: &PlaybackState,
        fail_first: usize,
        fallback: Option<bool>,
    ) -> (Renderer, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let factory: EngineFactory = {
            let journal = journal.clone();
            let playback = playback.clone();
            let created = created.clone();
            Box::new(move || {
                let n = created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedEngine {
                    journal: journal.clone(),
                    playback: playback.clone(),
                    fail: n < fail_first,
                }) as Box<dyn VoiceEngine>)
            })
        };
        let fallback = fallback.map(|fail| {
            Box::new(ScriptedFallback {
                journal: journal.clone(),
                fail,
            }) as Box<dyn FallbackRenderer>
        });
        (Renderer::new(factory, fallback).unwrap(), created)
    }

    #[test]
    fn test_agent_prefix() {
        assert_eq!(with_agent_prefix("Done.", "Barbaric"), "Barbaric says: Done.");
        assert_eq!(
            with_agent_prefix("I am barbaric.", "Barbaric"),
            "I am barbaric."
        );
    }

    #[test]
    fn test_units_render_in_fifo_order_without_overlap() {
        let journal = Arc::new(Journal::default());
        let config = plain_config();
        let playback = PlaybackState::new();
        let (renderer, _) = renderer(&journal, &playback, 0, None);

        let channel = SpeechChannel::spawn_with_playback(config, renderer, playback.clone());
        for i in 0..20 {
            channel.say(&format!("unit {i}"));
        }
        assert!(channel.wait_until_idle(Duration::from_secs(10)));
        channel.shutdown();

        let events = journal.events.lock().unwrap().clone();
        let expected: Vec<String> = (0..20).map(|i| format!("unit {i}")).collect();
        assert_eq!(events, expected);
        assert_eq!(journal.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!playback.is_speaking());
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        let journal = Arc::new(Journal::default());
        let playback = PlaybackState::new();
        let (renderer, _) = renderer(&journal, &playback, 0, None);
        let channel = Arc::new(SpeechChannel::spawn_with_playback(
            plain_config(),
            renderer,
            playback.clone(),
        ));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let channel = channel.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        channel.say(&format!("p{p} {i}"));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(channel.wait_until_idle(Duration::from_secs(10)));

        let events = journal.events.lock().unwrap().clone();
        assert_eq!(events.len(), 40);
        for p in 0..4 {
            let seen: Vec<usize> = events
                .iter()
                .filter_map(|e| e.strip_prefix(&format!("p{p} ")))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
        assert_eq!(journal.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_engine_is_reinitialized_once() {
        let journal = Arc::new(Journal::default());
        let playback = PlaybackState::new();
        let (renderer, created) = renderer(&journal, &playback, 1, Some(false));

        let _speaking = playback.begin();
        assert_eq!(renderer.render("hello there", 180), RenderOutcome::Reinitialized);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(journal.events.lock().unwrap().clone(), vec!["hello there"]);
    }

    #[test]
    fn test_fallback_after_retry_fails() {
        let journal = Arc::new(Journal::default());
        let playback = PlaybackState::new();
        let (renderer, created) = renderer(&journal, &playback, usize::MAX, Some(false));

        assert_eq!(renderer.render("hello", 180), RenderOutcome::Fallback);
        // startup engine + one reinitialization
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(journal.events.lock().unwrap().clone(), vec!["fallback:hello"]);
    }

    #[test]
    fn test_total_failure_clears_playback() {
        let journal = Arc::new(Journal::default());
        let playback = PlaybackState::new();
        let (renderer, _) = renderer(&journal, &playback, usize::MAX, Some(true));
        let channel =
            SpeechChannel::spawn_with_playback(plain_config(), renderer, playback.clone());

        channel.enqueue("nobody hears this");
        channel.enqueue("or this");
        assert!(channel.wait_until_idle(Duration::from_secs(5)));
        assert!(!playback.is_speaking());
        assert!(journal.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_renderer_requires_some_engine() {
        let factory: EngineFactory =
            Box::new(|| Err(SpeechError::Unavailable("nothing installed".into())));
        assert!(Renderer::new(factory, None).is_err());
    }

    #[test]
    fn test_wait_until_clear_is_bounded() {
        let playback = PlaybackState::new();
        assert!(playback.wait_until_clear(Duration::from_millis(10)));
        let guard = playback.begin();
        let start = Instant::now();
        assert!(!playback.wait_until_clear(Duration::from_millis(120)));
        assert!(start.elapsed() >= Duration::from_millis(120));
        drop(guard);
        assert!(!playback.is_speaking());
    }

    #[test]
    fn test_say_applies_prefix_when_enabled() {
        let journal = Arc::new(Journal::default());
        let playback = PlaybackState::new();
        let (renderer, _) = renderer(&journal, &playback, 0, None);
        let channel = SpeechChannel::spawn_with_playback(
            ConfigHandle::new(AgentConfig::default()),
            renderer,
            playback.clone(),
        );
        channel.say("Opening notepad.");
        assert!(channel.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(
            journal.events.lock().unwrap().clone(),
            vec!["Barbaric says: Opening notepad."]
        );
    }
}
