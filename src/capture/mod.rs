//! Capture gate: safe microphone access relative to speech playback.
//!
//! The gate never starts listening while the agent is talking (bounded wait
//! on [`PlaybackState`]), picks the best transcript from the recognizer and
//! does one short follow-up capture when the first utterance is too short.
//! Every failure collapses to `None`; timeouts are silent.

pub mod microphone;
pub mod transcribe;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::speech::PlaybackState;

/// One recognition candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Recognizer confidence in `0.0..=1.0`, when reported.
    pub confidence: Option<f32>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: Some(confidence),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no speech before timeout")]
    Timeout,
    #[error("speech was not intelligible")]
    Unintelligible,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
}

/// Microphone plus recognizer.
pub trait Microphone: Send + Sync {
    /// Measure ambient noise for `duration` and adjust the speech threshold.
    fn calibrate(&self, duration: Duration) -> Result<(), CaptureError>;

    /// Wait up to `timeout` for speech, record at most `phrase_limit`, and
    /// return all recognition candidates.
    fn listen(&self, timeout: Duration, phrase_limit: Duration)
        -> Result<Vec<Transcript>, CaptureError>;
}

/// Something that can hear one utterance.
pub trait Listen: Send + Sync {
    fn capture(&self) -> Option<String>;
}

/// Highest-confidence candidate, ties broken by length.
pub fn best_transcript(candidates: &[Transcript]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (c.confidence.unwrap_or(0.0), c.text.trim()))
        .filter(|(_, text)| !text.is_empty())
        .max_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.chars().count().cmp(&b.1.chars().count()))
        })
        .map(|(_, text)| text.to_string())
}

pub struct CaptureGate {
    mic: Arc<dyn Microphone>,
    playback: PlaybackState,
    config: ConfigHandle,
}

impl CaptureGate {
    pub fn new(mic: Arc<dyn Microphone>, playback: PlaybackState, config: ConfigHandle) -> Self {
        Self {
            mic,
            playback,
            config,
        }
    }

    /// Wait out playback; `false` if the agent is still talking after `max_wait`.
    fn quiet(&self, max_wait: Duration) -> bool {
        let clear = self.playback.wait_until_clear(max_wait);
        if !clear {
            debug!("Still speaking after bounded wait, skipping capture");
        }
        clear
    }

    fn listen_once(&self, timeout: Duration, phrase_limit: Duration) -> Option<String> {
        match self.mic.listen(timeout, phrase_limit) {
            Ok(candidates) => {
                let best = best_transcript(&candidates);
                if best.is_none() {
                    debug!("Recognizer returned no usable candidates");
                }
                best
            }
            Err(CaptureError::Timeout) => {
                debug!("No speech before timeout");
                None
            }
            Err(CaptureError::Unintelligible) => {
                debug!("Could not understand audio");
                None
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                None
            }
        }
    }
}

impl Listen for CaptureGate {
    fn capture(&self) -> Option<String> {
        let settings = self.config.snapshot().capture;

        if !self.quiet(settings.playback_wait()) {
            return None;
        }

        if let Err(e) = self.mic.calibrate(settings.calibration()) {
            warn!("Ambient calibration failed: {}", e);
        }

        // Speech may have been queued while calibrating.
        if !self.quiet(settings.playback_wait()) {
            return None;
        }
        let mut utterance = self.listen_once(settings.timeout(), settings.phrase_limit())?;

        if utterance.split_whitespace().count() < settings.followup_min_words
            && self.quiet(settings.playback_wait())
        {
            if let Some(more) =
                self.listen_once(settings.followup_timeout(), settings.followup_phrase_limit())
            {
                utterance.push(' ');
                utterance.push_str(&more);
            }
        }

        info!(utterance = %utterance, "Heard");
        Some(utterance)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Replays a fixed list of answers, then `None`.
    #[derive(Default)]
    pub(crate) struct ScriptedListener {
        answers: Mutex<VecDeque<Option<String>>>,
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedListener {
        pub fn new<I: IntoIterator<Item = Option<&'static str>>>(answers: I) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().map(|a| a.map(String::from)).collect()),
                calls: Default::default(),
            }
        }
    }

    impl Listen for ScriptedListener {
        fn capture(&self) -> Option<String> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.answers.lock().unwrap().pop_front().flatten()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct ListenCall {
        timeout: Duration,
        speaking: bool,
    }

    struct ScriptedMic {
        playback: PlaybackState,
        results: Mutex<VecDeque<Result<Vec<Transcript>, CaptureError>>>,
        listens: Mutex<Vec<ListenCall>>,
        calibrations: Mutex<usize>,
        /// Playback starts during calibration and lasts this long.
        speak_on_calibrate: Mutex<Option<Duration>>,
    }

    impl ScriptedMic {
        fn new(playback: &PlaybackState, results: Vec<Result<Vec<Transcript>, CaptureError>>) -> Arc<Self> {
            Arc::new(Self {
                playback: playback.clone(),
                results: Mutex::new(results.into()),
                listens: Mutex::new(Vec::new()),
                calibrations: Mutex::new(0),
                speak_on_calibrate: Mutex::new(None),
            })
        }
    }

    impl Microphone for ScriptedMic {
        fn calibrate(&self, _duration: Duration) -> Result<(), CaptureError> {
            *self.calibrations.lock().unwrap() += 1;
            if let Some(hold) = *self.speak_on_calibrate.lock().unwrap() {
                let guard = self.playback.begin();
                std::thread::spawn(move || {
                    std::thread::sleep(hold);
                    drop(guard);
                });
            }
            Ok(())
        }

        fn listen(&self, timeout: Duration, _phrase_limit: Duration) -> Result<Vec<Transcript>, CaptureError> {
            self.listens.lock().unwrap().push(ListenCall {
                timeout,
                speaking: self.playback.is_speaking(),
            });
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CaptureError::Timeout))
        }
    }

    fn gate(mic: Arc<ScriptedMic>, playback: &PlaybackState, wait_secs: f64) -> CaptureGate {
        let mut config = AgentConfig::default();
        config.capture.playback_wait_secs = wait_secs;
        CaptureGate::new(mic, playback.clone(), ConfigHandle::new(config))
    }

    #[test]
    fn test_best_transcript_prefers_confidence_then_length() {
        let candidates = vec![
            Transcript::with_confidence("open chrome", 0.62),
            Transcript::with_confidence("open chrome browser", 0.91),
            Transcript::with_confidence("open crow", 0.91),
        ];
        assert_eq!(best_transcript(&candidates).as_deref(), Some("open chrome browser"));

        let unscored = vec![Transcript::new("hi"), Transcript::new("hi there")];
        assert_eq!(best_transcript(&unscored).as_deref(), Some("hi there"));
        assert_eq!(best_transcript(&[Transcript::new("  ")]), None);
        assert_eq!(best_transcript(&[]), None);
    }

    #[test]
    fn test_long_utterance_needs_no_followup() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(
            &playback,
            vec![Ok(vec![Transcript::new("open the downloads folder please")])],
        );
        let heard = gate(mic.clone(), &playback, 1.0).capture();
        assert_eq!(heard.as_deref(), Some("open the downloads folder please"));
        assert_eq!(mic.listens.lock().unwrap().len(), 1);
        assert_eq!(*mic.calibrations.lock().unwrap(), 1);
    }

    #[test]
    fn test_short_utterance_gets_one_followup() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(
            &playback,
            vec![
                Ok(vec![Transcript::new("open")]),
                Ok(vec![Transcript::new("notepad")]),
            ],
        );
        let heard = gate(mic.clone(), &playback, 1.0).capture();
        assert_eq!(heard.as_deref(), Some("open notepad"));
        let listens = mic.listens.lock().unwrap();
        assert_eq!(listens.len(), 2);
        assert_eq!(listens[1].timeout, Duration::from_millis(1200));
    }

    #[test]
    fn test_followup_timeout_keeps_first_utterance() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(&playback, vec![Ok(vec![Transcript::new("yes")])]);
        assert_eq!(gate(mic, &playback, 1.0).capture().as_deref(), Some("yes"));
    }

    #[test]
    fn test_timeout_and_errors_yield_none() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(
            &playback,
            vec![
                Err(CaptureError::Timeout),
                Err(CaptureError::Unintelligible),
                Err(CaptureError::Device("unplugged".into())),
            ],
        );
        let gate = gate(mic, &playback, 1.0);
        assert_eq!(gate.capture(), None);
        assert_eq!(gate.capture(), None);
        assert_eq!(gate.capture(), None);
    }

    #[test]
    fn test_waits_for_playback_to_clear() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(
            &playback,
            vec![Ok(vec![Transcript::new("what time is it now")])],
        );
        let guard = playback.begin();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(guard);
        });

        let start = Instant::now();
        let heard = gate(mic.clone(), &playback, 3.0).capture();
        releaser.join().unwrap();

        assert_eq!(heard.as_deref(), Some("what time is it now"));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(mic.listens.lock().unwrap().iter().all(|call| !call.speaking));
    }

    #[test]
    fn test_gives_up_while_still_speaking() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(&playback, vec![Ok(vec![Transcript::new("echo of myself")])]);
        let _guard = playback.begin();
        assert_eq!(gate(mic.clone(), &playback, 0.1).capture(), None);
        assert!(mic.listens.lock().unwrap().is_empty());
        assert_eq!(*mic.calibrations.lock().unwrap(), 0);
    }

    #[test]
    fn test_speech_queued_during_calibration_is_waited_out() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(
            &playback,
            vec![Ok(vec![Transcript::new("turn the volume down")])],
        );
        *mic.speak_on_calibrate.lock().unwrap() = Some(Duration::from_millis(150));

        let heard = gate(mic.clone(), &playback, 3.0).capture();
        assert_eq!(heard.as_deref(), Some("turn the volume down"));
        let listens = mic.listens.lock().unwrap();
        assert_eq!(listens.len(), 1);
        assert!(!listens[0].speaking);
    }

    #[test]
    fn test_long_speech_after_calibration_skips_capture() {
        let playback = PlaybackState::new();
        let mic = ScriptedMic::new(&playback, vec![Ok(vec![Transcript::new("my own voice")])]);
        *mic.speak_on_calibrate.lock().unwrap() = Some(Duration::from_secs(2));

        assert_eq!(gate(mic.clone(), &playback, 0.1).capture(), None);
        assert_eq!(*mic.calibrations.lock().unwrap(), 1);
        assert!(mic.listens.lock().unwrap().is_empty());
    }
}
