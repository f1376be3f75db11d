//! Utterance -> model -> plan -> interpreter.

pub mod client;

use std::sync::Arc;

use tracing::{error, info};

use crate::plan::{ExecutionReport, PlanInterpreter};
use crate::speech::Speak;
use crate::supervisor::{Flow, UtteranceHandler};

pub use client::ChatPlanner;

const FAREWELL: &str = "Goodbye!";
const UNREACHABLE: &str = "Sorry, I could not reach the AI service.";

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("no API key configured (set {0})")]
    MissingApiKey(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model returned an empty response")]
    EmptyResponse,
}

/// Turns an utterance into raw plan text.
pub trait Planner: Send + Sync {
    fn plan(&self, utterance: &str) -> Result<String, PlannerError>;
}

/// Whether the user asked to end the session ("exit", or "बंद").
pub fn is_exit_phrase(utterance: &str) -> bool {
    utterance.contains("बंद")
        || utterance
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .any(|w| w == "exit")
}

pub struct Assistant {
    planner: Arc<dyn Planner>,
    interpreter: Arc<PlanInterpreter>,
    speaker: Arc<dyn Speak>,
}

impl Assistant {
    pub fn new(
        planner: Arc<dyn Planner>,
        interpreter: Arc<PlanInterpreter>,
        speaker: Arc<dyn Speak>,
    ) -> Self {
        Self {
            planner,
            interpreter,
            speaker,
        }
    }

    pub fn interpreter(&self) -> &Arc<PlanInterpreter> {
        &self.interpreter
    }

    /// Handle one utterance end to end. Model failures are spoken, then returned.
    pub fn respond(&self, utterance: &str) -> Result<Flow, PlannerError> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Ok(Flow::Continue);
        }
        if is_exit_phrase(utterance) {
            info!("Exit phrase received");
            self.speaker.say(FAREWELL);
            return Ok(Flow::Exit);
        }

        let raw = match self.planner.plan(utterance) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Planner failed: {}", e);
                self.speaker.say(UNREACHABLE);
                return Err(e);
            }
        };
        let report: ExecutionReport = self.interpreter.execute(&raw);
        info!(?report, "Utterance handled");
        Ok(Flow::Continue)
    }
}

impl UtteranceHandler for Assistant {
    fn handle(&self, utterance: &str) -> anyhow::Result<Flow> {
        // The failure notice is already spoken; keep the loop going.
        Ok(self.respond(utterance).unwrap_or(Flow::Continue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::ScriptedListener;
    use crate::config::{AgentConfig, ConfigHandle};
    use crate::effectors::tests::{FixedScreen, RecordingInput, RecordingShell};
    use crate::effectors::EffectorRegistry;
    use crate::skills::SkillHost;
    use crate::speech::tests::RecordingSpeaker;
    use std::sync::Mutex;

    struct FakePlanner {
        reply: Result<&'static str, ()>,
        asked: Mutex<Vec<String>>,
    }

    impl Planner for FakePlanner {
        fn plan(&self, utterance: &str) -> Result<String, PlannerError> {
            self.asked.lock().unwrap().push(utterance.to_string());
            match self.reply {
                Ok(raw) => Ok(raw.to_string()),
                Err(()) => Err(PlannerError::EmptyResponse),
            }
        }
    }

    fn assistant(reply: Result<&'static str, ()>) -> (Assistant, Arc<FakePlanner>, Arc<RecordingSpeaker>) {
        let config = ConfigHandle::new(AgentConfig::default());
        let speaker = Arc::new(RecordingSpeaker::default());
        let effectors = EffectorRegistry::new(
            Arc::new(RecordingInput::new()),
            Arc::new(RecordingShell::default()),
            Arc::new(FixedScreen::default()),
        );
        let interpreter = PlanInterpreter::new(
            config.clone(),
            speaker.clone(),
            Arc::new(ScriptedListener::default()),
            effectors,
            Arc::new(SkillHost::new(config)),
        );
        let planner = Arc::new(FakePlanner {
            reply,
            asked: Mutex::new(Vec::new()),
        });
        let assistant = Assistant::new(planner.clone(), Arc::new(interpreter), speaker.clone());
        (assistant, planner, speaker)
    }

    #[test]
    fn test_exit_phrases() {
        assert!(is_exit_phrase("exit"));
        assert!(is_exit_phrase("Please EXIT now."));
        assert!(is_exit_phrase("सब बंद करो"));
        assert!(!is_exit_phrase("open the exits map"));
        assert!(!is_exit_phrase("hello"));
    }

    #[test]
    fn test_exit_says_goodbye_without_model() {
        let (assistant, planner, speaker) = assistant(Ok("[]"));
        assert_eq!(assistant.respond("exit").unwrap(), Flow::Exit);
        assert_eq!(speaker.lines(), vec![FAREWELL]);
        assert!(planner.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_utterance_runs_plan() {
        let (assistant, planner, speaker) =
            assistant(Ok(r#"```json
[{"action":"chat","response":"Hello!"}]
```"#));
        assert_eq!(assistant.respond("  say hi ").unwrap(), Flow::Continue);
        assert_eq!(*planner.asked.lock().unwrap(), vec!["say hi".to_string()]);
        assert_eq!(speaker.lines(), vec!["Hello!"]);
    }

    #[test]
    fn test_planner_failure_is_spoken_and_loop_continues() {
        let (assistant, _, speaker) = assistant(Err(()));
        assert!(assistant.respond("what time is it").is_err());
        assert_eq!(assistant.handle("again").unwrap(), Flow::Continue);
        assert_eq!(speaker.lines(), vec![UNREACHABLE; 2]);
    }
}
