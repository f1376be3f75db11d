//! Runs validated plans step by step against the effectors and skill host.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::safety::{is_affirmative, is_destructive};
use super::{parse_plan, ActionPlan, Step};
use crate::capture::Listen;
use crate::config::{AgentConfig, ConfigHandle};
use crate::effectors::{EffectorError, EffectorRegistry, Overlay, TextAction};
use crate::skills::SkillHost;
use crate::speech::Speak;

const GENERIC_FAILURE: &str = "Sorry, I could not process the AI response.";
/// Spoken feedback is cut to this many characters.
const FEEDBACK_CHARS: usize = 200;
const OBSERVE_LOG_CHARS: usize = 600;
/// How long to let queued speech drain before opening the microphone.
const SPEECH_DRAIN_WAIT: Duration = Duration::from_secs(15);

/// Tally of one `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// A confirm step was declined, or a step panicked.
    pub aborted: bool,
    /// The plan never parsed.
    pub rejected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Skipped,
    Failed,
    Abort,
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct PlanInterpreter {
    config: ConfigHandle,
    speaker: Arc<dyn Speak>,
    listener: Arc<dyn Listen>,
    effectors: EffectorRegistry,
    skills: Arc<SkillHost>,
    overlay: Option<Arc<dyn Overlay>>,
}

impl PlanInterpreter {
    pub fn new(
        config: ConfigHandle,
        speaker: Arc<dyn Speak>,
        listener: Arc<dyn Listen>,
        effectors: EffectorRegistry,
        skills: Arc<SkillHost>,
    ) -> Self {
        Self {
            config,
            speaker,
            listener,
            effectors,
            skills,
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Arc<dyn Overlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    fn say(&self, text: &str) {
        self.speaker.say(text);
    }

    fn ack(&self, config: &AgentConfig, text: impl AsRef<str>) {
        if config.features.speak_ack {
            self.say(text.as_ref());
        }
    }

    /// Speak `prompt`, let it drain, then capture one answer.
    fn ask(&self, prompt: &str) -> Option<String> {
        if !prompt.trim().is_empty() {
            self.say(prompt);
        }
        if !self.speaker.wait_until_idle(SPEECH_DRAIN_WAIT) {
            warn!("Speech still queued, listening anyway");
        }
        self.listener.capture()
    }

    /// Parse and run raw model output. Never panics or returns an error.
    pub fn execute(&self, raw: &str) -> ExecutionReport {
        match parse_plan(raw) {
            Ok(plan) => self.run(&plan),
            Err(e) => {
                error!(error = %e, raw = %raw, "Rejected model plan");
                self.say(GENERIC_FAILURE);
                ExecutionReport {
                    rejected: true,
                    ..Default::default()
                }
            }
        }
    }

    pub fn run(&self, plan: &ActionPlan) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        info!(steps = plan.len(), "Executing plan");

        for (index, step) in plan.steps().iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_step(step)))
                .unwrap_or_else(|_| {
                    error!(index, action = step.action(), "Step panicked");
                    self.say(GENERIC_FAILURE);
                    StepOutcome::Abort
                });
            debug!(index, action = step.action(), ?outcome, "Step finished");
            match outcome {
                StepOutcome::Done => report.executed += 1,
                StepOutcome::Skipped => report.skipped += 1,
                StepOutcome::Failed => report.failed += 1,
                StepOutcome::Abort => {
                    report.aborted = true;
                    break;
                }
            }
        }
        report
    }

    fn run_step(&self, step: &Step) -> StepOutcome {
        let config = self.config.snapshot();
        if let Some(notice) = step.disabled_notice(&config.features) {
            info!(action = step.action(), "Step skipped: feature disabled");
            self.say(notice);
            return StepOutcome::Skipped;
        }

        match step {
            Step::Command { command } => self.run_command(&config, command),
            Step::Type { text } => {
                if text.is_empty() {
                    self.say("No text provided to type.");
                    return StepOutcome::Skipped;
                }
                self.ack(&config, format!("Typing: {}", text));
                self.outcome(self.effectors.type_text(text), "Failed to type text.")
            }
            Step::Mouse {
                mouse_action,
                value,
                speed,
            } => {
                self.ack(&config, format!("Performing mouse action: {}", mouse_action));
                let result = self.effectors.mouse(mouse_action, value.as_ref(), *speed);
                self.outcome(result, "Failed to control mouse.")
            }
            Step::CursorNav { direction, amount } => {
                let result = self
                    .effectors
                    .cursor_nav(direction, *amount, config.cursor_step);
                self.outcome(result, "Failed to move the cursor.")
            }
            Step::GridNav { cell } => {
                self.outcome(self.effectors.grid_nav(cell.as_ref()), "Failed to move to the grid cell.")
            }
            Step::Window { op } => {
                self.ack(&config, format!("Window: {}", op));
                self.outcome(self.effectors.window(op), "Failed to control window.")
            }
            Step::Key { keys } => {
                self.outcome(self.effectors.press_keys(keys.as_ref()), "Failed to press keys.")
            }
            Step::Observe {} => self.observe(),
            Step::ClickText { text } => self.target_text(
                text,
                TextAction::Click,
                "I could not find that text on screen.",
            ),
            Step::DoubleClickText { text } => self.target_text(
                text,
                TextAction::DoubleClick,
                "I could not find that text on screen.",
            ),
            Step::HoverText { text } => self.target_text(
                text,
                TextAction::Hover,
                "I could not locate that text to hover.",
            ),
            Step::TypeAtText { text, value } => {
                if value.is_empty() {
                    self.say("No text provided to type.");
                    return StepOutcome::Skipped;
                }
                match self.effectors.type_at_text(text, value) {
                    Ok(()) => StepOutcome::Done,
                    Err(EffectorError::Invalid(msg)) => {
                        self.say(&msg);
                        StepOutcome::Skipped
                    }
                    Err(e) => {
                        warn!(target = %text, "type_at_text failed: {}", e);
                        self.say("I could not find the target field by text.");
                        StepOutcome::Failed
                    }
                }
            }
            Step::RunSkill { name, payload } => self.run_skill(name, payload),
            Step::UpdateSkill { name, code } => {
                if !config.dev_mode {
                    self.say("Developer mode is off; code updates are blocked.");
                    return StepOutcome::Skipped;
                }
                match self.skills.install_or_replace(name, code) {
                    Ok(msg) => {
                        self.say(&msg);
                        StepOutcome::Done
                    }
                    Err(e) => {
                        self.say(&e.to_string());
                        StepOutcome::Failed
                    }
                }
            }
            Step::ShowGrid {} => self.set_grid(true),
            Step::HideGrid {} => self.set_grid(false),
            Step::Chat { response } => {
                if !response.trim().is_empty() {
                    info!(response = %response, "Assistant reply");
                    self.say(response);
                }
                StepOutcome::Done
            }
            Step::Confirm { response } => {
                let answer = self.ask(response).unwrap_or_default();
                if is_affirmative(&answer) {
                    StepOutcome::Done
                } else {
                    info!(answer = %answer, "Workflow declined");
                    self.say("Workflow cancelled.");
                    StepOutcome::Abort
                }
            }
            Step::Unrecognized { action } => {
                warn!(action = %action, "Unrecognized plan step");
                self.say("Sorry, I did not understand the AI workflow step.");
                StepOutcome::Skipped
            }
        }
    }

    /// Speak user-facing argument errors verbatim, anything else as `fallback`.
    fn outcome(&self, result: Result<(), EffectorError>, fallback: &str) -> StepOutcome {
        match result {
            Ok(()) => StepOutcome::Done,
            Err(EffectorError::Invalid(msg)) => {
                self.say(&msg);
                StepOutcome::Skipped
            }
            Err(e) => {
                warn!("Effector failed: {}", e);
                self.say(fallback);
                StepOutcome::Failed
            }
        }
    }

    fn run_command(&self, config: &AgentConfig, command: &str) -> StepOutcome {
        let command = command.trim();
        if command.is_empty() {
            self.say("No command provided by AI.");
            return StepOutcome::Skipped;
        }

        if config.features.safety_confirm && is_destructive(command) {
            warn!(command = %command, "Destructive command needs confirmation");
            let answer = self
                .ask("Warning: This command may be dangerous. Do you want to continue?")
                .unwrap_or_default();
            if !is_affirmative(&answer) {
                info!(command = %command, "Destructive command cancelled");
                self.say("Command cancelled for your safety.");
                return StepOutcome::Skipped;
            }
        }

        self.ack(config, format!("Executing: {}", command));
        match self.effectors.run_shell(command) {
            Ok(output) => {
                let stdout = output.stdout.trim();
                let stderr = output.stderr.trim();
                if !stdout.is_empty() {
                    debug!(stdout = %stdout, "Command stdout");
                    self.ack(
                        config,
                        format!("Command output: {}", truncate_chars(stdout, FEEDBACK_CHARS)),
                    );
                }
                if !stderr.is_empty() {
                    debug!(stderr = %stderr, "Command stderr");
                    self.ack(
                        config,
                        format!("Command error: {}", truncate_chars(stderr, FEEDBACK_CHARS)),
                    );
                }
                StepOutcome::Done
            }
            Err(e) => {
                error!(command = %command, "Command execution failed: {}", e);
                self.say("Command execution failed.");
                StepOutcome::Failed
            }
        }
    }

    fn observe(&self) -> StepOutcome {
        match self.effectors.read_screen() {
            Ok(text) if !text.trim().is_empty() => {
                let summary = truncate_chars(text.trim(), OBSERVE_LOG_CHARS);
                info!(chars = text.chars().count(), screen_text = %summary, "Screen read");
                self.say("I analyzed the screen and found some text.");
                StepOutcome::Done
            }
            Ok(_) => {
                self.say("I could not read any text from the screen.");
                StepOutcome::Failed
            }
            Err(e) => {
                warn!("Screen read failed: {}", e);
                self.say("I could not read any text from the screen.");
                StepOutcome::Failed
            }
        }
    }

    fn target_text(&self, target: &str, action: TextAction, not_found: &str) -> StepOutcome {
        match self.effectors.act_on_text(target, action) {
            Ok(_) => StepOutcome::Done,
            Err(EffectorError::Invalid(msg)) => {
                self.say(&msg);
                StepOutcome::Skipped
            }
            Err(e) => {
                warn!(target = %target, ?action, "Text targeting failed: {}", e);
                self.say(not_found);
                StepOutcome::Failed
            }
        }
    }

    fn run_skill(&self, name: &str, payload: &Value) -> StepOutcome {
        match self.skills.invoke(name, payload) {
            Ok(Value::Null) => StepOutcome::Done,
            Ok(result) => {
                let out = match &result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                info!(skill = %name, result = %out, "Skill result");
                self.say(truncate_chars(&out, FEEDBACK_CHARS));
                StepOutcome::Done
            }
            Err(e) => {
                warn!(skill = %name, "Skill failed: {}", e);
                self.say(truncate_chars(&e.to_string(), FEEDBACK_CHARS));
                StepOutcome::Failed
            }
        }
    }

    fn set_grid(&self, visible: bool) -> StepOutcome {
        let Some(overlay) = &self.overlay else {
            self.say("Grid overlay not available.");
            return StepOutcome::Skipped;
        };
        self.outcome(overlay.set_grid_visible(visible), "Grid overlay not available.")
    }
}
