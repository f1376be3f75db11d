//! IPC protocol types for communication with a host UI.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (agent -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> agent).

pub mod bridge;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::effectors::{EffectorError, Overlay};
use crate::speech::Speak;
use bridge::emit_event;

// ---------------------------------------------------------------------------
// Events: agent -> host (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the host via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Starting {},
    Loading { step: String },
    Ready {},
    /// Every utterance queued for speech.
    Response { text: String },
    Transcription { text: String },
    ListeningState { active: bool },
    GridOverlay { visible: bool },
    SkillsReloaded { count: usize },
    ConfigUpdated { config: serde_json::Value },
    Error { message: String },
    Pong {},
    Stopping {},
}

// ---------------------------------------------------------------------------
// Commands: host -> agent (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the host via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum AgentCommand {
    /// Typed request, handled like a spoken one.
    Query { text: String },
    /// Run a plan directly, bypassing the model.
    ExecutePlan { plan: serde_json::Value },
    /// Capture one utterance and handle it.
    ListenOnce {},
    SystemSpeak { text: String },
    SetAlwaysListen { enabled: bool },
    ReloadSkills {},
    ConfigUpdate {
        #[serde(default)]
        config: serde_json::Value,
    },
    Ping {},
    Stop {},
}

/// Speaker that also reports each utterance to the host.
pub struct EchoSpeaker {
    inner: Arc<dyn Speak>,
}

impl EchoSpeaker {
    pub fn new(inner: Arc<dyn Speak>) -> Self {
        Self { inner }
    }
}

impl Speak for EchoSpeaker {
    fn say(&self, text: &str) {
        if !text.trim().is_empty() {
            emit_event(&AgentEvent::Response {
                text: text.to_string(),
            });
        }
        self.inner.say(text);
    }

    fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.inner.wait_until_idle(timeout)
    }
}

/// Grid overlay drawn by the host UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpcOverlay;

impl Overlay for IpcOverlay {
    fn set_grid_visible(&self, visible: bool) -> Result<(), EffectorError> {
        emit_event(&AgentEvent::GridOverlay { visible });
        Ok(())
    }
}
