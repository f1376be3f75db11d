//! OpenAI-compatible chat completions client (Cerebras by default).

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use super::{Planner, PlannerError};
use crate::config::{AgentConfig, ConfigHandle};

fn shell_hint() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows shell commands (cmd.exe or PowerShell)"
    } else if cfg!(target_os = "macos") {
        "macOS shell commands (sh/zsh, open, osascript)"
    } else {
        "Linux shell commands (sh, xdg-open)"
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Instructions describing the step vocabulary and the host.
pub fn system_prompt(config: &AgentConfig) -> String {
    let context = format!(
        "OS: {} | Arch: {} | User: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        current_user()
    );
    let mut prompt = format!(
        "You are {name}, a smart AI voice assistant for the desktop. System context: {context}. \
         For any user request, generate a JSON array of steps. \
         For system actions, generate {shell} in the 'command' field: {{\"action\": \"command\", \"command\": \"...\"}}. \
         To type text, use: {{\"action\": \"type\", \"text\": \"the text to type\"}}. \
         To control the mouse, use: {{\"action\": \"mouse\", \"mouse_action\": \"move|move_by|path|click|double_click|right_click|scroll|drag\", \"value\": value, \"speed\": optional_seconds}}. \
         For cursor navigation, use: {{\"action\": \"cursor_nav\", \"direction\": \"up|down|left|right|center|top_left|top_right|bottom_left|bottom_right\", \"amount\": optional_pixels}}. \
         To snap to a 3x3 grid cell (like a numpad), use: {{\"action\": \"grid_nav\", \"cell\": 1-9}} where 1=bottom_left, 5=center, 9=top_right. \
         To press keys, use: {{\"action\": \"key\", \"keys\": \"enter\"}} or {{\"action\": \"key\", \"keys\": [\"ctrl\", \"c\"]}}. \
         To control windows, use: {{\"action\": \"window\", \"op\": \"maximize|minimize|close|switch\"}}. \
         To observe the screen, use: {{\"action\": \"observe\"}}. \
         To interact by visible text, use: {{\"action\": \"click_text\", \"text\": \"label\"}}, {{\"action\": \"double_click_text\", \"text\": \"label\"}}, {{\"action\": \"hover_text\", \"text\": \"label\"}}, or {{\"action\": \"type_at_text\", \"text\": \"label\", \"value\": \"input\"}}. \
         To show or hide the on-screen navigation grid, use: {{\"action\": \"show_grid\"}} or {{\"action\": \"hide_grid\"}}. \
         To run a custom skill, use: {{\"action\": \"run_skill\", \"name\": \"skill_name\", \"payload\": {{}}}}. ",
        name = config.agent_name,
        context = context,
        shell = shell_hint(),
    );
    if config.dev_mode {
        prompt.push_str(
            "Developer mode is enabled: you may add or replace a skill via \
             {\"action\": \"update_skill\", \"name\": \"skill_name\", \"code\": \"script text\"}. \
             A skill is a script that reads {\"payload\", \"context\"} JSON on stdin and prints its result; \
             start it with #!/usr/bin/env python3 or #!/usr/bin/env node to pick the runtime, otherwise it runs with sh. \
             Restrict changes to skills only. ",
        );
    }
    prompt.push_str(
        "When OCR is unavailable, fall back to key/mouse actions or ask the user to install Tesseract. \
         For chat, use {\"action\": \"chat\", \"response\": \"...\"}. \
         For confirmation, use {\"action\": \"confirm\", \"response\": \"question\"}. \
         Always use English for all JSON keys, responses can be conversational. \
         Be concise and only generate the minimum steps needed. \
         Reply with JSON only.",
    );
    prompt
}

/// First choice's message content from a chat completion body.
pub fn completion_content(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

pub struct ChatPlanner {
    config: ConfigHandle,
    client: reqwest::blocking::Client,
}

impl ChatPlanner {
    /// Build outside any async runtime; the blocking client owns its own.
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Planner for ChatPlanner {
    fn plan(&self, utterance: &str) -> Result<String, PlannerError> {
        let config = self.config.snapshot();
        let settings = &config.model;
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| PlannerError::MissingApiKey(settings.api_key_env.clone()))?;

        let url = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));
        let body = json!({
            "model": settings.model,
            "messages": [
                { "role": "system", "content": system_prompt(&config) },
                { "role": "user", "content": utterance },
            ],
        });
        debug!(model = %settings.model, url = %url, "Requesting plan");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .json(&body)
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(PlannerError::Api { status, body });
        }

        let json: Value = resp.json()?;
        let content = completion_content(&json).unwrap_or("").trim();
        if content.is_empty() {
            return Err(PlannerError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}
