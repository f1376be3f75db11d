//! Action plans produced by the language model.
//!
//! A plan is a JSON object (one step) or array (many steps), each step tagged
//! by `"action"`. The whole plan is validated before anything runs: a single
//! malformed step rejects the plan. Unknown action names are not malformed;
//! they become [`Step::Unrecognized`] and are answered with a spoken notice.

pub mod interpreter;
pub mod safety;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::config::{Feature, FeatureToggles};

pub use interpreter::{ExecutionReport, PlanInterpreter};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object or array, got {0}")]
    NotAPlan(&'static str),
    #[error("step {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("step {index} has no \"action\" field")]
    MissingAction { index: usize },
    #[error("step {index} ({action}) is malformed: {source}")]
    InvalidStep {
        index: usize,
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One unit of a plan.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Run a shell command.
    Command {
        #[serde(default, deserialize_with = "null_as_empty")]
        command: String,
    },
    /// Type text at the current focus.
    Type {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
    },
    Mouse {
        #[serde(default, deserialize_with = "null_as_empty")]
        mouse_action: String,
        #[serde(default)]
        value: Option<Value>,
        /// Glide duration in seconds.
        #[serde(default, deserialize_with = "number_or_numeric_string")]
        speed: Option<f64>,
    },
    CursorNav {
        #[serde(default, deserialize_with = "null_as_empty")]
        direction: String,
        #[serde(default, deserialize_with = "number_or_numeric_string")]
        amount: Option<f64>,
    },
    /// Jump to a cell of the 3x3 screen grid (1 = bottom-left, 9 = top-right).
    GridNav {
        #[serde(default)]
        cell: Option<Value>,
    },
    Window {
        #[serde(default, deserialize_with = "null_as_empty")]
        op: String,
    },
    /// Read screen text.
    Observe {},
    ClickText {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
    },
    DoubleClickText {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
    },
    HoverText {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
    },
    TypeAtText {
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        value: String,
    },
    RunSkill {
        #[serde(default, deserialize_with = "null_as_empty")]
        name: String,
        #[serde(default)]
        payload: Value,
    },
    UpdateSkill {
        #[serde(default, deserialize_with = "null_as_empty")]
        name: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        code: String,
    },
    ShowGrid {},
    HideGrid {},
    /// A key name or a list of key names pressed as a chord.
    Key {
        #[serde(default)]
        keys: Option<Value>,
    },
    Chat {
        #[serde(default, deserialize_with = "null_as_empty")]
        response: String,
    },
    /// Ask the user; anything but an affirmative answer ends the plan.
    Confirm {
        #[serde(default, deserialize_with = "null_as_empty")]
        response: String,
    },
    #[serde(skip)]
    Unrecognized { action: String },
}

/// `null` reads as an empty string; other non-strings are still malformed.
fn null_as_empty<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(de)?.unwrap_or_default())
}

/// Models sometimes quote numbers. Anything unparseable counts as absent.
fn number_or_numeric_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}

const KNOWN_ACTIONS: &[&str] = &[
    "command",
    "type",
    "mouse",
    "cursor_nav",
    "grid_nav",
    "window",
    "observe",
    "click_text",
    "double_click_text",
    "hover_text",
    "type_at_text",
    "run_skill",
    "update_skill",
    "show_grid",
    "hide_grid",
    "key",
    "chat",
    "confirm",
];

impl Step {
    /// Parse one step. Unknown actions are accepted as `Unrecognized`.
    pub fn from_value(index: usize, value: Value) -> Result<Self, PlanError> {
        if !value.is_object() {
            return Err(PlanError::NotAnObject { index });
        }
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(PlanError::MissingAction { index })?
            .to_string();
        if !KNOWN_ACTIONS.contains(&action.as_str()) {
            return Ok(Self::Unrecognized { action });
        }
        serde_json::from_value(value).map_err(|source| PlanError::InvalidStep {
            index,
            action,
            source,
        })
    }

    pub fn action(&self) -> &str {
        match self {
            Self::Command { .. } => "command",
            Self::Type { .. } => "type",
            Self::Mouse { .. } => "mouse",
            Self::CursorNav { .. } => "cursor_nav",
            Self::GridNav { .. } => "grid_nav",
            Self::Window { .. } => "window",
            Self::Observe {} => "observe",
            Self::ClickText { .. } => "click_text",
            Self::DoubleClickText { .. } => "double_click_text",
            Self::HoverText { .. } => "hover_text",
            Self::TypeAtText { .. } => "type_at_text",
            Self::RunSkill { .. } => "run_skill",
            Self::UpdateSkill { .. } => "update_skill",
            Self::ShowGrid {} => "show_grid",
            Self::HideGrid {} => "hide_grid",
            Self::Key { .. } => "key",
            Self::Chat { .. } => "chat",
            Self::Confirm { .. } => "confirm",
            Self::Unrecognized { action } => action,
        }
    }

    /// Feature toggles this step needs, in the order they are checked.
    pub fn required_features(&self) -> &'static [Feature] {
        match self {
            Self::CursorNav { .. } => &[Feature::CursorNav],
            Self::GridNav { .. } | Self::ShowGrid {} | Self::HideGrid {} => &[Feature::GridNav],
            Self::Observe {} => &[Feature::Ocr],
            Self::ClickText { .. }
            | Self::DoubleClickText { .. }
            | Self::HoverText { .. }
            | Self::TypeAtText { .. } => &[Feature::Ocr, Feature::ClickText],
            Self::RunSkill { .. } | Self::UpdateSkill { .. } => &[Feature::Skills],
            _ => &[],
        }
    }

    /// Spoken notice when a required feature is switched off.
    pub fn disabled_notice(&self, features: &FeatureToggles) -> Option<&'static str> {
        let off = self
            .required_features()
            .iter()
            .copied()
            .find(|f| !features.is_enabled(*f))?;
        Some(match (self, off) {
            (_, Feature::CursorNav) => "Cursor navigation is disabled in settings.",
            (Self::ShowGrid {} | Self::HideGrid {}, Feature::GridNav) => {
                "Grid overlay is disabled in settings."
            }
            (_, Feature::GridNav) => "Grid navigation is disabled in settings.",
            (Self::Observe {}, Feature::Ocr) => "Screen reading is disabled in settings.",
            (_, Feature::Ocr) => "OCR is disabled in settings.",
            (_, Feature::ClickText) => "Click by text is disabled in settings.",
            (_, Feature::Skills) => "Skills are disabled in settings.",
            _ => "That action is disabled in settings.",
        })
    }
}

/// An ordered, fully validated list of steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPlan {
    steps: Vec<Step>,
}

impl ActionPlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Strip a Markdown code fence (```json ... ```) around model output.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_fence = &trimmed[start + 3..];
    let content_start = after_fence.find('\n').map_or(0, |nl| nl + 1);
    let content = &after_fence[content_start..];
    match content.find("```") {
        Some(end) => content[..end].trim(),
        None => trimmed,
    }
}

/// Parse raw model output into a plan, rejecting it if any step is malformed.
pub fn parse_plan(raw: &str) -> Result<ActionPlan, PlanError> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))?;
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        Value::Null => return Err(PlanError::NotAPlan("null")),
        Value::Bool(_) => return Err(PlanError::NotAPlan("a boolean")),
        Value::Number(_) => return Err(PlanError::NotAPlan("a number")),
        Value::String(_) => return Err(PlanError::NotAPlan("a string")),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| Step::from_value(index, item))
        .collect::<Result<Vec<_>, _>>()
        .map(ActionPlan::new)
}
