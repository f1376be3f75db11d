//! Effector registry: everything the agent can do to the desktop.
//!
//! Three capability boundaries keep the OS at arm's length:
//! [`InputBackend`] (mouse, keyboard, typing), [`ShellBackend`] and
//! [`ScreenReader`] (OCR). The registry holds one of each and implements the
//! step semantics (glides, grid cells, text targeting, hotkeys) on top of
//! them, so the geometry is testable without a display.

pub mod input;
pub mod ocr;
pub mod shell;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

pub use input::RdevInput;
pub use ocr::TesseractReader;
pub use shell::SystemShell;

pub const DEFAULT_GLIDE_SECS: f64 = 0.2;
const MIN_GLIDE_SECS: f64 = 0.01;
const MAX_GLIDE_SECS: f64 = 5.0;
const GLIDE_STEP: Duration = Duration::from_millis(10);
/// Glide used by cursor, grid and text-targeting moves.
pub const NAV_GLIDE: Duration = Duration::from_millis(120);
const CORNER_MARGIN: i32 = 10;
const DEFAULT_SCROLL: i64 = -300;

pub const INVALID_MOUSE: &str = "Unknown mouse action or missing value.";

#[derive(Debug, thiserror::Error)]
pub enum EffectorError {
    /// Bad arguments from the plan; the message is user-facing.
    #[error("{0}")]
    Invalid(String),
    #[error("text not found on screen: {0}")]
    TextNotFound(String),
    #[error("input simulation failed: {0}")]
    Input(String),
    #[error("clipboard error: {0}")]
    Clipboard(String),
    #[error("screen capture failed: {0}")]
    Screen(String),
    #[error("OCR failed: {0}")]
    Ocr(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EffectorError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

impl ScreenSize {
    pub fn clamp(&self, p: Point) -> Point {
        Point::new(
            p.x.clamp(0, (self.width - 1).max(0)),
            p.y.clamp(0, (self.height - 1).max(0)),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

/// A recognized piece of screen text with its bounding box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordBox {
    pub text: String,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    /// Words sharing a line id may be joined into phrases.
    pub line: u32,
}

impl WordBox {
    pub fn center(&self) -> Point {
        Point::new(self.left + self.width / 2, self.top + self.height / 2)
    }

    fn merge(words: &[WordBox]) -> WordBox {
        let left = words.iter().map(|w| w.left).min().unwrap_or(0);
        let top = words.iter().map(|w| w.top).min().unwrap_or(0);
        let right = words.iter().map(|w| w.left + w.width).max().unwrap_or(left);
        let bottom = words.iter().map(|w| w.top + w.height).max().unwrap_or(top);
        WordBox {
            text: words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "),
            left,
            top,
            width: right - left,
            height: bottom - top,
            line: words.first().map_or(0, |w| w.line),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Mouse and keyboard synthesis.
pub trait InputBackend: Send + Sync {
    fn screen_size(&self) -> Result<ScreenSize, EffectorError>;
    fn cursor_position(&self) -> Point;
    fn move_to(&self, point: Point) -> Result<(), EffectorError>;
    fn button(&self, button: MouseButton, pressed: bool) -> Result<(), EffectorError>;
    /// Positive scrolls up.
    fn scroll(&self, amount: i64) -> Result<(), EffectorError>;
    fn type_text(&self, text: &str) -> Result<(), EffectorError>;
    /// Press or release a named key (`ctrl`, `enter`, `f4`, `a`, ...).
    fn key(&self, name: &str, pressed: bool) -> Result<(), EffectorError>;
}

pub trait ShellBackend: Send + Sync {
    fn run(&self, command: &str) -> Result<ShellOutput, EffectorError>;
}

pub trait ScreenReader: Send + Sync {
    /// Full screen text.
    fn read_text(&self) -> Result<String, EffectorError>;
    /// Word boxes in screen coordinates.
    fn read_words(&self) -> Result<Vec<WordBox>, EffectorError>;
    /// `Err(reason)` when OCR cannot work on this machine.
    fn check_available(&self) -> Result<(), String>;
}

/// Host-side grid overlay.
pub trait Overlay: Send + Sync {
    fn set_grid_visible(&self, visible: bool) -> Result<(), EffectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAction {
    Click,
    DoubleClick,
    Hover,
}

/// Center of `cell` in a 3x3 grid; 1 is bottom-left, 9 is top-right.
pub fn grid_point(cell: u8, size: ScreenSize) -> Option<Point> {
    if !(1..=9).contains(&cell) {
        return None;
    }
    let (w, h) = (size.width, size.height);
    let cols = [w / 6, w * 3 / 6, w * 5 / 6];
    let rows = [h * 5 / 6, h * 3 / 6, h / 6];
    let idx = (cell - 1) as usize;
    Some(Point::new(cols[idx % 3], rows[idx / 3]))
}

/// Accepts `5`, `5.0` or `"5"`.
pub fn parse_cell(value: Option<&Value>) -> Option<u8> {
    let cell = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if cell.fract() != 0.0 || !(1.0..=9.0).contains(&cell) {
        return None;
    }
    Some(cell as u8)
}

/// Target for a cursor navigation step, clamped to the screen.
pub fn nudge(direction: &str, amount: i32, current: Point, size: ScreenSize) -> Option<Point> {
    let direction = direction.trim().to_lowercase().replace(['-', ' '], "_");
    let (w, h) = (size.width, size.height);
    let target = match direction.as_str() {
        "up" => Point::new(current.x, current.y.saturating_sub(amount)),
        "down" => Point::new(current.x, current.y.saturating_add(amount)),
        "left" => Point::new(current.x.saturating_sub(amount), current.y),
        "right" => Point::new(current.x.saturating_add(amount), current.y),
        "center" | "centre" => Point::new(w / 2, h / 2),
        "top_left" => Point::new(CORNER_MARGIN, CORNER_MARGIN),
        "top_right" => Point::new(w - CORNER_MARGIN, CORNER_MARGIN),
        "bottom_left" => Point::new(CORNER_MARGIN, h - CORNER_MARGIN),
        "bottom_right" => Point::new(w - CORNER_MARGIN, h - CORNER_MARGIN),
        _ => return None,
    };
    Some(size.clamp(target))
}

/// Intermediate points of a glide, ending exactly at `to`.
pub fn interpolate(from: Point, to: Point, duration: Duration) -> Vec<Point> {
    let steps = (duration.as_millis() / GLIDE_STEP.as_millis()).max(1) as i64;
    (1..=steps)
        .map(|i| {
            Point::new(
                (from.x as i64 + (to.x as i64 - from.x as i64) * i / steps) as i32,
                (from.y as i64 + (to.y as i64 - from.y as i64) * i / steps) as i32,
            )
        })
        .collect()
}

pub fn glide_duration(speed: Option<f64>) -> Duration {
    let secs = speed
        .filter(|s| s.is_finite())
        .unwrap_or(DEFAULT_GLIDE_SECS)
        .clamp(MIN_GLIDE_SECS, MAX_GLIDE_SECS);
    Duration::from_secs_f64(secs)
}

/// Best OCR match for `target`: exact (case-insensitive) beats substring.
///
/// Consecutive words on one line are joined so multi-word labels match.
pub fn best_match(words: &[WordBox], target: &str) -> Option<WordBox> {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return None;
    }
    let span = target.split_whitespace().count().max(1);
    let mut best: Option<(u8, WordBox)> = None;

    for start in 0..words.len() {
        for len in 1..=span {
            let Some(group) = words.get(start..start + len) else {
                break;
            };
            if group.iter().any(|w| w.line != group[0].line) {
                break;
            }
            let text = group
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            let score = if text == target {
                2
            } else if text.contains(&target) {
                1
            } else {
                continue;
            };
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, WordBox::merge(group)));
            }
        }
    }
    best.map(|(_, hit)| hit)
}

fn parse_point(value: Option<&Value>) -> Option<Point> {
    match value? {
        Value::Array(items) if items.len() == 2 => Some(Point::new(
            items[0].as_f64()?.round() as i32,
            items[1].as_f64()?.round() as i32,
        )),
        Value::Object(map) => Some(Point::new(
            map.get("x")?.as_f64()?.round() as i32,
            map.get("y")?.as_f64()?.round() as i32,
        )),
        _ => None,
    }
}

fn parse_path(value: Option<&Value>) -> Option<Vec<Point>> {
    let points = value?
        .as_array()?
        .iter()
        .map(|p| parse_point(Some(p)))
        .collect::<Option<Vec<_>>>()?;
    (!points.is_empty()).then_some(points)
}

fn parse_scroll(value: Option<&Value>) -> i64 {
    let amount = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::Array(items)) => items.first().and_then(Value::as_f64),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    amount.map_or(DEFAULT_SCROLL, |a| a.round() as i64)
}

/// `"enter"`, `"ctrl+c"` or `["alt", "tab"]`.
pub fn parse_keys(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::String(s)) => s.split('+').map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Platform hotkey for a window operation.
pub fn window_chord(op: &str) -> Option<&'static [&'static str]> {
    let op = op.trim().to_lowercase();
    if cfg!(target_os = "macos") {
        match op.as_str() {
            "maximize" | "maximise" => Some(&["ctrl", "cmd", "f"]),
            "minimize" | "minimise" => Some(&["cmd", "m"]),
            "close" => Some(&["cmd", "w"]),
            "switch" => Some(&["cmd", "tab"]),
            _ => None,
        }
    } else {
        match op.as_str() {
            "maximize" | "maximise" => Some(&["win", "up"]),
            "minimize" | "minimise" => Some(&["win", "down"]),
            "close" => Some(&["alt", "f4"]),
            "switch" => Some(&["alt", "tab"]),
            _ => None,
        }
    }
}

pub struct EffectorRegistry {
    input: Arc<dyn InputBackend>,
    shell: Arc<dyn ShellBackend>,
    screen: Arc<dyn ScreenReader>,
}

impl EffectorRegistry {
    pub fn new(
        input: Arc<dyn InputBackend>,
        shell: Arc<dyn ShellBackend>,
        screen: Arc<dyn ScreenReader>,
    ) -> Self {
        Self {
            input,
            shell,
            screen,
        }
    }

    pub fn run_shell(&self, command: &str) -> Result<ShellOutput, EffectorError> {
        info!(command = %command, "Running shell command");
        self.shell.run(command)
    }

    pub fn type_text(&self, text: &str) -> Result<(), EffectorError> {
        self.input.type_text(text)
    }

    pub fn read_screen(&self) -> Result<String, EffectorError> {
        self.screen.read_text()
    }

    fn glide(&self, to: Point, duration: Duration) -> Result<(), EffectorError> {
        let from = self.input.cursor_position();
        let points = interpolate(from, to, duration);
        let pause = duration / points.len().max(1) as u32;
        for point in points {
            self.input.move_to(point)?;
            thread::sleep(pause);
        }
        Ok(())
    }

    fn click(&self, button: MouseButton, count: u8) -> Result<(), EffectorError> {
        for i in 0..count {
            if i > 0 {
                thread::sleep(Duration::from_millis(60));
            }
            self.input.button(button, true)?;
            self.input.button(button, false)?;
        }
        Ok(())
    }

    pub fn mouse(
        &self,
        action: &str,
        value: Option<&Value>,
        speed: Option<f64>,
    ) -> Result<(), EffectorError> {
        let duration = glide_duration(speed);
        let invalid = || EffectorError::invalid(INVALID_MOUSE);
        match action.trim().to_lowercase().as_str() {
            "move" => {
                let target = parse_point(value).ok_or_else(invalid)?;
                let size = self.input.screen_size()?;
                self.glide(size.clamp(target), duration)
            }
            "move_by" => {
                let delta = parse_point(value).ok_or_else(invalid)?;
                let current = self.input.cursor_position();
                let size = self.input.screen_size()?;
                let target = size.clamp(Point::new(
                    current.x.saturating_add(delta.x),
                    current.y.saturating_add(delta.y),
                ));
                self.glide(target, duration)
            }
            "drag" => {
                let target = parse_point(value).ok_or_else(invalid)?;
                let size = self.input.screen_size()?;
                self.input.button(MouseButton::Left, true)?;
                let moved = self.glide(size.clamp(target), duration);
                let released = self.input.button(MouseButton::Left, false);
                moved.and(released)
            }
            "path" => {
                let points = parse_path(value).ok_or_else(invalid)?;
                let size = self.input.screen_size()?;
                points
                    .into_iter()
                    .try_for_each(|p| self.glide(size.clamp(p), duration))
            }
            "scroll" => self.input.scroll(parse_scroll(value)),
            "click" => self.click(MouseButton::Left, 1),
            "double_click" => self.click(MouseButton::Left, 2),
            "right_click" => self.click(MouseButton::Right, 1),
            _ => Err(invalid()),
        }
    }

    /// Press keys in order and release them in reverse.
    pub fn press_chord(&self, keys: &[&str]) -> Result<(), EffectorError> {
        if keys.is_empty() {
            return Err(EffectorError::invalid("No keys provided."));
        }
        let mut held: Vec<&str> = Vec::with_capacity(keys.len());
        let mut result = Ok(());
        for &key in keys {
            match self.input.key(key, true) {
                Ok(()) => held.push(key),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        for key in held.iter().rev() {
            let released = self.input.key(key, false);
            if result.is_ok() {
                result = released;
            }
        }
        debug!(?keys, "Key chord sent");
        result
    }

    pub fn press_keys(&self, keys: Option<&Value>) -> Result<(), EffectorError> {
        let keys = parse_keys(keys);
        let names: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.press_chord(&names)
    }

    pub fn window(&self, op: &str) -> Result<(), EffectorError> {
        let chord = window_chord(op)
            .ok_or_else(|| EffectorError::invalid("Unknown window operation."))?;
        self.press_chord(chord)
    }

    pub fn cursor_nav(
        &self,
        direction: &str,
        amount: Option<f64>,
        default_step: i32,
    ) -> Result<(), EffectorError> {
        let amount = amount.map_or(default_step, |a| a.round() as i32);
        let size = self.input.screen_size()?;
        let target = nudge(direction, amount, self.input.cursor_position(), size)
            .ok_or_else(|| EffectorError::invalid("Unknown cursor direction."))?;
        self.glide(target, NAV_GLIDE)
    }

    pub fn grid_nav(&self, cell: Option<&Value>) -> Result<(), EffectorError> {
        let cell =
            parse_cell(cell).ok_or_else(|| EffectorError::invalid("Invalid grid cell."))?;
        let size = self.input.screen_size()?;
        let target = grid_point(cell, size)
            .ok_or_else(|| EffectorError::invalid("Invalid grid cell."))?;
        self.glide(target, NAV_GLIDE)
    }

    /// Locate `target` by OCR and point at it.
    pub fn act_on_text(&self, target: &str, action: TextAction) -> Result<Point, EffectorError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(EffectorError::invalid("No text target provided."));
        }
        let words = self.screen.read_words()?;
        let hit = best_match(&words, target)
            .ok_or_else(|| EffectorError::TextNotFound(target.to_string()))?;
        let center = hit.center();
        debug!(target, found = %hit.text, x = center.x, y = center.y, "Text located");
        self.glide(center, NAV_GLIDE)?;
        match action {
            TextAction::Click => self.click(MouseButton::Left, 1)?,
            TextAction::DoubleClick => self.click(MouseButton::Left, 2)?,
            TextAction::Hover => {}
        }
        Ok(center)
    }

    pub fn type_at_text(&self, target: &str, value: &str) -> Result<(), EffectorError> {
        self.act_on_text(target, TextAction::Click)?;
        thread::sleep(Duration::from_millis(150));
        self.input.type_text(value)
    }
}
