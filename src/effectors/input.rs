//! Mouse and keyboard synthesis via rdev, typing via clipboard paste.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use rdev::{simulate, Button, EventType, Key};
use tracing::{info, warn};

use super::{EffectorError, InputBackend, MouseButton, Point, ScreenSize};

/// Wheel units per notch.
const WHEEL_NOTCH: i64 = 120;
const EVENT_DELAY: Duration = Duration::from_millis(20);

/// Map a key name from a plan to an rdev key.
pub fn key_from_name(name: &str) -> Option<Key> {
    let name = name.trim().to_lowercase();
    let key = match name.as_str() {
        "ctrl" | "control" | "ctl" => Key::ControlLeft,
        "shift" => Key::ShiftLeft,
        "alt" | "option" | "opt" => Key::Alt,
        "win" | "windows" | "cmd" | "command" | "super" | "meta" => Key::MetaLeft,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "tab" => Key::Tab,
        "space" | "spacebar" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "insert" | "ins" => Key::Insert,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "page_up" | "pgup" => Key::PageUp,
        "pagedown" | "page_down" | "pgdn" => Key::PageDown,
        "capslock" | "caps_lock" => Key::CapsLock,
        "printscreen" | "print_screen" | "prtsc" => Key::PrintScreen,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        "-" | "minus" => Key::Minus,
        "=" | "equal" | "equals" => Key::Equal,
        "," | "comma" => Key::Comma,
        "." | "period" | "dot" => Key::Dot,
        "/" | "slash" => Key::Slash,
        ";" | "semicolon" => Key::SemiColon,
        _ => return single_char_key(&name),
    };
    Some(key)
}

fn single_char_key(name: &str) -> Option<Key> {
    let mut chars = name.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(match c {
        'a' => Key::KeyA,
        'b' => Key::KeyB,
        'c' => Key::KeyC,
        'd' => Key::KeyD,
        'e' => Key::KeyE,
        'f' => Key::KeyF,
        'g' => Key::KeyG,
        'h' => Key::KeyH,
        'i' => Key::KeyI,
        'j' => Key::KeyJ,
        'k' => Key::KeyK,
        'l' => Key::KeyL,
        'm' => Key::KeyM,
        'n' => Key::KeyN,
        'o' => Key::KeyO,
        'p' => Key::KeyP,
        'q' => Key::KeyQ,
        'r' => Key::KeyR,
        's' => Key::KeyS,
        't' => Key::KeyT,
        'u' => Key::KeyU,
        'v' => Key::KeyV,
        'w' => Key::KeyW,
        'x' => Key::KeyX,
        'y' => Key::KeyY,
        'z' => Key::KeyZ,
        '0' => Key::Num0,
        '1' => Key::Num1,
        '2' => Key::Num2,
        '3' => Key::Num3,
        '4' => Key::Num4,
        '5' => Key::Num5,
        '6' => Key::Num6,
        '7' => Key::Num7,
        '8' => Key::Num8,
        '9' => Key::Num9,
        _ => return None,
    })
}

/// Wheel units to rdev notches, never rounding a non-zero scroll to nothing.
fn wheel_notches(amount: i64) -> i64 {
    if amount == 0 {
        return 0;
    }
    let notches = amount / WHEEL_NOTCH;
    if notches == 0 {
        amount.signum()
    } else {
        notches
    }
}

fn send(event: EventType) -> Result<(), EffectorError> {
    simulate(&event).map_err(|e| EffectorError::Input(format!("{:?}: {:?}", event, e)))?;
    thread::sleep(EVENT_DELAY);
    Ok(())
}

/// rdev cannot query the pointer, so the last position we set is tracked.
#[derive(Debug, Default)]
pub struct RdevInput {
    cursor: Mutex<Option<Point>>,
}

impl RdevInput {
    pub fn new() -> Self {
        Self::default()
    }

    fn paste_modifier() -> Key {
        if cfg!(target_os = "macos") {
            Key::MetaLeft
        } else {
            Key::ControlLeft
        }
    }

    fn simulate_paste() -> Result<(), EffectorError> {
        let modifier = Self::paste_modifier();
        send(EventType::KeyPress(modifier))?;
        let pasted = send(EventType::KeyPress(Key::KeyV)).and(send(EventType::KeyRelease(Key::KeyV)));
        let released = send(EventType::KeyRelease(modifier));
        pasted.and(released)
    }
}

impl InputBackend for RdevInput {
    fn screen_size(&self) -> Result<ScreenSize, EffectorError> {
        let (w, h) = rdev::display_size()
            .map_err(|e| EffectorError::Screen(format!("display size unavailable: {:?}", e)))?;
        Ok(ScreenSize {
            width: w as i32,
            height: h as i32,
        })
    }

    fn cursor_position(&self) -> Point {
        if let Some(p) = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) {
            return p;
        }
        match self.screen_size() {
            Ok(size) => Point::new(size.width / 2, size.height / 2),
            Err(_) => Point::new(0, 0),
        }
    }

    fn move_to(&self, point: Point) -> Result<(), EffectorError> {
        simulate(&EventType::MouseMove {
            x: point.x as f64,
            y: point.y as f64,
        })
        .map_err(|e| EffectorError::Input(format!("mouse move failed: {:?}", e)))?;
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(point);
        Ok(())
    }

    fn button(&self, button: MouseButton, pressed: bool) -> Result<(), EffectorError> {
        let button = match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
        };
        send(if pressed {
            EventType::ButtonPress(button)
        } else {
            EventType::ButtonRelease(button)
        })
    }

    fn scroll(&self, amount: i64) -> Result<(), EffectorError> {
        send(EventType::Wheel {
            delta_x: 0,
            delta_y: wheel_notches(amount),
        })
    }

    /// Set clipboard, paste, restore the previous clipboard.
    fn type_text(&self, text: &str) -> Result<(), EffectorError> {
        if text.is_empty() {
            return Ok(());
        }
        info!(text_len = text.len(), "Typing text via clipboard");

        let mut clipboard = Clipboard::new()
            .map_err(|e| EffectorError::Clipboard(format!("Failed to open clipboard: {}", e)))?;
        let previous = clipboard.get_text().ok();
        clipboard
            .set_text(text)
            .map_err(|e| EffectorError::Clipboard(format!("Failed to set clipboard text: {}", e)))?;

        thread::sleep(Duration::from_millis(50));
        let pasted = Self::simulate_paste();
        thread::sleep(Duration::from_millis(100));

        if let Some(prev) = previous {
            if let Err(e) = clipboard.set_text(prev) {
                warn!("Failed to restore clipboard: {}", e);
            }
        }
        pasted
    }

    fn key(&self, name: &str, pressed: bool) -> Result<(), EffectorError> {
        let key = key_from_name(name)
            .ok_or_else(|| EffectorError::invalid(format!("Unknown key: {}", name)))?;
        send(if pressed {
            EventType::KeyPress(key)
        } else {
            EventType::KeyRelease(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(key_from_name("Ctrl"), Some(Key::ControlLeft));
        assert_eq!(key_from_name("win"), Some(Key::MetaLeft));
        assert_eq!(key_from_name("cmd"), Some(Key::MetaLeft));
        assert_eq!(key_from_name("enter"), Some(Key::Return));
        assert_eq!(key_from_name("F4"), Some(Key::F4));
        assert_eq!(key_from_name("v"), Some(Key::KeyV));
        assert_eq!(key_from_name("7"), Some(Key::Num7));
        assert_eq!(key_from_name("page_down"), Some(Key::PageDown));
        assert_eq!(key_from_name("hyper"), None);
        assert_eq!(key_from_name(""), None);
    }

    #[test]
    fn test_window_chords_resolve() {
        for op in ["maximize", "minimize", "close", "switch"] {
            let chord = super::super::window_chord(op).unwrap();
            assert!(chord.iter().all(|k| key_from_name(k).is_some()), "{op}");
        }
    }

    #[test]
    fn test_wheel_notches() {
        assert_eq!(wheel_notches(0), 0);
        assert_eq!(wheel_notches(-300), -2);
        assert_eq!(wheel_notches(240), 2);
        assert_eq!(wheel_notches(5), 1);
        assert_eq!(wheel_notches(-1), -1);
    }
}
