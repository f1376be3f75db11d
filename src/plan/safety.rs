//! Destructive-command denylist and affirmative-answer tokens.

/// Command fragments that need a spoken confirmation before running.
///
/// Matched case-insensitively at the start of a command token, so `format`
/// triggers on `format C:` and `cmd /c format D:` but not on `reformat.py`.
pub const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "del ",
    "erase ",
    "format ",
    "shutdown",
    "rd ",
    "rmdir",
    "reg ",
    "diskpart",
    "net user",
    "net localgroup",
    "taskkill",
    "powershell remove-",
    "remove-item",
    "rm ",
    "mkfs",
    "dd ",
    "kill ",
    "pkill",
    "killall",
    "reboot",
    "halt",
    "poweroff",
];

/// Words that count as consent, across the supported languages.
pub const AFFIRMATIVE_TOKENS: &[&str] = &[
    "yes", "yeah", "yep", "sure", "ok", "okay", "haan", "हाँ", "हां", "si", "sí", "oui", "ja",
];

fn is_token_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | '`' | '"' | '\'')
}

/// Whether `command` contains a destructive operation.
pub fn is_destructive(command: &str) -> bool {
    // Trailing space lets patterns like "rm " match a bare trailing `rm`.
    let haystack = format!("{} ", command.to_lowercase());
    DESTRUCTIVE_PATTERNS.iter().any(|pattern| {
        haystack.match_indices(pattern).any(|(idx, _)| {
            haystack[..idx]
                .chars()
                .next_back()
                .map_or(true, is_token_boundary)
        })
    })
}

/// Whether an answer contains an affirmative token.
pub fn is_affirmative(answer: &str) -> bool {
    answer
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .any(|word| AFFIRMATIVE_TOKENS.contains(&word.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_commands() {
        assert!(is_destructive("format C:"));
        assert!(is_destructive("del /f /q C:\\temp\\*"));
        assert!(is_destructive("shutdown /s /t 0"));
        assert!(is_destructive("cmd /c rmdir /s build"));
        assert!(is_destructive("net user guest /active:yes"));
        assert!(is_destructive("rm -rf ~/scratch"));
        assert!(is_destructive("ls && rm notes.txt"));
        assert!(is_destructive("sudo reboot"));
        assert!(is_destructive("PowerShell Remove-Item foo"));
        assert!(is_destructive("TASKKILL /IM chrome.exe"));
    }

    #[test]
    fn test_harmless_commands() {
        assert!(!is_destructive("start chrome"));
        assert!(!is_destructive("python reformat.py"));
        assert!(!is_destructive("echo hello"));
        assert!(!is_destructive("notepad model.txt"));
        assert!(!is_destructive("git log --format oneline"));
        assert!(!is_destructive("ls -la"));
    }

    #[test]
    fn test_affirmative_answers() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative("Yes, go ahead."));
        assert!(is_affirmative("okay do it"));
        assert!(is_affirmative("haan"));
        assert!(is_affirmative("हाँ"));
        assert!(is_affirmative("Sí"));
        assert!(is_affirmative("oui"));
    }

    #[test]
    fn test_non_affirmative_answers() {
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("nope, cancel that"));
        assert!(!is_affirmative("yesterday"));
        assert!(!is_affirmative("jam"));
    }
}
