//! Voice engines: the primary per-chunk speaker and the file-based fallback.
//!
//! Both drive an OS speech synthesizer found on `PATH`:
//!   macOS: `say`
//!   Linux: `espeak-ng` (or `espeak`)
//!   Windows: PowerShell with `System.Speech`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use uuid::Uuid;

use super::playback::play_wav_file;

/// Errors raised by voice engines.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("no speech synthesizer available: {0}")]
    Unavailable(String),
    #[error("voice engine is not initialized")]
    NotReady,
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Speaks one chunk at a time, blocking until the chunk is audible-complete.
pub trait VoiceEngine: Send {
    fn speak(&mut self, chunk: &str) -> Result<(), SpeechError>;

    fn name(&self) -> &str;
}

/// Renders a whole unit to audio by another path than the primary engine.
pub trait FallbackRenderer: Send + Sync {
    fn render(&self, text: &str) -> Result<(), SpeechError>;

    fn name(&self) -> &str;
}

/// An OS speech synthesizer resolved on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesizer {
    Say(PathBuf),
    Espeak(PathBuf),
    PowerShell(PathBuf),
}

impl Synthesizer {
    /// Find the first usable synthesizer for this platform.
    pub fn detect() -> Result<Self, SpeechError> {
        let candidates: &[&str] = if cfg!(target_os = "macos") {
            &["say"]
        } else if cfg!(target_os = "windows") {
            &["powershell", "pwsh"]
        } else {
            &["espeak-ng", "espeak"]
        };

        for name in candidates {
            if let Ok(path) = which::which(name) {
                debug!(synth = %path.display(), "Found speech synthesizer");
                return Ok(match *name {
                    "say" => Self::Say(path),
                    "powershell" | "pwsh" => Self::PowerShell(path),
                    _ => Self::Espeak(path),
                });
            }
        }
        Err(SpeechError::Unavailable(format!(
            "none of {} found on PATH",
            candidates.join(", ")
        )))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Say(_) => "say",
            Self::Espeak(_) => "espeak",
            Self::PowerShell(_) => "system.speech",
        }
    }

    /// Build the command that speaks `text` through the default output.
    fn speak_command(&self, text: &str, rate: u32, voice: Option<&str>) -> (Command, Option<String>) {
        match self {
            Self::Say(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("-r").arg(rate.to_string());
                if let Some(v) = voice {
                    cmd.arg("-v").arg(v);
                }
                cmd.arg("--").arg(text);
                (cmd, None)
            }
            Self::Espeak(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("-s").arg(rate.to_string());
                if let Some(v) = voice {
                    cmd.arg("-v").arg(v);
                }
                cmd.arg("--").arg(text);
                (cmd, None)
            }
            Self::PowerShell(bin) => {
                let script = powershell_script(rate, voice, None);
                let mut cmd = Command::new(bin);
                cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
                (cmd, Some(text.to_string()))
            }
        }
    }

    /// Build the command that writes `text` as a WAV file at `out`.
    fn render_command(
        &self,
        text: &str,
        rate: u32,
        voice: Option<&str>,
        out: &Path,
    ) -> (Command, Option<String>) {
        match self {
            Self::Say(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("-r").arg(rate.to_string());
                if let Some(v) = voice {
                    cmd.arg("-v").arg(v);
                }
                cmd.arg("-o")
                    .arg(out)
                    .arg("--data-format=LEI16@22050")
                    .arg("--")
                    .arg(text);
                (cmd, None)
            }
            Self::Espeak(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("-s").arg(rate.to_string());
                if let Some(v) = voice {
                    cmd.arg("-v").arg(v);
                }
                cmd.arg("-w").arg(out).arg("--").arg(text);
                (cmd, None)
            }
            Self::PowerShell(bin) => {
                let script = powershell_script(rate, voice, Some(out));
                let mut cmd = Command::new(bin);
                cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
                (cmd, Some(text.to_string()))
            }
        }
    }
}

/// SAPI rates run from -10 to 10 with 0 near 180 wpm.
fn sapi_rate(wpm: u32) -> i32 {
    ((wpm as i32 - 180) / 15).clamp(-10, 10)
}

fn powershell_script(wpm: u32, voice: Option<&str>, out: Option<&Path>) -> String {
    let mut script = String::from(
        "Add-Type -AssemblyName System.Speech; \
         $s = New-Object System.Speech.Synthesis.SpeechSynthesizer; ",
    );
    script.push_str(&format!("$s.Rate = {}; ", sapi_rate(wpm)));
    if let Some(v) = voice {
        script.push_str(&format!("$s.SelectVoice('{}'); ", v.replace('\'', "''")));
    }
    if let Some(path) = out {
        script.push_str(&format!(
            "$s.SetOutputToWaveFile('{}'); ",
            path.display().to_string().replace('\'', "''")
        ));
    }
    script.push_str("$s.Speak([Console]::In.ReadToEnd()); $s.Dispose()");
    script
}

/// Run a synthesizer command, feeding `stdin_text` when the command reads text from stdin.
fn run_synth(mut cmd: Command, stdin_text: Option<String>) -> Result<(), SpeechError> {
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    cmd.stdin(if stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn()?;
    if let Some(text) = stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }
    }
    let output = child.wait_with_output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SpeechError::Synthesis(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Primary engine: speaks each chunk straight through the OS synthesizer.
pub struct SystemVoice {
    synth: Synthesizer,
    rate: u32,
    voice: Option<String>,
}

impl SystemVoice {
    pub fn new(synth: Synthesizer, rate: u32, voice: Option<String>) -> Self {
        info!(synth = synth.label(), rate, "System voice ready");
        Self { synth, rate, voice }
    }

    pub fn detect(rate: u32, voice: Option<String>) -> Result<Self, SpeechError> {
        Ok(Self::new(Synthesizer::detect()?, rate, voice))
    }
}

impl VoiceEngine for SystemVoice {
    fn speak(&mut self, chunk: &str) -> Result<(), SpeechError> {
        let (cmd, stdin_text) = self.synth.speak_command(chunk, self.rate, self.voice.as_deref());
        run_synth(cmd, stdin_text)
    }

    fn name(&self) -> &str {
        self.synth.label()
    }
}

/// Fallback: synthesize to a temporary WAV file, play it with rodio, delete it.
pub struct WavFileRenderer {
    synth: Synthesizer,
    rate: u32,
    voice: Option<String>,
    volume: f32,
}

impl WavFileRenderer {
    pub fn new(synth: Synthesizer, rate: u32, voice: Option<String>, volume: f32) -> Self {
        Self {
            synth,
            rate,
            voice,
            volume,
        }
    }
}

impl FallbackRenderer for WavFileRenderer {
    fn render(&self, text: &str) -> Result<(), SpeechError> {
        let path = std::env::temp_dir().join(format!("barbaric-tts-{}.wav", Uuid::new_v4()));
        let (cmd, stdin_text) =
            self.synth
                .render_command(text, self.rate, self.voice.as_deref(), &path);
        let result = run_synth(cmd, stdin_text).and_then(|()| play_wav_file(&path, self.volume));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), "Could not remove temp audio: {}", e);
            }
        }
        result
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}
