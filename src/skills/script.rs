//! Script skills: `sh`, `py` and `js` files run as subprocesses.
//!
//! Input is a JSON document on stdin:
//! `{"payload": ..., "context": {"os", "arch", "runtime"}}`.
//! Stdout is parsed as JSON when possible, otherwise returned as text.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{Skill, SkillContext, SkillError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    Shell,
    Python,
    Node,
}

impl ScriptRuntime {
    pub const ALL: [ScriptRuntime; 3] = [Self::Shell, Self::Python, Self::Node];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sh" => Some(Self::Shell),
            "py" => Some(Self::Python),
            "js" => Some(Self::Node),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Runtime named by the shebang line; shell when absent.
    pub fn from_source(source: &str) -> Self {
        let first = source.lines().next().unwrap_or("");
        if !first.starts_with("#!") {
            return Self::Shell;
        }
        if first.contains("python") {
            Self::Python
        } else if first.contains("node") {
            Self::Node
        } else {
            Self::Shell
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::Python => "py",
            Self::Node => "js",
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::Python if cfg!(target_os = "windows") => "python",
            Self::Python => "python3",
            Self::Node => "node",
        }
    }

    /// Command that exits non-zero when `path` does not parse.
    fn syntax_check(self, path: &Path) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Self::Shell => {
                cmd.arg("-n").arg(path);
            }
            Self::Python => {
                cmd.arg("-c")
                    .arg("import ast, sys; ast.parse(open(sys.argv[1], encoding='utf-8').read(), sys.argv[1])")
                    .arg(path);
            }
            Self::Node => {
                cmd.arg("--check").arg(path);
            }
        }
        cmd
    }
}

/// Checked copy of a skill's source, private to one loaded skill.
///
/// Running the snapshot instead of the skills-directory file keeps a loaded
/// skill fixed until the next reload, whatever happens to the file on disk.
struct Snapshot(PathBuf);

impl Snapshot {
    fn write(runtime: ScriptRuntime, source: &str) -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join("barbaric-skills");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), runtime.extension()));
        std::fs::write(&path, source)?;
        Ok(Self(path))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub struct ScriptSkill {
    name: String,
    runtime: ScriptRuntime,
    snapshot: Snapshot,
    workdir: PathBuf,
    timeout: Duration,
}

impl ScriptSkill {
    /// Load and syntax-check a skill file.
    pub fn load(name: &str, path: &Path) -> Result<Self, SkillError> {
        let runtime = ScriptRuntime::from_path(path).ok_or_else(|| SkillError::Malformed {
            name: name.to_string(),
            reason: format!("unsupported file type: {}", path.display()),
        })?;
        let source = std::fs::read_to_string(path)?;
        let workdir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let skill = Self::compile(name, runtime, &source, workdir)?;
        debug!(skill = name, path = %path.display(), "Skill loaded");
        Ok(skill)
    }

    /// Syntax-check `source` without touching the skills directory.
    ///
    /// `workdir` is the working directory of every run.
    pub fn compile(
        name: &str,
        runtime: ScriptRuntime,
        source: &str,
        workdir: PathBuf,
    ) -> Result<Self, SkillError> {
        if source.trim().is_empty() {
            return Err(SkillError::Malformed {
                name: name.to_string(),
                reason: "empty source".into(),
            });
        }
        let snapshot = Snapshot::write(runtime, source)?;

        let output = runtime
            .syntax_check(&snapshot.0)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SkillError::Runtime {
                name: name.to_string(),
                reason: format!("{} unavailable: {}", runtime.program(), e),
            })?;
        if !output.status.success() {
            let snapshot_name = snapshot.0.display().to_string();
            return Err(SkillError::Malformed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .replace(&snapshot_name, name),
            });
        }

        Ok(Self {
            name: name.to_string(),
            runtime,
            snapshot,
            workdir,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        buf
    })
}

/// Trimmed stdout as JSON, or as a string; empty output is `null`.
pub fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

impl Skill for ScriptSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, payload: &Value, context: &SkillContext) -> Result<Value, SkillError> {
        let input = json!({ "payload": payload, "context": context });
        let runtime_error = |reason: String| SkillError::Runtime {
            name: self.name.clone(),
            reason,
        };

        let mut child = Command::new(self.runtime.program())
            .arg(&self.snapshot.0)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| runtime_error(format!("failed to spawn: {e}")))?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());
        // Written off-thread so a skill that never reads stdin still times out.
        if let Some(mut stdin) = child.stdin.take() {
            let input = input.to_string();
            thread::spawn(move || {
                let _ = stdin.write_all(input.as_bytes());
            });
        }

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(runtime_error(format!("timed out after {:?}", self.timeout)));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(runtime_error(format!("wait failed: {e}"))),
            }
        };

        let stdout = String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned();
        if !stderr.trim().is_empty() {
            debug!(skill = %self.name, stderr = %stderr.trim(), "skill stderr");
        }
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(runtime_error(format!(
                "exited with code {code}: {}",
                stderr.trim()
            )));
        }
        Ok(parse_output(&stdout))
    }
}
