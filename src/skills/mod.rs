//! Skill host: a name-to-unit registry of script skills loaded from the
//! skills directory, replaced wholesale on reload.

pub mod script;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ConfigHandle;
pub use script::{ScriptRuntime, ScriptSkill};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("No skill name provided.")]
    MissingName,
    #[error("Skill {0} not found.")]
    NotFound(String),
    #[error("{0}")]
    Blocked(&'static str),
    #[error("Invalid skill name.")]
    InvalidName,
    #[error("Missing skill name or code.")]
    MissingSource,
    #[error("Skill {name} failed to load: {reason}")]
    Malformed { name: String, reason: String },
    #[error("Skill error: {name} {reason}")]
    Runtime { name: String, reason: String },
    #[error("Skill error: {0} panicked")]
    Panicked(String),
    #[error("Skill error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only facts handed to every invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkillContext {
    pub os: String,
    pub arch: String,
    pub runtime: String,
}

impl SkillContext {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            runtime: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, payload: &Value, context: &SkillContext) -> Result<Value, SkillError>;
}

type SkillMap = HashMap<String, Arc<dyn Skill>>;

/// Keep ASCII alphanumerics, `_` and `-`; strip leading/trailing separators.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect::<String>()
        .trim_matches(|c| c == '_' || c == '-')
        .to_string()
}

/// Load every `<name>.<sh|py|js>` under `dir`. Unloadable files are skipped.
fn load_dir(dir: &Path) -> SkillMap {
    let mut map: SkillMap = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "Failed to read skills directory: {}", e);
            return map;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && ScriptRuntime::from_path(p).is_some())
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if name != sanitize_name(&name) {
            warn!(path = %path.display(), "Skipping skill with unsafe file name");
            continue;
        }
        if map.contains_key(&name) {
            warn!(skill = %name, path = %path.display(), "Duplicate skill name, keeping first");
            continue;
        }
        match ScriptSkill::load(&name, &path) {
            Ok(skill) => {
                map.insert(name, Arc::new(skill));
            }
            Err(e) => warn!(path = %path.display(), "Skipping skill: {}", e),
        }
    }
    map
}

/// Replace `path` with `contents` through a hidden temp file and a rename.
fn write_replacing(path: &Path, contents: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("skill");
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

pub struct SkillHost {
    config: ConfigHandle,
    registry: RwLock<Arc<SkillMap>>,
    loaded: AtomicBool,
    install_lock: Mutex<()>,
    context: SkillContext,
}

impl SkillHost {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            registry: RwLock::new(Arc::new(HashMap::new())),
            loaded: AtomicBool::new(false),
            install_lock: Mutex::new(()),
            context: SkillContext::current(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.config.snapshot().skills_dir()
    }

    fn current(&self) -> Arc<SkillMap> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, map: SkillMap) {
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    /// Rescan the skills directory and replace the registry. Returns the count.
    pub fn load_all(&self) -> usize {
        let dir = self.dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "Failed to create skills directory: {}", e);
        }
        let _guard = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let map = load_dir(&dir);
        let count = map.len();
        self.swap(map);
        self.loaded.store(true, Ordering::SeqCst);
        info!(count, dir = %dir.display(), "Skills loaded");
        count
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.current().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a skill. Failures, including panics, come back as `Err`.
    pub fn invoke(&self, name: &str, payload: &Value) -> Result<Value, SkillError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SkillError::MissingName);
        }
        if !self.loaded.load(Ordering::SeqCst) {
            self.load_all();
        }
        let skill = self
            .current()
            .get(name)
            .cloned()
            .ok_or_else(|| SkillError::NotFound(name.to_string()))?;

        let payload = if payload.is_null() { json!({}) } else { payload.clone() };
        info!(skill = %name, "Running skill");
        panic::catch_unwind(AssertUnwindSafe(|| skill.run(&payload, &self.context)))
            .unwrap_or_else(|_| Err(SkillError::Panicked(name.to_string())))
    }

    /// Check `source`, persist it as skill `name` and swap it in.
    ///
    /// A source that fails to load never reaches the skills directory or the
    /// registry; the previous version stays invokable throughout.
    pub fn install_or_replace(&self, name: &str, source: &str) -> Result<String, SkillError> {
        let config = self.config.snapshot();
        if !config.dev_mode {
            return Err(SkillError::Blocked("Developer mode is off; code updates are blocked."));
        }
        if !config.features.skills {
            return Err(SkillError::Blocked("Skills are disabled in settings."));
        }
        if name.trim().is_empty() || source.trim().is_empty() {
            return Err(SkillError::MissingSource);
        }
        let safe = sanitize_name(name);
        if safe.is_empty() {
            return Err(SkillError::InvalidName);
        }

        let _guard = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = config.skills_dir();
        std::fs::create_dir_all(&dir)?;
        let runtime = ScriptRuntime::from_source(source);
        let skill = match ScriptSkill::compile(&safe, runtime, source, dir.clone()) {
            Ok(skill) => skill,
            Err(e) => {
                warn!(skill = %safe, "Skill update rejected: {}", e);
                return Err(e);
            }
        };

        let path = dir.join(format!("{}.{}", safe, runtime.extension()));
        write_replacing(&path, source)?;

        let mut map = if self.loaded.load(Ordering::SeqCst) {
            (*self.current()).clone()
        } else {
            load_dir(&dir)
        };
        map.insert(safe.clone(), Arc::new(skill));
        self.swap(map);
        self.loaded.store(true, Ordering::SeqCst);

        for other in ScriptRuntime::ALL.into_iter().filter(|r| *r != runtime) {
            let stale = dir.join(format!("{}.{}", safe, other.extension()));
            if stale.exists() {
                if let Err(e) = std::fs::remove_file(&stale) {
                    warn!(path = %stale.display(), "Failed to remove stale skill file: {}", e);
                }
            }
        }

        info!(skill = %safe, path = %path.display(), "Skill installed");
        Ok(format!("Skill {} updated.", safe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use tempfile::TempDir;

    fn host(dir: &TempDir, dev_mode: bool, skills: bool) -> SkillHost {
        let mut config = AgentConfig::default();
        config.dev_mode = dev_mode;
        config.features.skills = skills;
        config.skills_dir = Some(dir.path().to_path_buf());
        SkillHost::new(ConfigHandle::new(config))
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("weather"), "weather");
        assert_eq!(sanitize_name("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_name("__my skill-"), "myskill");
        assert_eq!(sanitize_name("--"), "");
    }

    #[test]
    fn test_install_blocked_without_dev_mode() {
        let dir = TempDir::new().unwrap();
        for skills in [true, false] {
            let host = host(&dir, false, skills);
            let err = host.install_or_replace("hello", "echo hi").unwrap_err();
            assert_eq!(err.to_string(), "Developer mode is off; code updates are blocked.");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_install_blocked_when_skills_disabled() {
        let dir = TempDir::new().unwrap();
        let err = host(&dir, true, false)
            .install_or_replace("hello", "echo hi")
            .unwrap_err();
        assert_eq!(err.to_string(), "Skills are disabled in settings.");
    }

    #[test]
    fn test_invalid_requests() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        assert!(matches!(host.install_or_replace("", "echo"), Err(SkillError::MissingSource)));
        assert!(matches!(host.install_or_replace("ok", "  "), Err(SkillError::MissingSource)));
        assert!(matches!(host.install_or_replace("$$", "echo"), Err(SkillError::InvalidName)));
        assert!(matches!(host.invoke(" ", &Value::Null), Err(SkillError::MissingName)));
        assert_eq!(
            host.invoke("ghost", &Value::Null).unwrap_err().to_string(),
            "Skill ghost not found."
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_load_all_replaces_registry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("greet.sh"), "echo '\"hello\"'\n").unwrap();
        std::fs::write(dir.path().join("broken.sh"), "if then (\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let host = host(&dir, false, true);
        assert_eq!(host.load_all(), 1);
        assert_eq!(host.names(), vec!["greet".to_string()]);
        assert_eq!(host.invoke("greet", &Value::Null).unwrap(), json!("hello"));

        std::fs::remove_file(dir.path().join("greet.sh")).unwrap();
        assert_eq!(host.load_all(), 0);
        assert!(host.names().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_loads_lazily_and_reports_failures() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("boom.sh"), "echo bad >&2\nexit 1\n").unwrap();
        let host = host(&dir, false, true);
        let err = host.invoke("boom", &json!({"x": 1})).unwrap_err();
        assert!(err.to_string().starts_with("Skill error:"));
        assert!(err.to_string().contains("bad"));
    }

    #[cfg(unix)]
    #[test]
    fn test_install_then_invoke() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        let msg = host
            .install_or_replace("count", "read input\necho 3\n")
            .unwrap();
        assert_eq!(msg, "Skill count updated.");
        assert!(dir.path().join("count.sh").exists());
        assert_eq!(host.invoke("count", &Value::Null).unwrap(), json!(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_reload_keeps_previous_version() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        host.install_or_replace("stable", "echo 1\n").unwrap();

        let err = host.install_or_replace("stable", "if then (\n").unwrap_err();
        assert!(matches!(err, SkillError::Malformed { .. }));
        assert_eq!(host.invoke("stable", &Value::Null).unwrap(), json!(1));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stable.sh")).unwrap(),
            "echo 1\n"
        );

        // A fresh rescan sees the restored file too.
        assert_eq!(host.load_all(), 1);
        assert_eq!(host.invoke("stable", &Value::Null).unwrap(), json!(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_first_install_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        assert!(host.install_or_replace("nope", "if then (\n").is_err());
        assert!(!dir.path().join("nope.sh").exists());
        assert!(matches!(host.invoke("nope", &Value::Null), Err(SkillError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_never_sees_rejected_update() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(host(&dir, true, true));
        host.install_or_replace("stable", "echo 1\n").unwrap();

        let invoker = {
            let host = host.clone();
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| host.invoke("stable", &Value::Null))
                    .filter(|r| !matches!(r, Ok(v) if *v == json!(1)))
                    .count()
            })
        };
        for _ in 0..20 {
            assert!(host.install_or_replace("stable", "if then (\n").is_err());
        }
        assert_eq!(invoker.join().unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stable.sh")).unwrap(),
            "echo 1\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_runtime_change_swaps_before_removing_old_file() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        host.install_or_replace("calc", "echo 1\n").unwrap();
        if which::which("python3").is_err() {
            return;
        }
        host.install_or_replace("calc", "#!/usr/bin/env python3\nprint(2)\n")
            .unwrap();
        assert!(!dir.path().join("calc.sh").exists());
        assert!(dir.path().join("calc.py").exists());
        assert_eq!(host.invoke("calc", &Value::Null).unwrap(), json!(2));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_edit_needs_reload() {
        let dir = TempDir::new().unwrap();
        let host = host(&dir, true, true);
        host.install_or_replace("stable", "echo 1\n").unwrap();

        std::fs::write(dir.path().join("stable.sh"), "if then (\n").unwrap();
        assert_eq!(host.invoke("stable", &Value::Null).unwrap(), json!(1));

        std::fs::write(dir.path().join("stable.sh"), "echo 2\n").unwrap();
        assert_eq!(host.invoke("stable", &Value::Null).unwrap(), json!(1));
        host.load_all();
        assert_eq!(host.invoke("stable", &Value::Null).unwrap(), json!(2));
    }
}
