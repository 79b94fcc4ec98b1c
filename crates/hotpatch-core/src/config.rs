//! Server settings
//!
//! Settings come from a JSON file on disk and can be overridden at runtime by
//! attached clients through the ApplySetting commands. Unknown setting names
//! are ignored with a warning so that newer clients can talk to older servers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// When to bring the attached application to the foreground after a pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusPolicy {
    Never,
    #[default]
    OnSuccess,
    OnError,
    /// Only when the pass was started from the compile shortcut.
    OnShortcut,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuousCompilation {
    pub enabled: bool,
    /// Directory watched for source changes.
    pub path: Option<PathBuf>,
    /// Quiet period after the last change before a pass starts.
    pub debounce_ms: u64,
}

impl Default for ContinuousCompilation {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            debounce_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDrive {
    pub enabled: bool,
    /// Drive letter or alias, e.g. "Z:".
    pub letter: String,
    /// Directory the alias resolves to.
    pub path: Option<PathBuf>,
}

impl Default for VirtualDrive {
    fn default() -> Self {
        Self {
            enabled: false,
            letter: "Z:".to_string(),
            path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Human-readable shortcut description, e.g. "Ctrl+Alt+F11". The hotkey
    /// itself is registered by the front end; the server only reports it.
    pub compile_shortcut: String,
    pub continuous_compilation: ContinuousCompilation,
    pub focus_on_recompile: FocusPolicy,
    /// Sound file played after a successful pass; `None` is silent.
    pub play_sound_on_success: Option<PathBuf>,
    pub play_sound_on_error: Option<PathBuf>,
    pub virtual_drive: VirtualDrive,
    /// Install successfully built patches into processes that join the group
    /// later. When off, a joining process is rejected if patches exist.
    pub install_patches_multi_process: bool,
    pub clear_log_on_recompile: bool,
    /// Upper bound on waiting for clients to report ready. `None` waits
    /// forever.
    pub quiesce_timeout_ms: Option<u64>,
    /// Extra arguments appended to every build invocation.
    pub build_arguments: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            compile_shortcut: "Ctrl+Alt+F11".to_string(),
            continuous_compilation: ContinuousCompilation::default(),
            focus_on_recompile: FocusPolicy::default(),
            play_sound_on_success: None,
            play_sound_on_error: None,
            virtual_drive: VirtualDrive::default(),
            install_patches_multi_process: true,
            clear_log_on_recompile: false,
            quiesce_timeout_ms: None,
            build_arguments: String::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load `path` if given, otherwise fall back to `hotpatch.json` next to
    /// the executable, otherwise defaults.
    pub fn discover(path: Option<&Path>) -> Self {
        let candidate = path.map(Path::to_path_buf).or_else(|| {
            std::env::current_exe()
                .ok()
                .map(|exe| exe.with_file_name("hotpatch.json"))
        });
        match candidate {
            Some(p) if p.exists() => Self::load(&p).unwrap_or_else(|e| {
                warn!(path = %p.display(), error = %e, "settings file unreadable, using defaults");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Runtime override from a client. Returns false for unknown names.
    pub fn apply_bool(&mut self, name: &str, value: bool) -> bool {
        match name {
            "continuous_compilation.enabled" => self.continuous_compilation.enabled = value,
            "virtual_drive.enabled" => self.virtual_drive.enabled = value,
            "install_patches_multi_process" => self.install_patches_multi_process = value,
            "clear_log_on_recompile" => self.clear_log_on_recompile = value,
            _ => {
                warn!(name, "unknown bool setting");
                return false;
            }
        }
        true
    }

    pub fn apply_int(&mut self, name: &str, value: i64) -> bool {
        match name {
            "continuous_compilation.debounce_ms" => {
                self.continuous_compilation.debounce_ms = value.max(0) as u64;
            }
            "quiesce_timeout_ms" => {
                self.quiesce_timeout_ms = if value <= 0 { None } else { Some(value as u64) };
            }
            _ => {
                warn!(name, "unknown int setting");
                return false;
            }
        }
        true
    }

    pub fn apply_string(&mut self, name: &str, value: &str) -> bool {
        match name {
            "compile_shortcut" => self.compile_shortcut = value.to_string(),
            "continuous_compilation.path" => {
                self.continuous_compilation.path = Some(PathBuf::from(value));
            }
            "focus_on_recompile" => {
                self.focus_on_recompile = match value {
                    "never" => FocusPolicy::Never,
                    "on_success" => FocusPolicy::OnSuccess,
                    "on_error" => FocusPolicy::OnError,
                    "on_shortcut" => FocusPolicy::OnShortcut,
                    other => {
                        warn!(value = other, "unknown focus policy");
                        return false;
                    }
                };
            }
            "virtual_drive.letter" => self.virtual_drive.letter = value.to_string(),
            "virtual_drive.path" => self.virtual_drive.path = Some(PathBuf::from(value)),
            "play_sound_on_success" => {
                self.play_sound_on_success =
                    (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "play_sound_on_error" => {
                self.play_sound_on_error = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "build_arguments" => self.build_arguments = value.to_string(),
            _ => {
                warn!(name, "unknown string setting");
                return false;
            }
        }
        true
    }
}
