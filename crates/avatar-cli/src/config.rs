//! Session settings – reads/writes `~/.avatar/config.toml`.

use avatar_runtime::AvatarConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted settings for an `avatar-sim` session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Simulation ticks per second.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f32,

    /// Ticks spent in each scripted phase.
    #[serde(default = "default_ticks_per_phase")]
    pub ticks_per_phase: u32,

    /// Place a low step in the walking path.
    #[serde(default = "default_true")]
    pub with_step: bool,

    /// Place a wall at the end of the walking path.
    #[serde(default = "default_true")]
    pub with_wall: bool,

    #[serde(default)]
    pub avatar: AvatarConfig,
}

fn default_tick_hz() -> f32 {
    90.0
}
fn default_ticks_per_phase() -> u32 {
    180
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            ticks_per_phase: default_ticks_per_phase(),
            with_step: true,
            with_wall: true,
            avatar: AvatarConfig::default(),
        }
    }
}

impl Config {
    pub fn tick_length(&self) -> f32 {
        1.0 / self.tick_hz
    }
}

/// Return the path to `~/.avatar/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".avatar").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `AVATAR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `AVATAR_USER_HEIGHT` | `avatar.user_height` |
/// | `AVATAR_SCALE` | `avatar.avatar_scale` |
/// | `AVATAR_CG_MODEL` | `avatar.cg_model` |
/// | `AVATAR_FLYING` | `avatar.flying_allowed` |
/// | `AVATAR_TICK_HZ` | `tick_hz` |
/// | `AVATAR_TICKS` | `ticks_per_phase` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("AVATAR_USER_HEIGHT")
        && let Ok(height) = v.parse::<f32>() {
            cfg.avatar.user_height = height;
        }
    if let Ok(v) = std::env::var("AVATAR_SCALE")
        && let Ok(scale) = v.parse::<f32>() {
            cfg.avatar.avatar_scale = scale;
        }
    if let Ok(v) = std::env::var("AVATAR_CG_MODEL")
        && let Ok(enabled) = v.parse::<bool>() {
            cfg.avatar.cg_model = enabled;
        }
    if let Ok(v) = std::env::var("AVATAR_FLYING")
        && let Ok(allowed) = v.parse::<bool>() {
            cfg.avatar.flying_allowed = allowed;
        }
    if let Ok(v) = std::env::var("AVATAR_TICK_HZ")
        && let Ok(hz) = v.parse::<f32>()
        && hz.is_finite()
        && hz > 0.0 {
            cfg.tick_hz = hz;
        }
    if let Ok(v) = std::env::var("AVATAR_TICKS")
        && let Ok(ticks) = v.parse::<u32>() {
            cfg.ticks_per_phase = ticks;
        }
}

/// Save the config to disk, creating `~/.avatar/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
