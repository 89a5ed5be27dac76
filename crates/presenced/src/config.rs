use presence_hw::{CameraError, CameraSource, DirectorySource};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `PRESENCE_CONFIG`,
/// then `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Camera source kind: `directory` or `v4l2`.
    pub camera_source: String,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Image directory replayed by the `directory` source.
    pub frames_dir: PathBuf,
    /// Delay between frames of the `directory` source.
    pub frame_interval_ms: u64,
    /// Replay the directory forever instead of stopping at its end.
    pub repeat_frames: bool,
    pub registry_path: PathBuf,
    pub db_path: PathBuf,
    /// Minimum correlation accepted as a match.
    pub match_threshold: f32,
    pub cooldown_secs: u64,
    /// Face detector kind: `full-frame` or `scrfd`.
    pub detector: String,
    pub model_path: PathBuf,
    /// Fraction of near-black pixels above which a frame is skipped.
    pub dark_fraction: f32,
    pub bus: BusKind,
    /// Start the recognition loop as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_source: "directory".to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            frames_dir: data_dir.join("frames"),
            frame_interval_ms: 200,
            repeat_frames: false,
            registry_path: data_dir.join("registry.json"),
            db_path: data_dir.join("attendance.db"),
            match_threshold: 0.6,
            cooldown_secs: 15,
            detector: "full-frame".to_string(),
            model_path: data_dir.join("models/det_10g.onnx"),
            dark_fraction: presence_hw::frame::DARK_FRACTION,
            bus: BusKind::Session,
            autostart: false,
        }
    }
}

impl Config {
    /// Load configuration from the optional config file and `PRESENCE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        let config = base.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Apply `PRESENCE_*` overrides looked up through `var`.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let var = &var;
        if let Some(v) = var("PRESENCE_CAMERA_SOURCE") {
            self.camera_source = v;
        }
        if let Some(v) = var("PRESENCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(var, "PRESENCE_CAMERA_WIDTH", &mut self.camera_width);
        override_parsed(var, "PRESENCE_CAMERA_HEIGHT", &mut self.camera_height);
        if let Some(v) = var("PRESENCE_FRAMES_DIR") {
            self.frames_dir = PathBuf::from(v);
        }
        override_parsed(var, "PRESENCE_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        override_parsed(var, "PRESENCE_REPEAT_FRAMES", &mut self.repeat_frames);
        if let Some(v) = var("PRESENCE_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        if let Some(v) = var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(var, "PRESENCE_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(var, "PRESENCE_COOLDOWN_SECS", &mut self.cooldown_secs);
        if let Some(v) = var("PRESENCE_DETECTOR") {
            self.detector = v;
        }
        if let Some(v) = var("PRESENCE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        override_parsed(var, "PRESENCE_DARK_FRACTION", &mut self.dark_fraction);
        match var("PRESENCE_BUS").as_deref() {
            Some("session") => self.bus = BusKind::Session,
            Some("system") => self.bus = BusKind::System,
            Some(other) => tracing::warn!(value = other, "ignoring PRESENCE_BUS; expected session or system"),
            None => {}
        }
        override_parsed(var, "PRESENCE_AUTOSTART", &mut self.autostart);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{} is outside -1.0..=1.0", self.match_threshold),
            });
        }
        if !(0.0..=1.0).contains(&self.dark_fraction) {
            return Err(ConfigError::Invalid {
                key: "dark_fraction",
                reason: format!("{} is outside 0.0..=1.0", self.dark_fraction),
            });
        }
        if self.cooldown_secs > i64::MAX as u64 / 1000 {
            return Err(ConfigError::Invalid {
                key: "cooldown_secs",
                reason: "too large".to_string(),
            });
        }
        Ok(())
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }

    /// Build the configured camera source.
    pub fn camera(&self) -> Result<Box<dyn CameraSource>, CameraError> {
        match self.camera_source.as_str() {
            "directory" => Ok(Box::new(DirectorySource::new(
                self.frames_dir.clone(),
                Duration::from_millis(self.frame_interval_ms),
                self.repeat_frames,
            ))),
            #[cfg(feature = "v4l2")]
            "v4l2" => Ok(Box::new(presence_hw::V4l2Source::new(
                self.camera_device.clone(),
                self.camera_width,
                self.camera_height,
            ))),
            other => Err(CameraError::UnknownSource(other.to_string())),
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}

/// `$XDG_DATA_HOME/presence`, falling back to `~/.local/share/presence`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.cooldown_secs, 15);
        assert_eq!(config.detector, "full-frame");
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.registry_path.ends_with("presence/registry.json"));
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default().with_overrides(vars(&[
            ("PRESENCE_MATCH_THRESHOLD", "0.75"),
            ("PRESENCE_COOLDOWN_SECS", "30"),
            ("PRESENCE_DB_PATH", "/var/lib/presence/a.db"),
            ("PRESENCE_BUS", "system"),
            ("PRESENCE_AUTOSTART", "true"),
        ]));
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.cooldown(), chrono::Duration::seconds(30));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/presence/a.db"));
        assert_eq!(config.bus, BusKind::System);
        assert!(config.autostart);
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let config = Config::default().with_overrides(vars(&[
            ("PRESENCE_COOLDOWN_SECS", "soon"),
            ("PRESENCE_BUS", "tram"),
        ]));
        assert_eq!(config.cooldown_secs, 15);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(
            &path,
            "match_threshold = 0.8\ncooldown_secs = 60\ncamera_source = \"directory\"\nframes_dir = \"/srv/frames\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path)
            .unwrap()
            .with_overrides(vars(&[("PRESENCE_COOLDOWN_SECS", "5")]));
        assert_eq!(config.match_threshold, 0.8);
        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.frames_dir, PathBuf::from("/srv/frames"));
        // Unset keys keep their defaults.
        assert_eq!(config.detector, "full-frame");
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(&path, "treshold = 0.8\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_ranges() {
        let config = Config { match_threshold: 1.5, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { key: "match_threshold", .. })));

        let config = Config { dark_fraction: -0.1, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_kinds() {
        let config = Config::default();
        assert!(config.camera().unwrap().describe().contains("frames"));

        let config = Config { camera_source: "carrier-pigeon".into(), ..Config::default() };
        assert!(matches!(config.camera(), Err(CameraError::UnknownSource(_))));
    }
}
