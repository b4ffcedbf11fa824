use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CueError, Result};
use crate::marker::{MarkerFormat, MarkerId};

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "cuespeak.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub markers: MarkersConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================================
// Markers Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct MarkersConfig {
    /// Lowest id handed out by the marker registry
    #[serde(default = "default_first_id")]
    pub first_id: MarkerId,
    /// Highest id before the counter wraps back to `first_id`
    #[serde(default = "default_last_id")]
    pub last_id: MarkerId,
    /// Placeholder embedded in speech text, `{id}` is replaced by the marker id
    #[serde(default = "default_template")]
    pub template: String,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            first_id: default_first_id(),
            last_id: default_last_id(),
            template: default_template(),
        }
    }
}

fn default_first_id() -> MarkerId {
    50
}

fn default_last_id() -> MarkerId {
    1000
}

fn default_template() -> String {
    "\\mrk={id}\\".into()
}

// ============================================================================
// Commands Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct CommandsConfig {
    /// Characters accepted right after `!` in a command token
    #[serde(default = "default_flags")]
    pub flags: String,

    /// The flag that makes a command blocking
    #[serde(default = "default_blocking_flag")]
    pub blocking_flag: char,

    /// Splits the rest of a command token into argv
    #[serde(default = "default_separator")]
    pub separator: char,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            flags: default_flags(),
            blocking_flag: default_blocking_flag(),
            separator: default_separator(),
        }
    }
}

fn default_flags() -> String {
    "srw".into()
}

fn default_blocking_flag() -> char {
    'r'
}

fn default_separator() -> char {
    '_'
}

// ============================================================================
// Dispatch Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Give up waiting on a blocking command after this long (never, if unset)
    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    /// After stdin closes, how long queued messages may take to finish when
    /// bookmarks come from an external engine over stdin
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: None,
            drain_ms: default_drain_ms(),
        }
    }
}

fn default_drain_ms() -> u64 {
    2000
}

impl DispatchConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

// ============================================================================
// Playback Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackEngineConfig {
    /// Speech goes out on stdout, an external engine reports bookmarks on stdin
    #[default]
    Stdout,
    /// In-process engine that paces words with a fixed delay
    Paced,
    /// In-process engine that runs a TTS program per text segment
    Program,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub engine: PlaybackEngineConfig,
    /// Time per word for the paced engine
    #[serde(default = "default_word_ms")]
    pub word_ms: u64,
    /// Program and leading arguments for the program engine
    #[serde(default = "default_program")]
    pub program: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            engine: PlaybackEngineConfig::default(),
            word_ms: default_word_ms(),
            program: default_program(),
        }
    }
}

fn default_word_ms() -> u64 {
    250
}

fn default_program() -> Vec<String> {
    vec!["espeak-ng".to_string()]
}

// ============================================================================
// Logging Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// tracing-subscriber filter directive, RUST_LOG takes precedence
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".into()
}

impl Config {
    /// Load from `path`, or from `cuespeak.toml` if present, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        if !path.exists() {
            if required {
                return Err(CueError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            return Ok(Config::default());
        }

        let text = fs::read_to_string(path)
            .map_err(|e| CueError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| CueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.markers;
        if m.first_id == 0 || m.first_id > m.last_id {
            return Err(CueError::Config(format!(
                "marker window {}..={} is empty or starts at 0",
                m.first_id, m.last_id
            )));
        }
        MarkerFormat::new(&m.template)?;

        let c = &self.commands;
        if !c.flags.contains(c.blocking_flag) {
            return Err(CueError::Config(format!(
                "blocking flag '{}' is not among the command flags '{}'",
                c.blocking_flag, c.flags
            )));
        }
        if c.separator.is_whitespace() {
            return Err(CueError::Config(
                "command separator cannot be whitespace".into(),
            ));
        }

        if self.playback.engine == PlaybackEngineConfig::Program && self.playback.program.is_empty()
        {
            return Err(CueError::Config(
                "program playback needs a program to run".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.markers.first_id, 50);
        assert_eq!(config.markers.last_id, 1000);
        assert_eq!(config.markers.template, "\\mrk={id}\\");
        assert_eq!(config.commands.blocking_flag, 'r');
        assert_eq!(config.commands.separator, '_');
        assert_eq!(config.dispatch.max_wait(), None);
        assert_eq!(config.dispatch.drain(), Duration::from_secs(2));
        assert_eq!(config.playback.engine, PlaybackEngineConfig::Stdout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [markers]
            last_id = 60

            [dispatch]
            max_wait_ms = 1500
            drain_ms = 300

            [playback]
            engine = "paced"
            word_ms = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.markers.first_id, 50);
        assert_eq!(config.markers.last_id, 60);
        assert_eq!(config.dispatch.max_wait(), Some(Duration::from_millis(1500)));
        assert_eq!(config.dispatch.drain(), Duration::from_millis(300));
        assert_eq!(config.playback.engine, PlaybackEngineConfig::Paced);
        assert_eq!(config.playback.word_ms, 10);
        assert_eq!(config.commands.flags, "srw");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_toml("[markers]\nfirst_id = 10\nlast_id = 5"),
            Err(CueError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[markers]\ntemplate = \"<mark/>\""),
            Err(CueError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[commands]\nflags = \"sw\""),
            Err(CueError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[commands]\nseparator = \" \""),
            Err(CueError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[playback]\nengine = \"program\"\nprogram = []"),
            Err(CueError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[commands]\nseparator = \",\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.commands.separator, ',');
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(CueError::Config(_))
        ));
    }
}
