//! # Configuration Management
//!
//! Loads the device configuration from a TOML file (`inky-config.toml` by
//! default). Every field has a default applied up front, so a partial file
//! only needs the values it changes and a missing or broken file still
//! produces a working configuration.
//!
//! The rest of the crate never reads raw configuration: it asks [`Config`]
//! for the value objects it needs ([`RequestSpec`], [`FetchPolicy`],
//! [`ScheduleInputs`]).

use crate::clock::SleepWindow;
use crate::fetch::{FetchPolicy, RequestSpec};
use crate::scheduler::{Schedule, ScheduleInputs};
use crate::stream::ReadTimeouts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "inky-config.toml";
pub const DEFAULT_ENDPOINT: &str = "/render/unsplash,wallhaven";
pub const VERSION: &str = "0.0.1-beta.1";

/// Application configuration loaded from inky-config.toml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint root of the image server. May embed `user:pass@`.
    pub api: String,
    pub renderer: RendererConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
    pub state: StateConfig,
    pub output: OutputConfig,
}

/// What to fetch and when.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Fixed path between the root and the endpoint
    pub basepath: String,
    /// Endpoint used when no labeled wake applies
    pub default: String,
    /// Endpoint for wakes triggered by the button
    pub button: Option<String>,
    /// Fallback wake interval, e.g. `1h` or `30m`. Empty means top of the hour
    pub wake_interval: String,
    /// Attempts per fetch
    pub retries: u32,
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,
    /// Show a stand-by notice before fetching
    pub clear_display: bool,
    pub user_agent: String,
    pub sleep_window: SleepWindowConfig,
    /// Time-of-day label → endpoint
    pub wakes: Schedule,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SleepWindowConfig {
    pub start: String,
    pub stop: String,
}

/// Panel geometry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Native panel width in pixels
    pub width: u32,
    /// Native panel height in pixels
    pub height: u32,
    /// Quarter turns; odd values swap width and height
    pub rotation: u8,
    /// Bits per pixel used for the payload ceiling
    pub bit_depth: u32,
    /// Height reserved for overlay messages
    pub msg_box_height: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `INKY_LOG`
    pub level: String,
    /// Relay queue length
    pub queue_capacity: usize,
    pub topic: String,
    /// Best-effort drain before sleeping
    pub drain_timeout_ms: u64,
    /// Append relayed lines to this file
    pub relay_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    /// Wake state carried between cycles
    pub path: PathBuf,
    /// Sleep used when no wake time can be scheduled
    pub fallback_sleep_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving frame.jpg and frame.json
    pub dir: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            basepath: "/api/v1".to_string(),
            default: DEFAULT_ENDPOINT.to_string(),
            button: None,
            wake_interval: String::new(),
            retries: 3,
            timeout_secs: 30,
            clear_display: false,
            user_agent: format!("Inky Renderer/v{VERSION}"),
            sleep_window: SleepWindowConfig::default(),
            wakes: Schedule::new(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1200, // Inkplate 10
            height: 825,
            rotation: 0,
            bit_depth: 8,
            msg_box_height: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            queue_capacity: crate::relay::DEFAULT_CAPACITY,
            topic: crate::relay::DEFAULT_TOPIC.to_string(),
            drain_timeout_ms: 5000,
            relay_file: None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inky-state.json"),
            fallback_sleep_secs: 3600,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frame"),
        }
    }
}

impl DisplayConfig {
    /// Width and height as the server should render them.
    pub fn oriented(&self) -> (u32, u32) {
        if self.rotation % 2 == 0 {
            (self.width, self.height)
        } else {
            (self.height, self.width)
        }
    }
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Missing,
    /// The file exists but does not parse; holds the parser message.
    Invalid(String),
}

impl ConfigSource {
    /// Emit the load outcome. Called once a subscriber is installed.
    pub fn log(&self, path: &Path) {
        match self {
            ConfigSource::File => info!(path = %path.display(), "loaded configuration"),
            ConfigSource::Missing => {
                warn!(path = %path.display(), "no config file found, using defaults")
            }
            ConfigSource::Invalid(error) => {
                warn!(path = %path.display(), error = %error, "invalid config file, using defaults")
            }
        }
    }
}

impl Config {
    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let (config, source) = Self::load_with_source(path.as_ref());
        source.log(path.as_ref());
        config
    }

    /// Like [`Config::load_from_path`] but hands the outcome back instead of
    /// logging it, for callers that load before tracing is set up.
    pub fn load_with_source<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }

    /// Write the resolved configuration as pretty TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }

    /// The API root without credentials, for logs.
    pub fn masked_api(&self) -> String {
        match crate::target::RequestTarget::parse(&self.api) {
            Ok(target) => target.masked(),
            Err(_) if self.api.trim().is_empty() => "<unset>".to_string(),
            Err(_) => "<invalid>".to_string(),
        }
    }

    pub fn sleep_window(&self) -> Option<SleepWindow> {
        let window = &self.renderer.sleep_window;
        SleepWindow::from_strs(&window.start, &window.stop)
    }

    pub fn schedule_inputs(&self) -> ScheduleInputs<'_> {
        ScheduleInputs {
            sleep_window: self.sleep_window(),
            schedule: &self.renderer.wakes,
            default_endpoint: &self.renderer.default,
            fallback_interval: &self.renderer.wake_interval,
        }
    }

    /// Request parameters for `endpoint`.
    pub fn request_spec(&self, endpoint: &str) -> RequestSpec {
        let (width, height) = self.display.oriented();
        RequestSpec {
            root: self.api.clone(),
            base_path: self.renderer.basepath.clone(),
            endpoint: endpoint.to_string(),
            width,
            height,
            message_box_height: self.display.msg_box_height,
            user_agent: self.renderer.user_agent.clone(),
        }
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_attempts: self.renderer.retries.max(1),
            attempt_timeout: Duration::from_secs(self.renderer.timeout_secs.max(1)),
            read_timeouts: ReadTimeouts::default(),
            max_bytes: FetchPolicy::payload_ceiling(
                self.display.width,
                self.display.height,
                self.display.bit_depth,
            ),
            ..FetchPolicy::default()
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.logging.drain_timeout_ms)
    }

    pub fn fallback_sleep(&self) -> Duration {
        Duration::from_secs(self.state.fallback_sleep_secs.max(1))
    }
}
