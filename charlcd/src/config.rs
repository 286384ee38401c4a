use charlcd_gpio::lcd::hd44780::registry::MAX_DISPLAYS;
use charlcd_gpio::lcd::hd44780::{DisplayWiring, LogicalPin, PinChain};
use serde::Deserialize;
use std::env::var_os;
use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wiring of one display as written in the config file.
///
/// Control signals are chains, so one signal may fan out to several lines:
///
/// ```json
/// { "en": [{ "line": 17 }], "rs": [{ "line": 22 }], "rw": [{ "line": 27 }],
///   "db4": { "line": 26 }, "db5": { "line": 16 }, "db6": { "line": 20 }, "db7": { "line": 21 } }
/// ```
#[derive(Deserialize, Debug, Clone)]
pub struct DisplayConfig {
    pub en: PinChain,
    pub rs: PinChain,
    pub rw: PinChain,
    pub db4: LogicalPin,
    pub db5: LogicalPin,
    pub db6: LogicalPin,
    pub db7: LogicalPin,
}

impl From<DisplayConfig> for DisplayWiring {
    fn from(config: DisplayConfig) -> Self {
        DisplayWiring::new_4bit(
            config.en,
            config.rs,
            config.rw,
            [config.db4, config.db5, config.db6, config.db7],
        )
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub capacity: usize,
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub displays: Vec<DisplayConfig>,
}

impl Config {
    /// Loads the file named by `CHARLCD_CONFIG`, or `charlcd.json`. A missing file is not an
    /// error.
    pub fn try_load() -> Result<Option<Self>, ConfigError> {
        let config_str = var_os("CHARLCD_CONFIG");
        let config_str: &OsStr = config_str.as_deref().unwrap_or(OsStr::new("charlcd.json"));
        let config_path = Path::new(config_str);
        if !config_path.exists() {
            return Ok(None);
        }

        let file = std::fs::File::open(config_path)?;
        let reader = std::io::BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capacity: MAX_DISPLAYS,
            line1: None,
            line2: None,
            displays: Vec::new(),
        }
    }
}
