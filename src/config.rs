//! Remote session configuration.

use crate::{muted_error, weak_error};
use crate::rsp_error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::read_to_string;
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// How a user interrupt is delivered to an all-stop target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, Display)]
#[serde(try_from = "String")]
pub enum InterruptSequence {
    /// Single `\x03` byte.
    #[default]
    #[strum(serialize = "ctrl-c")]
    CtrlC,
    /// BREAK condition on the line.
    #[strum(serialize = "break")]
    Break,
    /// BREAK followed by `g`, for Linux kernel targets with magic SysRq.
    #[strum(serialize = "break-g")]
    BreakG,
}

impl TryFrom<String> for InterruptSequence {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-packet detection override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, Display)]
#[serde(try_from = "String")]
pub enum Detect {
    /// Trust negotiation and first-use probing.
    #[default]
    #[strum(serialize = "auto")]
    Auto,
    /// Assume the stub supports the packet.
    #[strum(serialize = "on")]
    On,
    /// Never send the packet.
    #[strum(serialize = "off")]
    Off,
}

impl TryFrom<String> for Detect {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub reply_timeout_ms: u64,
    /// Watchdog for a resumed target, `0` disables it.
    pub watchdog_secs: u64,
    pub interrupt_poll_ms: u64,
    pub no_ack: bool,
    pub non_stop: bool,
    pub range_stepping: bool,
    pub interrupt_sequence: InterruptSequence,
    pub max_packet_size: Option<usize>,
    pub pass_signals: Vec<u8>,
    pub packets: HashMap<String, Detect>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 2000,
            watchdog_secs: 0,
            interrupt_poll_ms: 50,
            no_ack: true,
            non_stop: false,
            range_stepping: true,
            interrupt_sequence: InterruptSequence::default(),
            max_packet_size: None,
            pass_signals: vec![],
            packets: HashMap::new(),
        }
    }
}

impl SessionConfig {
    const DEFAULT_PATH: &'static str = ".config/bs/remote.toml";

    /// Load configuration from a file. Fallback to defaults on errors.
    pub fn from_file(path: Option<&str>) -> Self {
        Self::try_from_file(path).unwrap_or_default()
    }

    fn try_from_file(path: Option<&str>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?;
                let path = path.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    rsp_error!(target: "remote", "Error while load remote config file: {err}");
                    return None;
                }
            },
        };

        weak_error!(Self::parse(&data))
    }

    /// Parse configuration from TOML text.
    pub fn parse(data: &str) -> Result<Self, crate::remote::error::Error> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        (self.watchdog_secs != 0).then(|| Duration::from_secs(self.watchdog_secs))
    }

    pub fn interrupt_poll(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_ms.max(1))
    }
}
