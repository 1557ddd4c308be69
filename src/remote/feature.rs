//! Capability table and `qSupported` negotiation.

use crate::config::Detect;
use crate::remote::packet;
use indexmap::IndexMap;
use crate::{rsp_debug, rsp_warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

/// Observed support of a feature or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Support {
    /// Not known yet, probe on first use.
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

/// Optional protocol features and packets, named as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
pub enum Feature {
    // --------------------------------- qSupported features ---------------------------------------
    #[strum(serialize = "QStartNoAckMode")]
    StartNoAckMode,
    #[strum(serialize = "multiprocess")]
    Multiprocess,
    #[strum(serialize = "QNonStop")]
    NonStop,
    #[strum(serialize = "swbreak")]
    SwBreak,
    #[strum(serialize = "hwbreak")]
    HwBreak,
    #[strum(serialize = "fork-events")]
    ForkEvents,
    #[strum(serialize = "vfork-events")]
    VForkEvents,
    #[strum(serialize = "exec-events")]
    ExecEvents,
    #[strum(serialize = "vContSupported")]
    VContSupported,
    #[strum(serialize = "QThreadEvents")]
    ThreadEvents,
    #[strum(serialize = "no-resumed")]
    NoResumed,
    #[strum(serialize = "QPassSignals")]
    PassSignals,
    #[strum(serialize = "QProgramSignals")]
    ProgramSignals,
    #[strum(serialize = "ConditionalBreakpoints")]
    ConditionalBreakpoints,
    #[strum(serialize = "BreakpointCommands")]
    BreakpointCommands,
    #[strum(serialize = "qXfer:threads:read")]
    XferThreads,
    #[strum(serialize = "qXfer:features:read")]
    XferFeatures,
    #[strum(serialize = "qXfer:libraries:read")]
    XferLibraries,
    #[strum(serialize = "qXfer:auxv:read")]
    XferAuxv,
    #[strum(serialize = "QAgent")]
    Agent,
    #[strum(serialize = "ConditionalTracepoints")]
    ConditionalTracepoints,
    #[strum(serialize = "TracepointSource")]
    TracepointSource,

    // --------------------------------- probed on first use ---------------------------------------
    #[strum(serialize = "vCont")]
    VCont,
    #[strum(serialize = "vCtrlC")]
    VCtrlC,
    #[strum(serialize = "X")]
    BinaryDownload,
    #[strum(serialize = "p")]
    ReadRegister,
    #[strum(serialize = "P")]
    WriteRegister,
    #[strum(serialize = "Z0")]
    SwBreakpoint,
    #[strum(serialize = "Z1")]
    HwBreakpoint,
    #[strum(serialize = "Z2")]
    WriteWatchpoint,
    #[strum(serialize = "Z3")]
    ReadWatchpoint,
    #[strum(serialize = "Z4")]
    AccessWatchpoint,
    #[strum(serialize = "qC")]
    CurrentThread,
    #[strum(serialize = "qfThreadInfo")]
    ThreadInfo,
    #[strum(serialize = "qThreadExtraInfo")]
    ThreadExtraInfo,
    #[strum(serialize = "T")]
    ThreadAlive,
    #[strum(serialize = "vAttach")]
    Attach,
    #[strum(serialize = "vRun")]
    Run,
    #[strum(serialize = "vKill")]
    Kill,
    #[strum(serialize = "D")]
    Detach,
    #[strum(serialize = "QTinit")]
    Trace,
}

impl Feature {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Features that appear in a `qSupported` reply.
    /// Features not mentioned in a reply fall back to their default.
    pub fn negotiated(self) -> bool {
        (self as u8) < (Feature::VCont as u8)
    }

    /// Support assumed before (or without) negotiation.
    fn default_support(self) -> Support {
        if self.negotiated() {
            return Support::Disabled;
        }
        Support::Unknown
    }

    /// Offered by the client in `qSupported` query with `+`.
    fn offered(self) -> bool {
        matches!(
            self,
            Feature::Multiprocess
                | Feature::SwBreak
                | Feature::HwBreak
                | Feature::ForkEvents
                | Feature::VForkEvents
                | Feature::ExecEvents
                | Feature::VContSupported
                | Feature::ThreadEvents
                | Feature::NoResumed
        )
    }
}

impl Display for Feature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability entry of a single feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub detect: Detect,
    pub observed: Support,
}

impl Capability {
    /// Support with user overrides applied.
    pub fn effective(&self) -> Support {
        match self.detect {
            Detect::Auto => self.observed,
            Detect::On => Support::Enabled,
            Detect::Off => Support::Disabled,
        }
    }
}

/// Table of capabilities for a session.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    caps: IndexMap<Feature, Capability>,
    /// Raw values of `name=value` features, `PacketSize` included.
    values: HashMap<String, String>,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

impl FeatureSet {
    /// Create table with defaults, `overrides` maps wire names to detection mode.
    pub fn new(overrides: &HashMap<String, Detect>) -> Self {
        let caps = Feature::iter()
            .map(|f| {
                let detect = overrides.get(f.name()).copied().unwrap_or_default();
                (
                    f,
                    Capability {
                        detect,
                        observed: f.default_support(),
                    },
                )
            })
            .collect();

        for name in overrides.keys() {
            if Feature::from_str(name).is_err() {
                rsp_warn!(target: "remote", "unknown packet `{name}` in configuration, ignored");
            }
        }

        Self {
            caps,
            values: HashMap::new(),
        }
    }

    pub fn capability(&self, f: Feature) -> Capability {
        self.caps.get(&f).copied().unwrap_or(Capability {
            detect: Detect::Auto,
            observed: f.default_support(),
        })
    }

    pub fn support(&self, f: Feature) -> Support {
        self.capability(f).effective()
    }

    pub fn is_enabled(&self, f: Feature) -> bool {
        self.support(f) == Support::Enabled
    }

    pub fn is_disabled(&self, f: Feature) -> bool {
        self.support(f) == Support::Disabled
    }

    /// Record observed support (probing result or negotiation).
    pub fn observe(&mut self, f: Feature, support: Support) {
        if let Some(cap) = self.caps.get_mut(&f) {
            if cap.observed != support {
                rsp_debug!(target: "remote", "feature {f}: {:?} -> {support:?}", cap.observed);
            }
            cap.observed = support;
        }
    }

    /// Value of a `name=value` feature from the last negotiation.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Iterate over all capabilities in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Feature, Capability)> + '_ {
        self.caps.iter().map(|(f, c)| (*f, *c))
    }

    /// Build `qSupported` request payload.
    pub fn query(&self) -> String {
        let offered = Feature::iter()
            .filter(|f| f.offered() && self.capability(*f).detect != Detect::Off)
            .map(|f| format!("{f}+"))
            .collect::<Vec<_>>()
            .join(";");
        format!("qSupported:{offered}")
    }

    /// Apply `qSupported` reply. Return negotiated packet size if the stub reports one.
    pub fn apply_reply(&mut self, reply: &[u8]) -> Option<usize> {
        for f in Feature::iter().filter(|f| f.negotiated()) {
            self.observe(f, f.default_support());
        }
        self.values.clear();

        let mut packet_size = None;
        for token in reply.split(|&b| b == b';').filter(|t| !t.is_empty()) {
            let token = String::from_utf8_lossy(token);

            let (name, support) = if let Some((name, value)) = token.split_once('=') {
                if name == "PacketSize" {
                    match packet::parse_hex_u64(value.as_bytes()) {
                        Ok(size) => packet_size = Some(size as usize),
                        Err(_) => rsp_warn!(target: "remote", "invalid PacketSize value `{value}`"),
                    }
                }
                self.values.insert(name.to_string(), value.to_string());
                (name, Support::Enabled)
            } else if let Some(name) = token.strip_suffix('+') {
                (name, Support::Enabled)
            } else if let Some(name) = token.strip_suffix('-') {
                (name, Support::Disabled)
            } else if let Some(name) = token.strip_suffix('?') {
                (name, Support::Unknown)
            } else {
                rsp_warn!(target: "remote", "malformed qSupported token `{token}`, ignored");
                continue;
            };

            match Feature::from_str(name) {
                Ok(f) => self.observe(f, support),
                Err(_) => rsp_debug!(target: "remote", "unknown feature `{name}` ignored"),
            }
        }
        packet_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_apply_reply() {
        struct TestCase {
            reply: &'static [u8],
            enabled: &'static [Feature],
            disabled: &'static [Feature],
            unknown: &'static [Feature],
            packet_size: Option<usize>,
        }
        let test_cases = [
            TestCase {
                reply: b"multiprocess+;swbreak+;PacketSize=3fff",
                enabled: &[Feature::Multiprocess, Feature::SwBreak],
                disabled: &[Feature::HwBreak, Feature::NonStop],
                unknown: &[Feature::VCont],
                packet_size: Some(0x3fff),
            },
            TestCase {
                reply: b"PacketSize=47ff;QStartNoAckMode+;QNonStop+;hwbreak-;qXfer:threads:read+;unknown-feature+;xmlRegisters=i386",
                enabled: &[Feature::StartNoAckMode, Feature::NonStop, Feature::XferThreads],
                disabled: &[Feature::HwBreak, Feature::Multiprocess],
                unknown: &[Feature::BinaryDownload],
                packet_size: Some(0x47ff),
            },
            TestCase {
                reply: b"vContSupported?;garbage",
                enabled: &[],
                disabled: &[Feature::SwBreak],
                unknown: &[Feature::VContSupported],
                packet_size: None,
            },
        ];

        for tc in test_cases {
            let mut set = FeatureSet::default();
            assert_eq!(set.apply_reply(tc.reply), tc.packet_size);
            for f in tc.enabled {
                assert_eq!(set.support(*f), Support::Enabled, "{f}");
            }
            for f in tc.disabled {
                assert_eq!(set.support(*f), Support::Disabled, "{f}");
            }
            for f in tc.unknown {
                assert_eq!(set.support(*f), Support::Unknown, "{f}");
            }
        }
    }

    #[test]
    fn test_overrides() {
        let overrides = HashMap::from([
            ("vCont".to_string(), Detect::Off),
            ("multiprocess".to_string(), Detect::On),
            ("fork-events".to_string(), Detect::Off),
        ]);
        let mut set = FeatureSet::new(&overrides);
        set.apply_reply(b"vContSupported+");
        set.observe(Feature::VCont, Support::Enabled);

        assert!(set.is_disabled(Feature::VCont));
        assert!(set.is_enabled(Feature::Multiprocess));
        assert_eq!(
            set.capability(Feature::VCont).observed,
            Support::Enabled
        );

        let query = set.query();
        assert!(query.starts_with("qSupported:multiprocess+;swbreak+;hwbreak+"));
        assert!(!query.contains(";fork-events"));
        assert!(query.contains("vfork-events+"));
    }

    #[test]
    fn test_xml_registers_value() {
        let mut set = FeatureSet::default();
        set.apply_reply(b"xmlRegisters=i386;PacketSize=zz");
        assert_eq!(set.value("xmlRegisters"), Some("i386"));
    }
}
