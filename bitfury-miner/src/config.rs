//! Driver configuration.
//!
//! Runtime settings come from environment variables; per-chip clock
//! overrides come from a comma-separated option string.

use std::path::PathBuf;
use std::time::Duration;

use crate::autoclock::TuningParams;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::{ChipKey, ClockBits};

/// Default prefetch buffer capacity.
pub const DEFAULT_PREFETCH: usize = 16;

/// Poll interval the worker sleeps to when a poll finishes early.
pub const DEFAULT_SCAN_DELAY: Duration = Duration::from_millis(30);

/// Polls slower than this are logged.
pub const SLOW_POLL: Duration = Duration::from_millis(500);

/// Driver configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub tuning: TuningParams,

    /// Target interval between polls.
    pub scan_delay: Duration,

    /// Let the clock controller tune chips.
    ///
    /// When off, every chip is locked at its initial setting.
    pub autoclock: bool,

    /// Where clock tables are kept across restarts; `None` disables
    /// persistence.
    pub record_path: Option<PathBuf>,

    /// Prefetch buffer capacity.
    pub prefetch_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tuning: TuningParams::default(),
            scan_delay: DEFAULT_SCAN_DELAY,
            autoclock: true,
            record_path: default_record_path(),
            prefetch_capacity: DEFAULT_PREFETCH,
        }
    }
}

/// `$HOME/.bitfury/clock_record.conf`, if `HOME` is set.
pub fn default_record_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".bitfury").join("clock_record.conf"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl DriverConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BITFURY_STAT_WINDOW_SECS`: statistics window (default: 20, min 1)
    /// - `BITFURY_SCAN_DELAY_MS`: poll interval (default: 30)
    /// - `BITFURY_AUTOCLOCK`: `0`, `false` or `off` disables tuning
    /// - `BITFURY_RECORD`: clock record path; empty disables persistence
    ///   (default: `$HOME/.bitfury/clock_record.conf`)
    /// - `BITFURY_PREFETCH`: prefetch capacity (default: 16, min 1)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("BITFURY_STAT_WINDOW_SECS") {
            config.tuning.window = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_parse::<u64>("BITFURY_SCAN_DELAY_MS") {
            config.scan_delay = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("BITFURY_AUTOCLOCK") {
            config.autoclock = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
        if let Some(path) = std::env::var_os("BITFURY_RECORD") {
            config.record_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(capacity) = env_parse::<usize>("BITFURY_PREFETCH") {
            config.prefetch_capacity = capacity.max(1);
        }

        config
    }
}

/// One entry of the clock option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOverride {
    /// Initial setting for every chip
    Default(ClockBits),
    /// Pin one chip
    Chip { key: ChipKey, bits: ClockBits },
}

/// Parsed clock option.
///
/// `"54"` sets the initial setting of all chips; `"0:3:55,1:0:52"` pins
/// chip 3 of slot 0 and chip 0 of slot 1. Both forms may be mixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockOverrides {
    pub default: Option<ClockBits>,
    pub chips: Vec<(ChipKey, ClockBits)>,
}

impl ClockOverrides {
    /// Parse a clock option, skipping invalid entries with a warning.
    pub fn parse(option: &str) -> Self {
        let mut overrides = Self::default();
        for entry in option.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match parse_entry(entry) {
                Ok(ClockOverride::Default(bits)) => overrides.default = Some(bits),
                Ok(ClockOverride::Chip { key, bits }) => overrides.chips.push((key, bits)),
                Err(e) => warn!(error = %e, "Ignoring clock option entry."),
            }
        }
        overrides
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.chips.is_empty()
    }
}

/// Parse `slot:position:bits` or a bare `bits`.
pub fn parse_entry(entry: &str) -> Result<ClockOverride> {
    let invalid = |reason: &str| Error::InvalidClockOption {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };
    let bits = |s: &str| -> Result<ClockBits> {
        let raw: u8 = s.trim().parse().map_err(|_| invalid("bits not a number"))?;
        ClockBits::checked(raw).ok_or_else(|| invalid("bits outside 48..=56"))
    };

    let fields: Vec<&str> = entry.split(':').collect();
    match fields.as_slice() {
        [value] => Ok(ClockOverride::Default(bits(*value)?)),
        [slot, position, value] => {
            let slot = slot.trim().parse().map_err(|_| invalid("bad slot"))?;
            let position = position.trim().parse().map_err(|_| invalid("bad position"))?;
            Ok(ClockOverride::Chip {
                key: ChipKey::new(slot, position),
                bits: bits(*value)?,
            })
        }
        _ => Err(invalid("expected slot:position:bits or bits")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use test_case::test_case;

    const VARS: [&str; 5] = [
        "BITFURY_STAT_WINDOW_SECS",
        "BITFURY_SCAN_DELAY_MS",
        "BITFURY_AUTOCLOCK",
        "BITFURY_RECORD",
        "BITFURY_PREFETCH",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        clear_env();
        let config = DriverConfig::from_env();
        assert_eq!(config.tuning.window, Duration::from_secs(20));
        assert_eq!(config.scan_delay, DEFAULT_SCAN_DELAY);
        assert!(config.autoclock);
        assert_eq!(config.prefetch_capacity, DEFAULT_PREFETCH);
        assert_eq!(config.record_path, default_record_path());
    }

    #[test]
    #[serial]
    fn env_overrides() {
        clear_env();
        std::env::set_var("BITFURY_STAT_WINDOW_SECS", "5");
        std::env::set_var("BITFURY_SCAN_DELAY_MS", "10");
        std::env::set_var("BITFURY_AUTOCLOCK", "off");
        std::env::set_var("BITFURY_RECORD", "/tmp/record.conf");
        std::env::set_var("BITFURY_PREFETCH", "0");

        let config = DriverConfig::from_env();
        assert_eq!(config.tuning.window, Duration::from_secs(5));
        assert_eq!(config.scan_delay, Duration::from_millis(10));
        assert!(!config.autoclock);
        assert_eq!(config.record_path, Some(PathBuf::from("/tmp/record.conf")));
        assert_eq!(config.prefetch_capacity, 1);
        clear_env();
    }

    #[test]
    #[serial]
    fn empty_record_disables_persistence() {
        clear_env();
        std::env::set_var("BITFURY_RECORD", "");
        assert_eq!(DriverConfig::from_env().record_path, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn unparsable_values_keep_defaults() {
        clear_env();
        std::env::set_var("BITFURY_SCAN_DELAY_MS", "soon");
        std::env::set_var("BITFURY_AUTOCLOCK", "yes");
        let config = DriverConfig::from_env();
        assert_eq!(config.scan_delay, DEFAULT_SCAN_DELAY);
        assert!(config.autoclock);
        clear_env();
    }

    #[test]
    fn option_mixes_default_and_pins() {
        let overrides = ClockOverrides::parse("54, 0:3:55,1:0:52,");
        assert_eq!(overrides.default, Some(ClockBits(54)));
        assert_eq!(
            overrides.chips,
            vec![
                (ChipKey::new(0, 3), ClockBits(55)),
                (ChipKey::new(1, 0), ClockBits(52)),
            ]
        );
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let overrides = ClockOverrides::parse("60,0:1:57,x:1:54,0:2:53,0:1");
        assert_eq!(overrides.default, None);
        assert_eq!(overrides.chips, vec![(ChipKey::new(0, 2), ClockBits(53))]);
        assert!(ClockOverrides::parse("").is_empty());
    }

    #[test_case("48", true; "lowest")]
    #[test_case("56", true; "highest")]
    #[test_case("47", false; "too low")]
    #[test_case("57", false; "too high")]
    #[test_case("fast", false; "not a number")]
    #[test_case("1:2:3:4", false; "too many fields")]
    fn entry_validation(entry: &str, valid: bool) {
        assert_eq!(parse_entry(entry).is_ok(), valid);
    }
}
