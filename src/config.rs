//! Two-level configuration lookup.
//!
//! Every setting is looked up under `netsplice.<instance>.<key>` first and `netsplice.<key>`
//! second, so one host can carry different settings for several module instances.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use netsplice_mem::{effective_ceiling, Tracking};
use netsplice_worker::DEFAULT_HZ;

pub const KEY_PREFIX: &str = "netsplice";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where configuration values come from.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment. `netsplice.eth.maxmem` is read from `NETSPLICE_ETH_MAXMEM`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfig;

impl EnvConfig {
    pub fn var_name(key: &str) -> String {
        key.chars()
            .map(|c| match c {
                '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok()
    }
}

/// In-memory configuration, keyed by the dotted names.
#[derive(Debug, Clone, Default)]
pub struct MapConfig(HashMap<String, String>);

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

fn instance_key(instance: &str, key: &str) -> String {
    format!("{KEY_PREFIX}.{instance}.{key}")
}

fn global_key(key: &str) -> String {
    format!("{KEY_PREFIX}.{key}")
}

/// Parses `key`, instance value first. Values that fail to parse are skipped with a warning.
fn lookup_parsed<T: FromStr>(source: &dyn ConfigSource, instance: &str, key: &str) -> Option<T> {
    [instance_key(instance, key), global_key(key)]
        .into_iter()
        .find_map(|name| {
            let raw = source.get(&name)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key = %name, value = %raw, "ignoring unparsable config value");
                    None
                }
            }
        })
}

fn lookup_raw(source: &dyn ConfigSource, instance: &str, key: &str) -> Option<String> {
    source
        .get(&instance_key(instance, key))
        .or_else(|| source.get(&global_key(key)))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Settings resolved once when the module loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub instance: String,
    /// Memory ceiling in bytes, never below [`netsplice_mem::MIN_CEILING`].
    pub maxmem: usize,
    /// Opaque parameter string handed to the consumer.
    pub rtparams: Option<String>,
    pub tracking: Tracking,
    pub shutdown_timeout: Duration,
    pub hz: u32,
}

impl ModuleConfig {
    pub fn resolve(source: &dyn ConfigSource, instance: &str) -> Self {
        let maxmem = effective_ceiling(lookup_parsed(source, instance, "maxmem"));
        let rtparams = lookup_raw(source, instance, "rtparams");
        let tracking = match lookup_raw(source, instance, "memtrack") {
            Some(raw) if parse_flag(&raw) => Tracking::Ledger,
            _ => Tracking::Off,
        };
        let shutdown_timeout = lookup_parsed(source, instance, "shutdown_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let hz = lookup_parsed::<u32>(source, instance, "hz")
            .filter(|&hz| hz > 0)
            .unwrap_or(DEFAULT_HZ);

        Self {
            instance: instance.to_string(),
            maxmem,
            rtparams,
            tracking,
            shutdown_timeout,
            hz,
        }
    }

    pub fn from_env(instance: &str) -> Self {
        Self::resolve(&EnvConfig, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsplice_mem::MIN_CEILING;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ModuleConfig::resolve(&MapConfig::new(), "echo");
        assert_eq!(
            config,
            ModuleConfig {
                instance: "echo".into(),
                maxmem: MIN_CEILING,
                rtparams: None,
                tracking: Tracking::Off,
                shutdown_timeout: Duration::from_secs(1),
                hz: DEFAULT_HZ,
            }
        );
    }

    #[test]
    fn instance_value_wins_over_global() {
        let source = MapConfig::new()
            .set("netsplice.maxmem", (64u64 << 20).to_string())
            .set("netsplice.echo.maxmem", (128u64 << 20).to_string())
            .set("netsplice.rtparams", "v=1")
            .set("netsplice.echo.rtparams", "v=2,b=3")
            .set("netsplice.hz", "1000");
        let config = ModuleConfig::resolve(&source, "echo");
        assert_eq!(config.maxmem, 128 << 20);
        assert_eq!(config.rtparams.as_deref(), Some("v=2,b=3"));
        assert_eq!(config.hz, 1000);

        let other = ModuleConfig::resolve(&source, "other");
        assert_eq!(other.maxmem, 64 << 20);
        assert_eq!(other.rtparams.as_deref(), Some("v=1"));
    }

    #[test]
    fn ceiling_floor_wins_and_garbage_is_ignored() {
        let source: MapConfig = [
            ("netsplice.maxmem", "1024"),
            ("netsplice.echo.maxmem", "lots"),
            ("netsplice.echo.shutdown_timeout_ms", "250"),
            ("netsplice.hz", "0"),
        ]
        .into_iter()
        .collect();
        let config = ModuleConfig::resolve(&source, "echo");
        assert_eq!(config.maxmem, MIN_CEILING);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.hz, DEFAULT_HZ);
    }

    #[test]
    fn memtrack_flag_selects_ledger() {
        for (raw, want) in [
            ("1", Tracking::Ledger),
            ("true", Tracking::Ledger),
            ("0", Tracking::Off),
            ("no", Tracking::Off),
        ] {
            let source = MapConfig::new().set("netsplice.memtrack", raw);
            assert_eq!(ModuleConfig::resolve(&source, "x").tracking, want, "{raw}");
        }
    }

    #[test]
    fn env_names_are_upper_snake() {
        assert_eq!(EnvConfig::var_name("netsplice.echo-1.maxmem"), "NETSPLICE_ECHO_1_MAXMEM");
    }
}
