//! Engine configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. a TOML file named by `VBAR_CONFIG`
//! 3. individual `VBAR_*` environment variables
//!
//! ```toml
//! page_size = "32M"
//! physical_budget = "6G"
//! device_watermark = 0
//! max_acquire_retries = 4
//! log_level = "debug"
//! ```
//!
//! Byte quantities accept either an integer or a string with a `K`, `M` or
//! `G` suffix.

use crate::{VbarError, VbarResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

const MIB: usize = 1024 * 1024;

/// Environment variable naming a TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "VBAR_CONFIG";

/// Tunables for the engine and the host shim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Residency granularity of every VBAR.
    #[serde(deserialize_with = "de_size")]
    pub page_size: usize,

    /// Alignment of offsets returned by `alloc`.
    #[serde(deserialize_with = "de_size")]
    pub alloc_alignment: usize,

    /// Cap VBAR reservations to the device's total memory before halving.
    pub cap_to_device_memory: bool,

    /// Physical bytes the page pool may commit per device (0 = until the
    /// driver refuses).
    #[serde(deserialize_with = "de_size")]
    pub physical_budget: usize,

    /// Resident bytes allowed across all VBARs of a device (0 = unlimited).
    #[serde(deserialize_with = "de_size")]
    pub device_watermark: usize,

    /// How many eviction rounds a fault may run to obtain one page.
    pub max_acquire_retries: u32,

    /// Granule used to account host-framework allocations.
    #[serde(deserialize_with = "de_size")]
    pub host_granularity: usize,

    /// Free memory kept in reserve when admitting host allocations.
    #[serde(deserialize_with = "de_size")]
    pub host_headroom: usize,

    /// Default `tracing` filter when `VBAR_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 32 * MIB,
            alloc_alignment: 512,
            cap_to_device_memory: true,
            physical_budget: 0,
            device_watermark: 0,
            max_acquire_retries: 4,
            host_granularity: 2 * MIB,
            host_headroom: 256 * MIB,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Toml`] on malformed input and
    /// [`VbarError::Config`] on invalid values.
    pub fn parse(content: &str) -> VbarResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O, parse or validation error.
    pub fn load(path: impl AsRef<Path>) -> VbarResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Build the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `VBAR_CONFIG` names an unreadable or invalid
    /// file, or if an override does not parse.
    pub fn from_env() -> VbarResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::load(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `VBAR_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Config`] if a value does not parse or the result
    /// is invalid.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> VbarResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let size = |key: &str| -> VbarResult<Option<usize>> {
            lookup(key)
                .map(|raw| {
                    parse_size(&raw).ok_or_else(|| VbarError::Config(format!("{key}={raw}")))
                })
                .transpose()
        };

        if let Some(v) = size("VBAR_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = size("VBAR_PHYSICAL_BUDGET")? {
            self.physical_budget = v;
        }
        if let Some(v) = size("VBAR_DEVICE_WATERMARK")? {
            self.device_watermark = v;
        }
        if let Some(v) = size("VBAR_HOST_HEADROOM")? {
            self.host_headroom = v;
        }
        if let Some(level) = lookup("VBAR_LOG") {
            self.log_level = level;
        }
        self.validate()
    }

    /// Check value constraints.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Config`] naming the first offending field.
    pub fn validate(&self) -> VbarResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(VbarError::Config(format!(
                "page_size must be a non-zero power of two, got {}",
                self.page_size
            )));
        }
        if !self.alloc_alignment.is_power_of_two() {
            return Err(VbarError::Config(format!(
                "alloc_alignment must be a power of two, got {}",
                self.alloc_alignment
            )));
        }
        if !self.host_granularity.is_power_of_two() {
            return Err(VbarError::Config(format!(
                "host_granularity must be a power of two, got {}",
                self.host_granularity
            )));
        }
        if self.max_acquire_retries == 0 {
            return Err(VbarError::Config(
                "max_acquire_retries must be at least 1".to_string(),
            ));
        }
        if self.physical_budget != 0 && self.physical_budget < self.page_size {
            return Err(VbarError::Config(format!(
                "physical_budget {} cannot hold a single {} byte page",
                self.physical_budget, self.page_size
            )));
        }
        Ok(())
    }
}

/// Parse `"123"`, `"64K"`, `"32M"`, `"2G"` (case-insensitive, optional `B`/`iB`).
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_uppercase();
    let s = s
        .strip_suffix("IB")
        .or_else(|| s.strip_suffix('B'))
        .unwrap_or(&s);
    let (digits, shift) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 10),
        'M' => (&s[..s.len() - 1], 20),
        'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize << shift)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(usize),
    Text(String),
}

fn de_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(text) => parse_size(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid byte size `{text}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.page_size, 32 * MIB);
        assert_eq!(config.alloc_alignment, 512);
        assert_eq!(config.host_granularity, 2 * MIB);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("32M"), Some(32 * MIB));
        assert_eq!(parse_size("32MiB"), Some(32 * MIB));
        assert_eq!(parse_size(" 2g "), Some(2 << 30));
        assert_eq!(parse_size("4KB"), Some(4096));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_parse_toml_with_suffixes() {
        let config = EngineConfig::parse(
            r#"
            page_size = "64M"
            physical_budget = 1073741824
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.page_size, 64 * MIB);
        assert_eq!(config.physical_budget, 1 << 30);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_acquire_retries, 4);
    }

    #[test]
    fn test_rejects_unknown_and_invalid() {
        assert!(matches!(
            EngineConfig::parse("pagesize = 1"),
            Err(VbarError::Toml(_))
        ));
        assert!(matches!(
            EngineConfig::parse("page_size = 3000"),
            Err(VbarError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::parse("max_acquire_retries = 0"),
            Err(VbarError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device_watermark = \"4G\"").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.device_watermark, 4 << 30);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [("VBAR_PAGE_SIZE", "16M"), ("VBAR_LOG", "trace")]
            .into_iter()
            .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.page_size, 16 * MIB);
        assert_eq!(config.log_level, "trace");

        let bad = |k: &str| (k == "VBAR_PHYSICAL_BUDGET").then(|| "many".to_string());
        assert!(EngineConfig::default().apply_overrides(bad).is_err());
    }
}
