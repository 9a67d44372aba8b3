//! Process-wide settings, read from the environment.
//!
//! | Variable            | Meaning                                          |
//! |---------------------|--------------------------------------------------|
//! | `LMF_SLIB`          | path of the system library image loaded first    |
//! | `LMF_LOG`           | comma separated log categories (`all` for every) |
//! | `LMF_LOG_LEVEL`     | maximum log level (`error` … `trace`)            |
//! | `LMF_SOFT_SEGMENTS` | set to disable hardware descriptor binding       |

use emu_log::Category;
use emu_memory::{Placement, ReservationPolicy};
use log::LevelFilter;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_SYSTEM_LIBRARY: &str = "LMF_SLIB";
pub const ENV_LOG: &str = "LMF_LOG";
pub const ENV_LOG_LEVEL: &str = "LMF_LOG_LEVEL";
pub const ENV_SOFT_SEGMENTS: &str = "LMF_SOFT_SEGMENTS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown log category `{0}`")]
    UnknownCategory(String),
    #[error("invalid log level `{0}`")]
    InvalidLevel(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// System library image, loaded before the main image.
    pub system_library: Option<PathBuf>,
    pub log_categories: Vec<Category>,
    pub log_level: LevelFilter,
    /// Publish segments in the CPU's local descriptor table.
    pub hardware_descriptors: bool,
    pub reservation: ReservationPolicy,
    pub placement: Placement,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_library: None,
            log_categories: Category::DEFAULT.to_vec(),
            log_level: LevelFilter::Debug,
            hardware_descriptors: true,
            reservation: ReservationPolicy::default(),
            placement: Placement::Low32,
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_SYSTEM_LIBRARY).filter(|p| !p.is_empty()) {
            config.system_library = Some(PathBuf::from(path));
        }
        if let Some(list) = lookup(ENV_LOG) {
            config.log_categories = parse_categories(&list)?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.log_level =
                LevelFilter::from_str(&level).map_err(|_| ConfigError::InvalidLevel(level))?;
        }
        if lookup(ENV_SOFT_SEGMENTS).is_some() {
            config = config.with_software_segments();
        }
        Ok(config)
    }

    /// Check segments in software only; segments may live anywhere.
    #[must_use]
    pub fn with_software_segments(mut self) -> Self {
        self.hardware_descriptors = false;
        self.placement = Placement::Anywhere;
        self
    }

    #[must_use]
    pub fn with_reservation(mut self, reservation: ReservationPolicy) -> Self {
        self.reservation = reservation;
        self
    }
}

fn parse_categories(list: &str) -> Result<Vec<Category>, ConfigError> {
    let mut out = Category::DEFAULT.to_vec();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if name == "all" {
            return Ok(Category::ALL.to_vec());
        }
        let category =
            Category::by_name(name).ok_or_else(|| ConfigError::UnknownCategory(name.to_owned()))?;
        if !out.contains(&category) {
            out.push(category);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let c = Config::from_lookup(lookup(&[])).unwrap();
        assert!(c.system_library.is_none());
        assert_eq!(c.log_categories, vec![Category::Unhandled]);
        assert!(c.hardware_descriptors);
        assert_eq!(c.placement, Placement::Low32);
    }

    #[test]
    fn reads_every_variable() {
        let c = Config::from_lookup(lookup(&[
            (ENV_SYSTEM_LIBRARY, "/opt/slib"),
            (ENV_LOG, "msg, loader"),
            (ENV_LOG_LEVEL, "trace"),
            (ENV_SOFT_SEGMENTS, "1"),
        ]))
        .unwrap();
        assert_eq!(c.system_library, Some(PathBuf::from("/opt/slib")));
        assert_eq!(
            c.log_categories,
            vec![Category::Unhandled, Category::Msg, Category::Loader]
        );
        assert_eq!(c.log_level, LevelFilter::Trace);
        assert!(!c.hardware_descriptors);
        assert_eq!(c.placement, Placement::Anywhere);
    }

    #[test]
    fn all_enables_everything() {
        let c = Config::from_lookup(lookup(&[(ENV_LOG, "all")])).unwrap();
        assert_eq!(c.log_categories.len(), Category::ALL.len());
    }

    #[test]
    fn rejects_unknown_names() {
        assert_eq!(
            Config::from_lookup(lookup(&[(ENV_LOG, "msg,bogus")])).err(),
            Some(ConfigError::UnknownCategory("bogus".into()))
        );
        assert_eq!(
            Config::from_lookup(lookup(&[(ENV_LOG_LEVEL, "loud")])).err(),
            Some(ConfigError::InvalidLevel("loud".into()))
        );
    }
}
