use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use progeny_process::{AgePolicy, SelectorMode};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::port_alloc::PortRange;
use crate::process_manager::{RegistryOptions, TeardownPolicy};
use crate::process_manager_support::{env_bool, env_string, env_u64};
use crate::recipes::DEFAULT_EXCLUDE_PATTERN;
use crate::templates::LaunchSpec;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://progeny-processes.db?mode=rwc";

/// A worker spun when the agent starts.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    pub identifier: String,
    #[serde(flatten)]
    pub launch: LaunchSpec,
    #[serde(default)]
    pub uniquify: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgenyConfig {
    pub database_url: String,
    pub port_range: Vec<i64>,
    pub recipe_dir: Option<PathBuf>,
    pub prebaked_dir: Option<PathBuf>,
    pub recipe_exclude_pattern: Option<String>,
    pub base_recipes: Vec<String>,
    pub scheduled_cleaning_interval_sec: Option<u64>,
    pub scheduled_cleaning_timeout_sec: Option<u64>,
    pub age_policy: AgePolicy,
    pub selector_mode: SelectorMode,
    pub worker_timeout_sec: Option<u64>,
    pub terminate_grace_ms: u64,
    pub startup_check_ms: u64,
    pub ready_timeout_ms: Option<u64>,
    pub launcher: Vec<String>,
    pub session_env_var: String,
    pub config_env_var: String,
    pub uniquify_sessions: bool,
    pub teardown: TeardownPolicy,
    pub instances: Vec<InstanceSpec>,
}

impl Default for ProgenyConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            port_range: vec![8080, 8090],
            recipe_dir: None,
            prebaked_dir: None,
            recipe_exclude_pattern: Some(DEFAULT_EXCLUDE_PATTERN.to_string()),
            base_recipes: Vec::new(),
            scheduled_cleaning_interval_sec: None,
            scheduled_cleaning_timeout_sec: None,
            age_policy: AgePolicy::Created,
            selector_mode: SelectorMode::Any,
            worker_timeout_sec: None,
            terminate_grace_ms: 1000,
            startup_check_ms: 500,
            ready_timeout_ms: None,
            launcher: vec!["prodigy".to_string()],
            session_env_var: "PRODIGY_ALLOWED_SESSIONS".to_string(),
            config_env_var: "PRODIGY_CONFIG_OVERRIDES".to_string(),
            uniquify_sessions: false,
            teardown: TeardownPolicy::Drop,
            instances: Vec::new(),
        }
    }
}

fn parse_choice<T: for<'de> Deserialize<'de>>(name: &str, raw: &str) -> Result<T> {
    serde_yaml::from_str(raw.trim()).map_err(|e| Error::Config(format!("{name}={raw}: {e}")))
}

impl ProgenyConfig {
    /// Read the YAML file (if any), then apply `PROGENY_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_yaml(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document means "all defaults".
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("PROGENY_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env_string("PROGENY_PORT_RANGE") {
            self.port_range = v
                .split([',', '-', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<i64>()
                        .map_err(|e| Error::InvalidRange(format!("PROGENY_PORT_RANGE={v}: {e}")))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(v) = env_string("PROGENY_RECIPE_DIR") {
            self.recipe_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("PROGENY_PREBAKED_DIR") {
            self.prebaked_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("PROGENY_BASE_RECIPES") {
            self.base_recipes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env_u64("PROGENY_CLEANING_INTERVAL_SEC") {
            self.scheduled_cleaning_interval_sec = Some(v.clamp(1, 86_400));
        }
        if let Some(v) = env_u64("PROGENY_CLEANING_TIMEOUT_SEC") {
            self.scheduled_cleaning_timeout_sec = Some(v);
        }
        if let Some(v) = env_u64("PROGENY_WORKER_TIMEOUT_SEC") {
            self.worker_timeout_sec = Some(v);
        }
        if let Some(v) = env_u64("PROGENY_TERMINATE_GRACE_MS") {
            self.terminate_grace_ms = v.clamp(10, 60_000);
        }
        if let Some(v) = env_u64("PROGENY_STARTUP_CHECK_MS") {
            self.startup_check_ms = v.min(60_000);
        }
        if let Some(v) = env_u64("PROGENY_READY_TIMEOUT_MS") {
            self.ready_timeout_ms = Some(v.clamp(100, 300_000));
        }
        if let Some(v) = env_bool("PROGENY_UNIQUIFY_SESSIONS") {
            self.uniquify_sessions = v;
        }
        if let Some(v) = env_string("PROGENY_AGE_POLICY") {
            self.age_policy = parse_choice("PROGENY_AGE_POLICY", &v)?;
        }
        if let Some(v) = env_string("PROGENY_SELECTOR_MODE") {
            self.selector_mode = parse_choice("PROGENY_SELECTOR_MODE", &v)?;
        }
        if let Some(v) = env_string("PROGENY_TEARDOWN") {
            self.teardown = parse_choice("PROGENY_TEARDOWN", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.port_range()?;
        if self.launcher.is_empty() {
            return Err(Error::Config("launcher must not be empty".to_string()));
        }
        if self.session_env_var.is_empty() || self.config_env_var.is_empty() {
            return Err(Error::Config("environment variable names must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn port_range(&self) -> Result<PortRange> {
        PortRange::from_slice(&self.port_range)
    }

    /// Interval and timeout, when both are set.
    pub fn scheduled_cleaning(&self) -> Option<(Duration, Duration)> {
        match (
            self.scheduled_cleaning_interval_sec,
            self.scheduled_cleaning_timeout_sec,
        ) {
            (Some(interval), Some(timeout)) => Some((
                Duration::from_secs(interval.max(1)),
                Duration::from_secs(timeout),
            )),
            _ => None,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            selector_mode: self.selector_mode,
            age_policy: self.age_policy,
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            teardown: self.teardown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_defaults() {
        let cfg = ProgenyConfig::from_yaml("").unwrap();
        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(cfg.port_range().unwrap(), PortRange::new(8080, 8090).unwrap());
        assert_eq!(cfg.launcher, vec!["prodigy"]);
        assert!(cfg.scheduled_cleaning().is_none());
        assert_eq!(cfg.registry_options().terminate_grace, Duration::from_secs(1));
    }

    #[test]
    fn yaml_fields_and_instances() {
        let cfg = ProgenyConfig::from_yaml(
            r#"
port_range: [9100, 9110]
scheduled_cleaning_interval_sec: 60
scheduled_cleaning_timeout_sec: 3600
age_policy: expiry
selector_mode: all
teardown: retain
instances:
  - identifier: alice
    recipe: textcat.manual
    recipe_args: [news, en]
    recipe_kwargs: {label: "POS,NEG"}
    uniquify: true
  - identifier: bob
    prebaked: news
    config: {show_stats: true}
"#,
        )
        .unwrap();
        assert_eq!(cfg.port_range().unwrap().start(), 9100);
        assert_eq!(
            cfg.scheduled_cleaning(),
            Some((Duration::from_secs(60), Duration::from_secs(3600)))
        );
        assert_eq!(cfg.age_policy, AgePolicy::Expiry);
        assert_eq!(cfg.selector_mode, SelectorMode::All);
        assert_eq!(cfg.teardown, TeardownPolicy::Retain);

        assert_eq!(cfg.instances.len(), 2);
        let alice = &cfg.instances[0];
        assert_eq!(alice.launch.spec.recipe.as_deref(), Some("textcat.manual"));
        assert_eq!(alice.uniquify, Some(true));
        let bob = &cfg.instances[1];
        assert_eq!(bob.launch.prebaked.as_deref(), Some("news"));
        assert!(bob.launch.config.is_some());
        assert_eq!(bob.uniquify, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ProgenyConfig::from_yaml("port_rnage: [1, 3]").is_err());
    }

    #[test]
    fn bad_port_range_fails_validation() {
        let cfg = ProgenyConfig::from_yaml("port_range: [9000]").unwrap();
        assert!(matches!(cfg.validate(), Err(Error::InvalidRange(_))));
    }
}
