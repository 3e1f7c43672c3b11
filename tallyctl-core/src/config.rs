use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::coordinator::TxSettings;
use crate::model::BudgetRaise;
use crate::store::IsolationLevel;

const REDACTED: &str = "***";

/// Configuration for tallyctl, read from ~/.tallyctl/config.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub database: DatabaseConfig,
    pub transactions: TransactionConfig,
    pub budget: BudgetConfig,
}

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/tallyctl".to_string(),
            max_connections: 10,
            min_connections: 0,
            max_lifetime_secs: 300,
            idle_timeout_secs: 180,
            acquire_timeout_ms: 5_000,
            ping_timeout_ms: 1_000,
        }
    }
}

impl DatabaseConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Unit of work bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub isolation: IsolationLevel,
    pub round_trip_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        let settings = TxSettings::default();
        Self {
            isolation: settings.isolation,
            round_trip_timeout_ms: settings.round_trip_timeout.as_millis() as u64,
        }
    }
}

impl TransactionConfig {
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }
}

/// Defaults for `raise-budgets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub raise_percent: i64,
    pub since: NaiveDate,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            raise_percent: 20,
            since: NaiveDate::from_ymd_opt(1991, 1, 1).unwrap_or_default(),
        }
    }
}

impl BudgetConfig {
    pub fn raise(&self) -> Result<BudgetRaise> {
        BudgetRaise::new(self.since, self.raise_percent).context("Invalid [budget] section")
    }
}

impl TallyConfig {
    /// Coordinator settings. The acquire bound is the pool's, so waiting for
    /// a connection is governed by `[database].acquire_timeout_ms` alone.
    pub fn tx_settings(&self) -> TxSettings {
        TxSettings {
            isolation: self.transactions.isolation,
            acquire_timeout: self.database.acquire_timeout(),
            round_trip_timeout: self.transactions.round_trip_timeout(),
        }
    }

    /// Load config from ~/.tallyctl/config.toml.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .context(format!("Failed to read config file: {:?}", config_path))?;
            toml::from_str(&content).context("Failed to parse config file (invalid TOML)")?
        } else {
            Self::default()
        };

        config.expand_variables();

        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database.url = url;
            }
        }

        Ok(config)
    }

    /// Get config file path: ~/.tallyctl/config.toml
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tallyctl/config.toml")
    }

    /// Expand ${VAR} references in the database url
    fn expand_variables(&mut self) {
        let vars: HashMap<String, String> = env::vars().collect();
        self.database.url = Self::expand_string(&self.database.url, &vars);
    }

    fn expand_string(s: &str, vars: &HashMap<String, String>) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    result.push_str(vars.get(key).map(String::as_str).unwrap_or_default());
                    rest = &after[end + 1..];
                }
                None => {
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// Same as the url but with any password replaced, for display.
    ///
    /// Covers the userinfo password and a `password` query parameter. A url
    /// that does not parse is shown as its scheme only.
    pub fn redacted_url(&self) -> String {
        let raw = &self.database.url;
        let Ok(mut url) = Url::parse(raw) else {
            return match raw.split_once("://") {
                Some((scheme, _)) => format!("{}://{}", scheme, REDACTED),
                None => REDACTED.to_string(),
            };
        };

        if url.password().is_some() {
            // Only fails for urls without a host, which cannot carry a password
            let _ = url.set_password(Some(REDACTED));
        }

        if url.query_pairs().any(|(key, _)| key == "password") {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(key, value)| {
                    let value = if key == "password" {
                        REDACTED.to_string()
                    } else {
                        value.into_owned()
                    };
                    (key.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }

        url.to_string()
    }

    /// Save config to ~/.tallyctl/config.toml
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(config_path, toml_str)
            .context(format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = TallyConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.max_lifetime(), Duration::from_secs(300));
        assert_eq!(config.transactions.isolation, IsolationLevel::Serializable);
        assert_eq!(config.budget.raise_percent, 20);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[database]
max_connections = 4

[transactions]
isolation = "repeatable_read"
round_trip_timeout_ms = 250
"#,
        )
        .unwrap();

        let config = TallyConfig::load_from(&path).unwrap();
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.idle_timeout_secs, 180);
        let settings = config.tx_settings();
        assert_eq!(settings.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(settings.round_trip_timeout, Duration::from_millis(250));
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn pool_acquire_bound_drives_the_coordinator() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[database]\nacquire_timeout_ms = 750\n").unwrap();

        let config = TallyConfig::load_from(&path).unwrap();
        assert_eq!(config.database.acquire_timeout(), Duration::from_millis(750));
        assert_eq!(config.tx_settings().acquire_timeout, Duration::from_millis(750));
        assert!(!toml::to_string(&config.transactions)
            .unwrap()
            .contains("acquire_timeout_ms"));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[database\nurl = ").unwrap();
        assert!(TallyConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = TallyConfig::default();
        config.budget.raise_percent = 5;
        config.save_to(&path).unwrap();

        let loaded = TallyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.budget.raise_percent, 5);
    }

    #[test]
    fn variables_expand_and_unknown_ones_vanish() {
        let mut vars = HashMap::new();
        vars.insert("PGUSER".to_string(), "tally".to_string());
        assert_eq!(
            TallyConfig::expand_string("postgres://${PGUSER}@db/${MISSING}x", &vars),
            "postgres://tally@db/x"
        );
        assert_eq!(TallyConfig::expand_string("a${b", &vars), "a${b");
    }

    #[test]
    fn password_is_redacted() {
        let mut config = TallyConfig::default();
        config.database.url = "postgres://tally:s3cret@db:5432/tally".into();
        assert_eq!(config.redacted_url(), "postgres://tally:***@db:5432/tally");
        config.database.url = "postgres://db/tally".into();
        assert_eq!(config.redacted_url(), "postgres://db/tally");
    }

    #[test]
    fn password_with_slash_is_not_shown() {
        let mut config = TallyConfig::default();
        config.database.url = "postgres://tally:pa/ss@db:5432/tally".into();
        let shown = config.redacted_url();
        assert!(!shown.contains("pa/ss"), "{}", shown);
        assert!(!shown.contains("ss@db"), "{}", shown);
        assert_eq!(shown, "postgres://***");

        config.database.url = "postgres://tally:pa%2Fss@db:5432/tally".into();
        assert_eq!(config.redacted_url(), "postgres://tally:***@db:5432/tally");
    }

    #[test]
    fn password_query_parameter_is_redacted() {
        let mut config = TallyConfig::default();
        config.database.url = "postgres://db/tally?user=tally&password=s3cret".into();
        let shown = config.redacted_url();
        assert!(!shown.contains("s3cret"), "{}", shown);
        assert_eq!(shown, "postgres://db/tally?user=tally&password=***");
    }

    #[test]
    fn unparseable_url_shows_scheme_only() {
        let mut config = TallyConfig::default();
        config.database.url = "not a url:hunter2".into();
        assert_eq!(config.redacted_url(), "***");
    }

    #[test]
    fn budget_section_validates() {
        let budget = BudgetConfig {
            raise_percent: -5,
            ..BudgetConfig::default()
        };
        assert!(budget.raise().is_err());
        assert_eq!(BudgetConfig::default().raise().unwrap().percent(), 20);
    }
}
