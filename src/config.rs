//! Migration configuration.
//!
//! Configuration is a flat `key=value` properties file (see
//! `config.properties.example` for every key), with a documented set of
//! environment variables that override file values when non-empty. Missing or
//! invalid configuration is fatal at startup.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use mysql_async::{Opts, OptsBuilder};

/// Connection settings for one MySQL endpoint.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

// Custom Debug keeps passwords out of logs.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl DatabaseConfig {
    /// Driver options for this endpoint, with the database preselected.
    pub fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .db_name(Some(self.database.clone()))
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .into()
    }

    /// Driver options without a preselected database, for connections that
    /// query server-level state (binlog status, information_schema).
    pub fn opts_no_db(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .into()
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    pub batch_size: usize,
    pub drop_tables: bool,
    pub create_tables: bool,
    pub migrate_data: bool,
    pub continue_on_error: bool,
    pub enable_resume: bool,
    pub enable_incremental: bool,
    pub included_databases: HashSet<String>,
    pub included_tables: HashSet<String>,
    pub checkpoint_db_path: String,
    pub sql_directory: String,
    pub scan_interval_ms: u64,
}

impl MigrationConfig {
    /// Load from a properties file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut props = parse_properties(&content);
        apply_env_overrides(&mut props);
        Self::from_props(&props)
    }

    fn from_props(props: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| props.get(key).map(String::as_str);
        let required = |key: &str| {
            get(key)
                .map(str::to_string)
                .with_context(|| format!("missing required config key: {key}"))
        };
        let parsed = |key: &str, default: &str| -> Result<u64> {
            let raw = get(key).unwrap_or(default);
            raw.parse()
                .with_context(|| format!("invalid value for {key}: {raw}"))
        };
        let flag = |key: &str, default: bool| -> Result<bool> {
            match get(key) {
                None => Ok(default),
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid value for {key}: {raw}")),
            }
        };

        let source = DatabaseConfig {
            host: get("source.db.host").unwrap_or("localhost").to_string(),
            port: parsed("source.db.port", "3306")? as u16,
            database: required("source.db.database")?,
            username: required("source.db.username")?,
            password: get("source.db.password").unwrap_or("").to_string(),
        };
        let target = DatabaseConfig {
            host: get("target.db.host").unwrap_or("localhost").to_string(),
            port: parsed("target.db.port", "3306")? as u16,
            database: required("target.db.database")?,
            username: required("target.db.username")?,
            password: get("target.db.password").unwrap_or("").to_string(),
        };

        Ok(Self {
            source,
            target,
            batch_size: parsed("migration.batch.size", "1000")? as usize,
            drop_tables: flag("migration.drop.tables", false)?,
            create_tables: flag("migration.create.tables", true)?,
            migrate_data: flag("migration.migrate.data", true)?,
            continue_on_error: flag("migration.continue.on.error", false)?,
            enable_resume: flag("migration.enable.resume", true)?,
            enable_incremental: flag("migration.enable.incremental", false)?,
            included_databases: parse_string_set(get("migration.included.databases")),
            included_tables: parse_string_set(get("migration.included.tables")),
            checkpoint_db_path: get("migration.checkpoint.db.path")
                .unwrap_or("./checkpoint/checkpoint.db")
                .to_string(),
            sql_directory: get("sql.directory").unwrap_or("./sql_output").to_string(),
            scan_interval_ms: parsed("sql.scan.interval.ms", "5000")?,
        })
    }
}

/// Parse `key=value` lines; `#` and `!` comments and blank lines ignored.
fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

/// Comma-separated set; empty input means "all".
fn parse_string_set(value: Option<&str>) -> HashSet<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Environment variables that override file configuration when set and
/// non-empty.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("target.db.host", "TARGET_HOST"),
    ("target.db.port", "TARGET_PORT"),
    ("target.db.database", "TARGET_DATABASE"),
    ("target.db.username", "TARGET_USERNAME"),
    ("target.db.password", "TARGET_PASSWORD"),
    ("sql.directory", "SQL_DIRECTORY"),
    ("migration.checkpoint.db.path", "CHECKPOINT_DB_PATH"),
    ("sql.scan.interval.ms", "SQL_SCAN_INTERVAL_MS"),
];

fn apply_env_overrides(props: &mut HashMap<String, String>) {
    for (key, env_key) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(env_key) {
            if !value.is_empty() {
                props.insert((*key).to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_props() -> String {
        [
            "# pipeline endpoints",
            "source.db.host=src.example.com",
            "source.db.port=3307",
            "source.db.database=shop",
            "source.db.username=repl",
            "source.db.password=secret",
            "target.db.database=shop",
            "target.db.username=writer",
        ]
        .join("\n")
    }

    fn config_from(content: &str) -> Result<MigrationConfig> {
        MigrationConfig::from_props(&parse_properties(content))
    }

    #[test]
    fn defaults_applied() {
        let config = config_from(&base_props()).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert!(!config.drop_tables);
        assert!(config.create_tables);
        assert!(config.migrate_data);
        assert!(!config.continue_on_error);
        assert!(config.enable_resume);
        assert!(!config.enable_incremental);
        assert!(config.included_databases.is_empty());
        assert_eq!(config.scan_interval_ms, 5000);
        assert_eq!(config.sql_directory, "./sql_output");
        assert_eq!(config.target.host, "localhost");
        assert_eq!(config.target.port, 3306);
    }

    #[test]
    fn explicit_values_win() {
        let content = format!(
            "{}\nmigration.batch.size=250\nmigration.drop.tables=true\nmigration.included.tables=users, shop.orders\n",
            base_props()
        );
        let config = config_from(&content).unwrap();
        assert_eq!(config.batch_size, 250);
        assert!(config.drop_tables);
        assert!(config.included_tables.contains("users"));
        assert!(config.included_tables.contains("shop.orders"));
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let err = config_from("source.db.host=localhost").unwrap_err();
        assert!(err.to_string().contains("db.database"));
    }

    #[test]
    fn invalid_number_is_an_error() {
        let content = format!("{}\nmigration.batch.size=lots\n", base_props());
        let err = config_from(&content).unwrap_err();
        assert!(err.to_string().contains("migration.batch.size"));
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let props = parse_properties("# comment\n\n! also a comment\nkey=value\n");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn debug_redacts_password() {
        let config = config_from(&base_props()).unwrap();
        let debug = format!("{:?}", config.source);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret"));
    }
}
