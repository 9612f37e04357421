use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::driver::Credential;
use crate::error::SqlPipesError;
use crate::types::Role;

pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_CHARSET: &str = "utf8mb4";
pub const DEFAULT_COLLATION: &str = "utf8mb4_unicode_ci";

/// Settings for a [`crate::Connection`].
///
/// Top-level connection fields apply to both roles; `write` and `read` override them per role.
/// Durations are given in (fractional) seconds when deserialized.
///
/// ```rust
/// use sql_pipes::prelude::*;
///
/// let config = PipesConfig::from_json(r#"{
///     "host": ["10.0.0.1", "10.0.0.2"],
///     "username": "app",
///     "password": "secret",
///     "database": "shop",
///     "num_connections": 4,
///     "idle_timeout": 15,
///     "write": { "host": "10.0.0.1", "num_connections": 2 }
/// }"#)?;
/// assert_eq!(config.credentials(Role::Read).len(), 4);
/// assert_eq!(config.credentials(Role::Write).len(), 2);
/// # Ok::<(), SqlPipesError>(())
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipesConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub host: Vec<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub charset: String,
    pub collation: String,
    /// Pipes per role.
    pub num_connections: usize,
    /// Idle pipes per role that are opened at startup and never recycled.
    #[serde(alias = "min_idle")]
    pub min_num_idle_connections: usize,
    #[serde(deserialize_with = "seconds")]
    pub idle_timeout: Duration,
    /// Capacity of the waiting list shared by both roles.
    pub waiting_list_size: usize,
    /// Default statement timeout; zero means unlimited.
    #[serde(deserialize_with = "seconds")]
    pub max_running_seconds: Duration,
    pub write: RoleOverrides,
    pub read: RoleOverrides,
}

impl Default for PipesConfig {
    fn default() -> Self {
        Self {
            host: Vec::new(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            charset: DEFAULT_CHARSET.to_string(),
            collation: DEFAULT_COLLATION.to_string(),
            num_connections: 1,
            min_num_idle_connections: 1,
            idle_timeout: Duration::from_secs(30),
            waiting_list_size: 100,
            max_running_seconds: Duration::ZERO,
            write: RoleOverrides::default(),
            read: RoleOverrides::default(),
        }
    }
}

/// Per-role connection settings. Unset fields fall back to the top-level value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleOverrides {
    #[serde(deserialize_with = "one_or_many_opt")]
    pub host: Option<Vec<String>>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub num_connections: Option<usize>,
}

impl PipesConfig {
    #[must_use]
    pub fn builder<S: Into<String>>(host: S) -> PipesConfigBuilder {
        PipesConfigBuilder::new(host)
    }

    /// Parse a JSON document and validate it.
    ///
    /// # Errors
    /// Returns [`SqlPipesError::Config`] if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self, SqlPipesError> {
        let config: PipesConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`SqlPipesError::Config`] when a role has no host or no connections.
    pub fn validate(&self) -> Result<(), SqlPipesError> {
        for role in Role::ALL {
            let overrides = self.overrides(role);
            let hosts = overrides.host.as_ref().unwrap_or(&self.host);
            if hosts.is_empty() || hosts.iter().any(String::is_empty) {
                return Err(SqlPipesError::Config(format!(
                    "no host configured for {role} pipes"
                )));
            }
            if overrides.num_connections.unwrap_or(self.num_connections) == 0 {
                return Err(SqlPipesError::Config(format!(
                    "num_connections for {role} pipes must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// One credential per pipe slot of `role`, assigned round-robin over the role's hosts.
    #[must_use]
    pub fn credentials(&self, role: Role) -> Vec<Credential> {
        let overrides = self.overrides(role);
        let hosts = overrides.host.as_ref().unwrap_or(&self.host);
        if hosts.is_empty() {
            return Vec::new();
        }
        let count = overrides.num_connections.unwrap_or(self.num_connections);
        (0..count)
            .map(|slot| Credential {
                host: hosts[slot % hosts.len()].clone(),
                port: overrides.port.unwrap_or(self.port),
                username: pick(&overrides.username, &self.username),
                password: pick(&overrides.password, &self.password),
                database: pick(&overrides.database, &self.database),
                charset: pick(&overrides.charset, &self.charset),
                collation: pick(&overrides.collation, &self.collation),
            })
            .collect()
    }

    fn overrides(&self, role: Role) -> &RoleOverrides {
        match role {
            Role::Write => &self.write,
            Role::Read => &self.read,
        }
    }
}

fn pick(overridden: &Option<String>, base: &str) -> String {
    overridden.clone().unwrap_or_else(|| base.to_string())
}

/// Fluent builder for [`PipesConfig`].
#[derive(Debug, Clone)]
pub struct PipesConfigBuilder {
    config: PipesConfig,
}

impl PipesConfigBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            config: PipesConfig {
                host: vec![host.into()],
                ..PipesConfig::default()
            },
        }
    }

    #[must_use]
    pub fn add_host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host.push(host.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn login<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    #[must_use]
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.config.database = database.into();
        self
    }

    #[must_use]
    pub fn charset<C: Into<String>, L: Into<String>>(mut self, charset: C, collation: L) -> Self {
        self.config.charset = charset.into();
        self.config.collation = collation.into();
        self
    }

    #[must_use]
    pub fn num_connections(mut self, num_connections: usize) -> Self {
        self.config.num_connections = num_connections;
        self
    }

    #[must_use]
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.config.min_num_idle_connections = min_idle;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn waiting_list_size(mut self, waiting_list_size: usize) -> Self {
        self.config.waiting_list_size = waiting_list_size;
        self
    }

    #[must_use]
    pub fn max_running(mut self, max_running: Duration) -> Self {
        self.config.max_running_seconds = max_running;
        self
    }

    #[must_use]
    pub fn role(mut self, role: Role, overrides: RoleOverrides) -> Self {
        match role {
            Role::Write => self.config.write = overrides,
            Role::Read => self.config.read = overrides,
        }
        self
    }

    #[must_use]
    pub fn finish(self) -> PipesConfig {
        self.config
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(host) => vec![host],
            OneOrMany::Many(hosts) => hosts,
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    OneOrMany::deserialize(deserializer).map(Into::into)
}

fn one_or_many_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Option::<OneOrMany>::deserialize(deserializer).map(|hosts| hosts.map(Into::into))
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
