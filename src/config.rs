//! Commander configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CommanderError, Result};

/// Connection settings for a [`Commander`](crate::Commander).
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct CommanderConfig {
    /// Provider-specific connection string (a file path for SQLite)
    pub connection_string: String,
    /// Database to switch to after connecting, where the backend has several
    pub database: Option<String>,
    /// Default timeout applied to every command; zero means none
    #[serde(with = "duration_secs")]
    pub command_timeout: Option<Duration>,
}

impl CommanderConfig {
    /// Create a new config for `connection_string`
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            database: None,
            command_timeout: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(CommanderError::MissingConfiguration("connection_string"));
        }
        if matches!(&self.database, Some(db) if db.trim().is_empty()) {
            return Err(CommanderError::MissingConfiguration("database"));
        }
        Ok(())
    }

    /// Effective timeout: a non-zero `override_timeout` wins, then a non-zero default.
    pub fn resolve_timeout(&self, override_timeout: Option<Duration>) -> Option<Duration> {
        override_timeout
            .filter(|t| !t.is_zero())
            .or_else(|| self.command_timeout.filter(|t| !t.is_zero()))
    }
}

/// `command_timeout` is written in whole or fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!(
                "invalid command_timeout: {}",
                s
            ))),
            None => Ok(None),
        }
    }
}
