//! Parsing of libpq-style connection descriptors.
//!
//! Subscriptions store the publisher they stream from as a string of
//! whitespace separated `key=value` tokens (`pg_subscription.subconninfo`).
//! Parsing is lenient: the descriptors come from remote servers, so a
//! malformed token is skipped instead of failing the whole descriptor.

use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Connection parameters for one host.
///
/// Every field is optional: [`ConnectionInfo::parse`] only fills in what the
/// descriptor actually contains. Defaulting is done by the caller through
/// [`ConnectionInfo::or_defaults`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
}

impl ConnectionInfo {
    pub fn parse(descriptor: &str) -> Self {
        let mut info = ConnectionInfo::default();

        for token in descriptor.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                debug!("Skipping malformed conninfo token without '='");
                continue;
            };

            let value = unquote(value);
            if value.is_empty() {
                continue;
            }

            match key {
                "host" | "hostaddr" => {
                    if key == "host" || info.host.is_none() {
                        info.host = Some(value.to_string());
                    }
                }
                "user" => info.user = Some(value.to_string()),
                "password" => info.password = Some(value.to_string()),
                "port" => match value.parse::<u16>() {
                    Ok(port) => info.port = Some(port),
                    Err(_) => debug!("Skipping unparseable port '{}'", value),
                },
                "dbname" => info.database = Some(value.to_string()),
                _ => {}
            }
        }

        info
    }

    /// Fills unset fields from `defaults`.
    pub fn or_defaults(mut self, defaults: &ConnectionInfo) -> Self {
        if self.host.is_none() {
            self.host = defaults.host.clone();
        }
        if self.user.is_none() {
            self.user = defaults.user.clone();
        }
        if self.password.is_none() {
            self.password = defaults.password.clone();
        }
        if self.port.is_none() {
            self.port = defaults.port;
        }
        if self.database.is_none() {
            self.database = defaults.database.clone();
        }
        self
    }

    /// Same credentials, pointed at another host.
    pub fn for_host(&self, host: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            ..self.clone()
        }
    }

    pub fn to_pg_config(&self, connect_timeout: Duration) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(self.host.as_deref().unwrap_or("localhost"))
            .port(self.port.unwrap_or(5432))
            .user(self.user.as_deref().unwrap_or("postgres"))
            .dbname(self.database.as_deref().unwrap_or("postgres"))
            .application_name("pg-reptool")
            .connect_timeout(connect_timeout);
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}
