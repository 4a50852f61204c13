//! Connection configuration.
//!
//! [`PqConfig`] collects the usual libpq connection keywords and renders
//! them as a conninfo string. It deserializes with serde, so it can live in
//! an application's config file, and it can be read from the `PQKIT_DSN`
//! environment variable.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use pqkit_core::{ConfigError, Error, Result};
use serde::{Deserialize, Deserializer};

/// Environment variable read by [`PqConfig::from_env`].
pub const DSN_ENV: &str = "PQKIT_DSN";

/// libpq `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    /// Try SSL, fall back to plain if the server refuses
    #[default]
    Prefer,
    Require,
    /// Require SSL and verify the server certificate
    VerifyCa,
    /// Require SSL and verify the certificate matches the host name
    VerifyFull,
}

impl SslMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull
        )
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(config_error(format!("invalid sslmode '{}'", other))),
        }
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PqConfig {
    /// Host name, IP address or socket directory; empty lets libpq decide
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Password (optional for trust and peer auth)
    pub password: Option<String>,
    pub dbname: String,
    /// Application name (visible in pg_stat_activity)
    pub application_name: Option<String>,
    /// Connection timeout in whole seconds; zero waits forever
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,
    pub sslmode: SslMode,
    /// Any other conninfo keywords, passed through verbatim
    pub options: BTreeMap<String, String>,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            user: String::new(),
            password: None,
            dbname: String::new(),
            application_name: None,
            connect_timeout: Duration::ZERO,
            sslmode: SslMode::default(),
            options: BTreeMap::new(),
        }
    }
}

impl PqConfig {
    /// Create a new configuration with the given connection string components.
    pub fn new(host: impl Into<String>, user: impl Into<String>, dbname: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            dbname: dbname.into(),
            ..Default::default()
        }
    }

    /// Read a keyword/value conninfo string from `PQKIT_DSN`.
    pub fn from_env() -> Result<Self> {
        let dsn = std::env::var(DSN_ENV)
            .map_err(|e| config_error(format!("{} is not usable: {}", DSN_ENV, e)))?;
        dsn.parse()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connection timeout. Sub-second parts are dropped.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.sslmode = mode;
        self
    }

    /// Set an additional conninfo keyword.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Render as a libpq keyword/value conninfo string. Every value is
    /// single-quoted with `\` and `'` escaped.
    pub fn to_conninfo(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if !self.host.is_empty() {
            pairs.push(("host", self.host.clone()));
        }
        pairs.push(("port", self.port.to_string()));
        if !self.user.is_empty() {
            pairs.push(("user", self.user.clone()));
        }
        if let Some(password) = &self.password {
            pairs.push(("password", password.clone()));
        }
        if !self.dbname.is_empty() {
            pairs.push(("dbname", self.dbname.clone()));
        }
        if let Some(name) = &self.application_name {
            pairs.push(("application_name", name.clone()));
        }
        if !self.connect_timeout.is_zero() {
            pairs.push(("connect_timeout", self.connect_timeout.as_secs().to_string()));
        }
        pairs.push(("sslmode", self.sslmode.as_str().to_string()));
        for (k, v) in &self.options {
            pairs.push((k.as_str(), v.clone()));
        }

        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_value(v)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "host" => self.host = value,
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| config_error(format!("invalid port '{}'", value)))?;
            }
            "user" => self.user = value,
            "password" => self.password = Some(value),
            "dbname" => self.dbname = value,
            "application_name" => self.application_name = Some(value),
            "connect_timeout" => {
                let secs = value
                    .parse()
                    .map_err(|_| config_error(format!("invalid connect_timeout '{}'", value)))?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            "sslmode" => self.sslmode = value.parse()?,
            _ => {
                self.options.insert(key.to_string(), value);
            }
        }
        Ok(())
    }
}

fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

impl FromStr for PqConfig {
    type Err = Error;

    /// Parse a keyword/value conninfo string. URIs are not accepted here;
    /// hand those to `connect_str` unchanged.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            return Err(config_error(
                "connection URIs cannot be parsed into PqConfig; pass them to connect_str",
            ));
        }

        let mut config = PqConfig::default();
        let mut chars = trimmed.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                key.push(c);
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next() != Some('=') {
                return Err(config_error(format!("missing \"=\" after \"{}\"", key)));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => value.push(c),
                            None => return Err(config_error("unterminated quoted string")),
                        },
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => return Err(config_error("unterminated quoted string")),
                    }
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    } else {
                        value.push(c);
                    }
                }
            }
            config.set(&key, value)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = PqConfig::new("localhost", "postgres", "testdb")
            .port(5433)
            .password("secret")
            .application_name("myapp")
            .connect_timeout(Duration::from_secs(10))
            .sslmode(SslMode::Require)
            .option("options", "-c search_path=app");

        assert_eq!(config.port, 5433);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.sslmode.is_required());
        assert_eq!(
            config.to_conninfo(),
            "host='localhost' port='5433' user='postgres' password='secret' dbname='testdb' \
             application_name='myapp' connect_timeout='10' sslmode='require' \
             options='-c search_path=app'"
        );
    }

    #[test]
    fn test_conninfo_quoting() {
        let config = PqConfig::default().password(r"it's a \secret");
        assert_eq!(
            config.to_conninfo(),
            r"port='5432' password='it\'s a \\secret' sslmode='prefer'"
        );
    }

    #[test]
    fn test_parse_conninfo() {
        let config: PqConfig = "host=db.internal port = 6432 dbname='my db' password='a\\'b' \
                                target_session_attrs=read-write"
            .parse()
            .unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6432);
        assert_eq!(config.dbname, "my db");
        assert_eq!(config.password.as_deref(), Some("a'b"));
        assert_eq!(
            config.options.get("target_session_attrs").map(String::as_str),
            Some("read-write")
        );

        let reparsed: PqConfig = config.to_conninfo().parse().unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("host".parse::<PqConfig>(), Err(Error::Config(_))));
        assert!(matches!("port=abc".parse::<PqConfig>(), Err(Error::Config(_))));
        assert!(matches!("sslmode=maybe".parse::<PqConfig>(), Err(Error::Config(_))));
        assert!(matches!("password='open".parse::<PqConfig>(), Err(Error::Config(_))));
        assert!(matches!(
            "postgres://localhost/db".parse::<PqConfig>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_deserialize() {
        let config: PqConfig = serde_json::from_str(
            r#"{"host": "db", "user": "app", "dbname": "prod",
                "connect_timeout": 5, "sslmode": "verify-full"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.sslmode, SslMode::VerifyFull);

        let unknown = serde_json::from_str::<PqConfig>(r#"{"hots": "db"}"#);
        assert!(unknown.is_err());
    }
}
