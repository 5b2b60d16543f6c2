//! Where to connect to.

use std::{
    env,
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6600;

/// Server address plus optional password.
///
/// Parses from `[password@]host[:port]`, where an IPv6 host with a port must be bracketed, as in
/// `[::1]:6600`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Values to fill in for parts a target string omits.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetDefaults {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        TargetDefaults {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            password: None,
        }
    }
}

impl TargetDefaults {
    /// Read `MPD_HOST` and `MPD_PORT`, falling back to the built-in defaults.
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("MPD_HOST").ok().as_deref(),
            env::var("MPD_PORT").ok().as_deref(),
        )
    }

    /// Build from the values of `MPD_HOST` and `MPD_PORT`.
    ///
    /// The host may carry a password as `password@host`. An unparseable port is ignored.
    pub fn from_vars(host: Option<&str>, port: Option<&str>) -> Self {
        let mut defaults = TargetDefaults::default();
        if let Some(host) = host.filter(|host| !host.is_empty()) {
            match Target::parse_with(host, &defaults) {
                Ok(target) => {
                    defaults.host = target.host;
                    defaults.port = target.port;
                    defaults.password = target.password;
                }
                Err(e) => warn!(%e, "ignoring MPD_HOST"),
            }
        }
        if let Some(port) = port.filter(|port| !port.is_empty()) {
            match port.parse() {
                Ok(port) => defaults.port = port,
                Err(_) => warn!(%port, "ignoring unparseable MPD_PORT"),
            }
        }
        defaults
    }
}

impl Target {
    /// Parse, filling in omitted parts from `defaults`.
    ///
    /// The default password only applies when the host is also the default one, so it is never
    /// sent to a host named explicitly.
    pub fn parse_with(s: &str, defaults: &TargetDefaults) -> Result<Self, TargetError> {
        // the password may itself contain '@'
        let (password, rest) = match s.rsplit_once('@') {
            Some((password, rest)) if !password.is_empty() => (Some(password.to_owned()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, s),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| TargetError::UnclosedBracket(s.to_owned()))?;
            match after {
                "" => (host, None),
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| TargetError::Malformed(s.to_owned()))?;
                    (host, Some(port))
                }
            }
        } else if rest.matches(':').count() > 1 {
            // bare IPv6 address, which cannot carry a port
            (rest, None)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| TargetError::InvalidPort(port.to_owned()))?,
            None => defaults.port,
        };
        let (host, password) = if host.is_empty() {
            let password = password.or_else(|| defaults.password.clone());
            (defaults.host.clone(), password)
        } else {
            (host.to_owned(), password)
        };
        Ok(Target {
            host,
            port,
            password,
        })
    }

    /// The target `MPD_HOST` and `MPD_PORT` point to.
    pub fn from_env() -> Self {
        let TargetDefaults {
            host,
            port,
            password,
        } = TargetDefaults::from_env();
        Target {
            host,
            port,
            password,
        }
    }
}

impl Default for Target {
    fn default() -> Self {
        Target {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            password: None,
        }
    }
}

impl FromStr for Target {
    type Err = TargetError;

    /// Parse with defaults taken from the environment.
    fn from_str(s: &str) -> Result<Self, TargetError> {
        Target::parse_with(s, &TargetDefaults::from_env())
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(password) = self.password.as_ref() {
            write!(f, "{}@", password)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error for parsing a [`Target`].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TargetError {
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unclosed '[' in {0:?}")]
    UnclosedBracket(String),
    #[error("malformed target {0:?}")]
    Malformed(String),
}
