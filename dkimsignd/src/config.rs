// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Shared configuration types and loading helpers.

use std::{env, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Where the daemon listens for the mail filter's connections.
///
/// Serialized as a single string: an absolute path selects a Unix socket,
/// anything else is treated as an INET/INET6 `address:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ListenAddress {
    Inet(String),
    Unix(PathBuf),
}

impl From<String> for ListenAddress {
    fn from(value: String) -> Self {
        if value.starts_with('/') {
            ListenAddress::Unix(PathBuf::from(value))
        } else {
            ListenAddress::Inet(value)
        }
    }
}

impl From<&str> for ListenAddress {
    fn from(value: &str) -> Self {
        ListenAddress::from(value.to_string())
    }
}

impl From<ListenAddress> for String {
    fn from(value: ListenAddress) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Inet(address) => write!(f, "{address}"),
            ListenAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Locate and parse the configuration file.
///
/// An explicit `path` always wins. Otherwise the `default` name is looked
/// up under CONFIGURATION_DIRECTORY (systemd sets it for the service).
/// When neither yields a file, the built-in [`Default`] configuration is
/// used so a fresh install can start without any file at all.
///
/// # Errors
///
/// A file that exists but cannot be read or parsed is an error; the
/// daemon must not come up with half a configuration. The error for an
/// unparseable file carries a complete example rendering of `T`.
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let path = path.or_else(|| {
        let base = env::var_os("CONFIGURATION_DIRECTORY").map(PathBuf::from)?;
        Some(base.join(default)).filter(|candidate| candidate.is_file())
    });
    let Some(path) = path else {
        tracing::warn!("no configuration file found; using built-in defaults");
        return Ok(T::default());
    };

    tracing::info!(path = %path.display(), "loading configuration");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read configuration file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| {
        format!(
            "{} is not a valid configuration file; a complete example:\n\n{}",
            path.display(),
            T::default()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_address_discriminates_on_leading_slash() {
        assert_eq!(
            ListenAddress::from("127.0.0.1:9998"),
            ListenAddress::Inet("127.0.0.1:9998".to_string())
        );
        assert_eq!(
            ListenAddress::from("/run/dkimsignd/dkimsignd.sock"),
            ListenAddress::Unix(PathBuf::from("/run/dkimsignd/dkimsignd.sock"))
        );
    }
}
