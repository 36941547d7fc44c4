// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ListenAddress;

/// Configuration for the dkimsignd service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The socket the mail filter connects to.
    ///
    /// An absolute path selects a Unix socket; anything else is an
    /// INET/INET6 `address:port` pair. The default is a Unix socket under
    /// /run, which matches the systemd unit shipped with the service.
    #[serde(default = "default_listen")]
    pub listen: ListenAddress,

    /// The unprivileged user to run as.
    ///
    /// Required when the daemon is started as root; the process refuses to
    /// keep running with root privileges otherwise. Ignored when started
    /// unprivileged (it is then checked against the current user).
    #[serde(default)]
    pub user: Option<String>,

    /// The group to run as. Defaults to the primary group of `user`.
    #[serde(default)]
    pub group: Option<String>,

    /// Directory to chroot into before serving requests.
    ///
    /// Key files are read before the chroot happens, so they do not need to
    /// be visible inside it.
    #[serde(default)]
    pub chroot: Option<PathBuf>,

    /// Where to write the PID file. Written before privileges are dropped.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Verbosity on the historical 0-5 scale (error, warning, notice,
    /// info, debug trace). Overridden by `--log-filter` / DKIMSIGND_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: u8,

    /// The ordered list of signing key declarations. Order matters: the
    /// first declaration compatible with a query wins.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,

    /// The ordered list of sender tag-maps consulted by `choose_key`.
    #[serde(default)]
    pub sender_maps: Vec<SenderMapConfig>,
}

/// One signing key declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// The signing domain. A `*` acts as a wildcard; wildcarded domains
    /// are only consulted after all literal domains failed to match.
    pub domain: String,
    /// The DNS selector the public key is published under.
    pub selector: String,
    /// Path to the PEM-encoded RSA private key.
    pub file: PathBuf,
    /// Constraints mirroring the published key record.
    #[serde(default)]
    pub record: RecordConfig,
}

/// Constraints tied to the RFC 6376 public key record tags.
///
/// These describe the published DNS record so that key selection can refuse
/// combinations the verifier would reject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Record version; defaults to `DKIM1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Identity granularity; a single `*` wildcard is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<String>,
    /// Colon-separated list of permitted hash algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<String>,
    /// Key type. Forced to `rsa` when the key is loaded from a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    /// Colon-separated service types (`email` or `*`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    /// Colon-separated flags; `s` forbids subdomain identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Human notes; quoted-printable-encoded when the store is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
}

/// One ordered tag-map: lookup keys (full address, bare domain,
/// leading-dot suffix, or `.` catchall) mapped to partial tag sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderMapConfig {
    #[serde(default)]
    pub entries: HashMap<String, HashMap<String, TagValue>>,
}

/// A signature tag value as written in the configuration. `ttl` is
/// naturally an integer; everything else is a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    String(String),
    Integer(i64),
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::String(value) => write!(f, "{value}"),
            TagValue::Integer(value) => write!(f, "{value}"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            user: None,
            group: None,
            chroot: None,
            pid_file: None,
            log_level: default_log_level(),
            keys: vec![],
            sender_maps: vec![],
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_listen() -> ListenAddress {
    ListenAddress::Unix(PathBuf::from("/run/dkimsignd/dkimsignd.sock"))
}

fn default_log_level() -> u8 {
    2
}
