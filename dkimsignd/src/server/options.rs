// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signature-option resolution.
//!
//! The mail filter hands over an ordered list of candidate sender
//! identities; each is probed against the configured ordered tag-maps via a
//! list of derived query keys (full address first, `@.` catchall last).
//! The first candidate for which a compatible signing key exists wins.

use std::collections::{HashMap, HashSet};

use crate::server::config::SenderMapConfig;
use crate::server::keystore::{KeyQuery, KeyStore};

/// Parent-domain suffix keys stop after this many levels.
const MAX_PARENT_LEVELS: usize = 10;

/// The sub-address separator, as in `user+tag@example.org`.
const RECIPIENT_DELIMITER: char = '+';

/// Defaults appended after all configured tag-maps, so every resolution
/// ends up with a canonicalization and an algorithm.
const CATCHALL_DEFAULTS: [(&str, &str); 2] = [("c", "relaxed/simple"), ("a", "rsa-sha256")];

/// A parsed, unquoted RFC 5321 mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// The local part with quoting undone. May legitimately contain `@`.
    pub local: String,
    /// The lowercased domain; empty for a degenerate mailbox.
    pub domain: String,
}

impl Mailbox {
    /// The printable address. A local part containing `@` with no domain
    /// keeps a trailing `@` so the empty domain stays visible.
    pub fn address(&self) -> String {
        if self.domain.is_empty() {
            if self.local.contains('@') {
                format!("{}@", self.local)
            } else {
                self.local.clone()
            }
        } else {
            format!("{}@{}", self.local, self.domain)
        }
    }
}

/// Unquote an RFC 5321 mailbox: prefer the contents of the angle brackets
/// (there may be a display name in front), drop an obsolete source route,
/// and undo quoted-pairs in a quoted local part.
pub fn unquote_mailbox(input: &str) -> Mailbox {
    let mut s = input.trim();
    if let (Some(start), Some(end)) = (s.rfind('<'), s.rfind('>')) {
        if start < end {
            s = s[start + 1..end].trim();
        }
    }
    if s.starts_with('@') {
        if let Some(colon) = s.find(':') {
            s = &s[colon + 1..];
        }
    }

    let (local, domain) = if let Some(quoted) = s.strip_prefix('"') {
        let mut local = String::new();
        let chars: Vec<char> = quoted.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '\\' if i + 1 < chars.len() => {
                    local.push(chars[i + 1]);
                    i += 2;
                }
                '"' => {
                    i += 1;
                    break;
                }
                ch => {
                    local.push(ch);
                    i += 1;
                }
            }
        }
        let rest: String = chars[i..].iter().collect();
        let domain = rest.strip_prefix('@').unwrap_or(&rest).to_string();
        (local, domain)
    } else {
        match s.rsplit_once('@') {
            Some((local, domain)) => (local.to_string(), domain.to_string()),
            None => (s.to_string(), String::new()),
        }
    };

    Mailbox {
        local,
        domain: domain.to_ascii_lowercase(),
    }
}

/// Split the sub-address extension off a local part, unless the local part
/// is one of the forms that legitimately contains the delimiter: mailer
/// addresses, `owner-*` and `*-request` list aliases, and locals where the
/// split would leave nothing in front of the delimiter.
fn split_extension(local: &str) -> Option<(&str, &str)> {
    let lower = local.to_ascii_lowercase();
    if lower.starts_with("owner-") || lower.ends_with("-request") {
        return None;
    }
    let (base, extension) = local.split_once(RECIPIENT_DELIMITER)?;
    if base.is_empty() {
        return None;
    }
    // The reserved names are tested after the split so that a trailing
    // extension cannot smuggle them past the guard.
    if base.eq_ignore_ascii_case("postmaster")
        || base.eq_ignore_ascii_case("mailer-daemon")
        || base.eq_ignore_ascii_case("double-bounce")
    {
        return None;
    }
    Some((base, extension))
}

/// Build the ordered list of tag-map query keys for a mailbox, most
/// specific first, deduplicated preserving first occurrence.
pub fn query_keys(mailbox: &Mailbox) -> Vec<String> {
    let mut keys = Vec::new();
    keys.push(mailbox.address());

    let local = mailbox.local.to_ascii_lowercase();
    let domain = &mailbox.domain;
    let split = split_extension(&local);
    if let Some((base, extension)) = split {
        keys.push(format!("{base}{RECIPIENT_DELIMITER}{extension}@{domain}"));
        keys.push(format!("{base}@{domain}"));
        keys.push(format!("{base}{RECIPIENT_DELIMITER}{extension}@"));
        keys.push(format!("{base}@"));
    } else {
        keys.push(format!("{local}@{domain}"));
        keys.push(format!("{local}@"));
    }
    if !domain.is_empty() {
        keys.push(format!("@{domain}"));
        let labels: Vec<&str> = domain.split('.').collect();
        for level in 0..labels.len().min(MAX_PARENT_LEVELS) {
            keys.push(format!("@.{}", labels[level..].join(".")));
        }
        keys.push("@.".to_string());
    }

    let mut seen = HashSet::new();
    keys.retain(|key| seen.insert(key.clone()));
    keys
}

/// The configured tag-maps, compiled for lookup: keys lowercased and
/// normalized to the query-key forms (`@domain`, `@.suffix`, `@.`).
#[derive(Debug, Default)]
pub struct TagMaps {
    maps: Vec<HashMap<String, Vec<(String, String)>>>,
}

impl TagMaps {
    pub fn compile(configs: &[SenderMapConfig]) -> Self {
        let maps = configs
            .iter()
            .map(|config| {
                config
                    .entries
                    .iter()
                    .map(|(key, tags)| {
                        let mut tags: Vec<(String, String)> = tags
                            .iter()
                            .map(|(tag, value)| (tag.clone(), value.to_string()))
                            .collect();
                        tags.sort();
                        (normalize_lookup_key(key), tags)
                    })
                    .collect()
            })
            .collect();
        Self { maps }
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// Map a configured lookup key onto the query-key form: `.` is the
/// catchall, a leading dot is a domain suffix, a bare word is a domain,
/// and anything containing `@` is already an address form.
fn normalize_lookup_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase();
    if key == "." {
        "@.".to_string()
    } else if key.starts_with('.') || !key.contains('@') {
        format!("@{key}")
    } else {
        key
    }
}

/// The candidate that won resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChosenCandidate {
    pub label: String,
    pub address: String,
}

/// The outcome of walking the candidate list.
#[derive(Debug, Default)]
pub struct Resolved {
    /// The merged signature options. With a chosen candidate, `s` and `d`
    /// are those of the selected key.
    pub options: HashMap<String, String>,
    pub chosen: Option<ChosenCandidate>,
}

/// Walk the candidates in order and return the options of the first one
/// for which a signing key exists.
///
/// Option precedence, per tag, is "first seen wins": tag-map matches in
/// query-key order, then the request's `sig.<tag>` hints, then the builtin
/// catchall, and finally the candidate's own domain as a default `d`.
pub fn resolve(
    tag_maps: &TagMaps,
    candidates: &[(String, String)],
    request_hints: &[(String, String)],
    keystore: &KeyStore,
) -> Resolved {
    let mut last_options = None;
    for (label, raw_mailbox) in candidates {
        let mailbox = unquote_mailbox(raw_mailbox);
        let mut options = merge_options(tag_maps, Some(&mailbox), request_hints);
        if !options.contains_key("d") && !mailbox.domain.is_empty() {
            options.insert(
                "d".to_string(),
                mailbox.domain.trim_start_matches('@').to_string(),
            );
        }

        let query = KeyQuery {
            domain: options.get("d").cloned().unwrap_or_default(),
            selector: options.get("s").cloned(),
            algorithm: options.get("a").cloned(),
            identity: options.get("i").cloned(),
        };
        if let Some(key) = keystore.select(&query) {
            options.insert("d".to_string(), key.domain.clone());
            options.insert("s".to_string(), key.selector.to_string());
            tracing::debug!(label = %label, address = %mailbox.address(), "candidate accepted");
            return Resolved {
                options,
                chosen: Some(ChosenCandidate {
                    label: label.clone(),
                    address: mailbox.address(),
                }),
            };
        }
        tracing::debug!(label = %label, address = %mailbox.address(), "no signing key for candidate");
        last_options = Some(options);
    }

    Resolved {
        options: last_options.unwrap_or_else(|| merge_options(tag_maps, None, request_hints)),
        chosen: None,
    }
}

fn merge_options(
    tag_maps: &TagMaps,
    mailbox: Option<&Mailbox>,
    request_hints: &[(String, String)],
) -> HashMap<String, String> {
    let mut options = HashMap::new();
    if let Some(mailbox) = mailbox {
        let keys = query_keys(mailbox);
        for map in &tag_maps.maps {
            for key in &keys {
                if let Some(tags) = map.get(key) {
                    for (tag, value) in tags {
                        options
                            .entry(tag.clone())
                            .or_insert_with(|| value.clone());
                    }
                }
            }
        }
    }
    for (tag, value) in request_hints {
        options
            .entry(tag.clone())
            .or_insert_with(|| value.clone());
    }
    for (tag, value) in CATCHALL_DEFAULTS {
        options
            .entry(tag.to_string())
            .or_insert_with(|| value.to_string());
    }
    options
}
