// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing key store and selection engine.
//!
//! Keys are declared in configuration order and indexed by signing domain
//! after [`KeyStore::postprocess`]. Selection walks the declarations for a
//! domain in declared order and returns the first one whose public-record
//! constraints admit the query; wildcarded domains live in a synthetic `*`
//! bucket that is only consulted when no literal bucket exists for the
//! queried domain.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::Context;
use openssl::md::{Md, MdRef};
use openssl::pkey::{PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};
use regex::Regex;

use crate::error::ConfigError;
use crate::server::config::RecordConfig;

/// Past this many declarations the duplicate-selector scan is skipped; a
/// config that large would make the linear check quadratic.
const DUPLICATE_CHECK_LIMIT: usize = 100;

static WILDCARD_WARNING: Once = Once::new();

/// Digest algorithms accepted for the signing primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha512" | "sha-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// The digest size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn md(&self) -> &'static MdRef {
        match self {
            Self::Sha1 => Md::sha1(),
            Self::Sha256 => Md::sha256(),
            Self::Sha512 => Md::sha512(),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        };
        write!(f, "{name}")
    }
}

/// How a declaration's domain is matched against a query domain.
#[derive(Debug, Clone)]
enum DomainMatcher {
    Literal(String),
    Pattern(Regex),
}

impl DomainMatcher {
    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Literal(literal) => literal == domain,
            DomainMatcher::Pattern(pattern) => pattern.is_match(domain),
        }
    }
}

/// Public-record constraints derived from the declared tags.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordConstraints {
    granularity: Option<String>,
    hashes: Option<Vec<String>>,
    key_type: String,
    services: Option<Vec<String>>,
    flags: Vec<String>,
    notes: Option<String>,
}

impl RecordConstraints {
    fn derive(record: &RecordConfig) -> Self {
        Self {
            granularity: record.g.clone(),
            hashes: record.h.as_deref().map(colon_list),
            key_type: record.k.clone().unwrap_or_else(|| "rsa".to_string()),
            services: record.s.as_deref().map(colon_list),
            flags: record.t.as_deref().map(colon_list).unwrap_or_default(),
            notes: record.n.as_deref().map(dkim_quoted_printable),
        }
    }
}

fn colon_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// DKIM quoted-printable (RFC 6376 §2.11): everything outside the printable
/// range, plus `=` and `;`, becomes an `=HH` escape.
fn dkim_quoted_printable(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if (0x21..=0x7e).contains(&byte) && byte != b'=' && byte != b';' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("={byte:02X}"));
        }
    }
    out
}

/// One ordered key declaration.
#[derive(Debug)]
struct KeyDeclaration {
    /// Lowercased declared domain; may contain `*`.
    domain: String,
    /// Lowercased selector.
    selector: String,
    /// Index into the deduplicated record list.
    record_index: usize,
    record: RecordConfig,
    /// Set by postprocess.
    matcher: Option<DomainMatcher>,
    constraints: Option<RecordConstraints>,
}

/// One loaded key file. Declarations that name the same file (by device
/// and inode) share a single record.
struct KeyRecord {
    path: PathBuf,
    device: u64,
    inode: u64,
    pem: Vec<u8>,
    /// Set by postprocess.
    pkey: Option<PKey<Private>>,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("path", &self.path)
            .field("device", &self.device)
            .field("inode", &self.inode)
            .finish_non_exhaustive()
    }
}

/// A key-selection query assembled from resolved signature options.
#[derive(Debug, Default, Clone)]
pub struct KeyQuery {
    /// The signing domain (`d` tag). Required.
    pub domain: String,
    /// The selector (`s` tag), when the caller insists on one.
    pub selector: Option<String>,
    /// The signing algorithm (`a` tag), `<keytype>-<hashalg>`. Absent means
    /// `rsa` with an unspecified hash.
    pub algorithm: Option<String>,
    /// The signing identity (`i` tag), `local@domain`.
    pub identity: Option<String>,
}

/// The outcome of a successful selection.
pub struct SelectedKey<'a> {
    /// The concrete (query) domain the key was selected for.
    pub domain: String,
    pub selector: &'a str,
    pub pkey: &'a PKey<Private>,
    pub record: &'a RecordConfig,
}

#[derive(Debug, Default)]
pub struct KeyStore {
    declarations: Vec<KeyDeclaration>,
    records: Vec<KeyRecord>,
    by_domain: HashMap<String, Vec<usize>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a signing key for `(domain, selector)` backed by a PEM file.
    ///
    /// Declarations are kept in call order; the earliest compatible one
    /// wins selection. Files already declared (same device and inode) are
    /// not loaded twice.
    pub fn declare(
        &mut self,
        domain: &str,
        selector: &str,
        path: &Path,
        record: RecordConfig,
    ) -> Result<(), ConfigError> {
        let domain = domain.trim().to_ascii_lowercase();
        let selector = selector.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        if selector.is_empty() {
            return Err(ConfigError::EmptySelector { domain });
        }
        if self.declarations.len() <= DUPLICATE_CHECK_LIMIT
            && self
                .declarations
                .iter()
                .any(|declaration| declaration.domain == domain && declaration.selector == selector)
        {
            return Err(ConfigError::DuplicateSelector { domain, selector });
        }

        let record_index = self.load_record(path)?;
        let mut record = record;
        // The key came from a PEM file, so whatever the record claims, the
        // type is RSA.
        record.k = Some("rsa".to_string());

        tracing::debug!(domain, selector, path = %path.display(), "declared signing key");
        self.declarations.push(KeyDeclaration {
            domain,
            selector,
            record_index,
            record,
            matcher: None,
            constraints: None,
        });
        Ok(())
    }

    fn load_record(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|source| ConfigError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        let (device, inode) = (metadata.dev(), metadata.ino());
        if let Some(index) = self
            .records
            .iter()
            .position(|record| record.device == device && record.inode == inode)
        {
            return Ok(index);
        }

        let pem = std::fs::read(path).map_err(|source| ConfigError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.records.push(KeyRecord {
            path: path.to_path_buf(),
            device,
            inode,
            pem,
            pkey: None,
        });
        Ok(self.records.len() - 1)
    }

    /// Materialize the declarations: parse PEM into RSA keys, derive the
    /// record constraints, compile wildcard domains, and build the domain
    /// index. Must be called once after the last [`declare`](Self::declare);
    /// running it again over an unchanged store yields the same indexes.
    pub fn postprocess(&mut self) -> Result<(), ConfigError> {
        for record in &mut self.records {
            if record.pkey.is_some() {
                continue;
            }
            let rsa = Rsa::private_key_from_pem(&record.pem).map_err(|source| {
                ConfigError::InvalidKey {
                    path: record.path.clone(),
                    source,
                }
            })?;
            let pkey = PKey::from_rsa(rsa).map_err(|source| ConfigError::InvalidKey {
                path: record.path.clone(),
                source,
            })?;
            record.pkey = Some(pkey);
        }

        let mut wildcards = false;
        for declaration in &mut self.declarations {
            declaration.record.v.get_or_insert_with(|| "DKIM1".to_string());
            declaration.matcher = Some(if declaration.domain.contains('*') {
                wildcards = true;
                DomainMatcher::Pattern(compile_domain_pattern(&declaration.domain)?)
            } else {
                DomainMatcher::Literal(declaration.domain.clone())
            });
            declaration.constraints = Some(RecordConstraints::derive(&declaration.record));
        }
        if wildcards {
            WILDCARD_WARNING.call_once(|| {
                tracing::warn!(
                    "wildcarded signing domains declared; key lookups fall back to a linear scan"
                );
            });
        }

        let mut by_domain: HashMap<String, Vec<usize>> = HashMap::new();
        for declaration in &self.declarations {
            if let Some(DomainMatcher::Literal(domain)) = &declaration.matcher {
                by_domain.entry(domain.clone()).or_default();
            }
        }
        let mut star = Vec::new();
        for (index, declaration) in self.declarations.iter().enumerate() {
            match declaration.matcher.as_ref().expect("matcher set above") {
                DomainMatcher::Literal(domain) => {
                    by_domain
                        .get_mut(domain)
                        .expect("bucket created above")
                        .push(index);
                }
                DomainMatcher::Pattern(_) => {
                    // Wildcards are visible through every literal bucket and
                    // through the fallback bucket for unknown domains.
                    for bucket in by_domain.values_mut() {
                        bucket.push(index);
                    }
                    star.push(index);
                }
            }
        }
        if !star.is_empty() {
            by_domain.insert("*".to_string(), star);
        }
        self.by_domain = by_domain;
        Ok(())
    }

    /// The literal-domain index, exposed for equality checks in tests.
    pub fn domain_index(&self) -> &HashMap<String, Vec<usize>> {
        &self.by_domain
    }

    /// Return the first declared key compatible with `query`, or [`None`].
    pub fn select(&self, query: &KeyQuery) -> Option<SelectedKey<'_>> {
        let domain = query.domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return None;
        }
        let (key_type, hash) = match query.algorithm.as_deref() {
            Some(algorithm) => match algorithm.split_once('-') {
                Some((key_type, hash)) => (
                    key_type.to_ascii_lowercase(),
                    Some(hash.to_ascii_lowercase()),
                ),
                None => (algorithm.to_ascii_lowercase(), None),
            },
            None => ("rsa".to_string(), None),
        };
        let selector = query
            .selector
            .as_deref()
            .map(|selector| selector.trim().to_ascii_lowercase());
        let identity = query.identity.as_deref().map(split_identity);

        let candidates = self
            .by_domain
            .get(&domain)
            .or_else(|| self.by_domain.get("*"))?;
        for &index in candidates {
            let declaration = &self.declarations[index];
            let constraints = declaration
                .constraints
                .as_ref()
                .expect("postprocess must run before select");
            if !declaration
                .matcher
                .as_ref()
                .expect("postprocess must run before select")
                .matches(&domain)
            {
                continue;
            }
            if let Some(selector) = &selector {
                if declaration.selector != *selector {
                    continue;
                }
            }
            if constraints.key_type != key_type {
                continue;
            }
            if let Some(services) = &constraints.services {
                if !services
                    .iter()
                    .any(|service| service == "email" || service == "*")
                {
                    continue;
                }
            }
            if let (Some(hash), Some(hashes)) = (&hash, &constraints.hashes) {
                if !hashes.contains(hash) {
                    continue;
                }
            }
            if let Some((local, identity_domain)) = &identity {
                if identity_domain != &domain && constraints.flags.iter().any(|flag| flag == "s") {
                    continue;
                }
                if !granularity_admits(constraints.granularity.as_deref(), local) {
                    continue;
                }
            }

            tracing::trace!(
                domain,
                selector = %declaration.selector,
                notes = ?constraints.notes,
                "selected signing key"
            );
            let record = &self.records[declaration.record_index];
            return Some(SelectedKey {
                domain,
                selector: &declaration.selector,
                pkey: record
                    .pkey
                    .as_ref()
                    .expect("postprocess must run before select"),
                record: &declaration.record,
            });
        }
        None
    }
}

/// Split a signing identity into (local part, lowercased domain).
fn split_identity(identity: &str) -> (String, String) {
    match identity.rsplit_once('@') {
        Some((local, domain)) => (local.to_string(), domain.to_ascii_lowercase()),
        None => (identity.to_string(), String::new()),
    }
}

/// Does the granularity tag admit this local part? A bare or absent `*`
/// admits everything; one embedded `*` splits into a required prefix and
/// suffix; anything else must match exactly.
fn granularity_admits(granularity: Option<&str>, local: &str) -> bool {
    match granularity {
        None | Some("*") => true,
        Some(granularity) => match granularity.split_once('*') {
            Some((prefix, suffix)) => {
                local.len() >= prefix.len() + suffix.len()
                    && local.starts_with(prefix)
                    && local.ends_with(suffix)
            }
            None => granularity == local,
        },
    }
}

/// Compile a `*`-wildcarded domain into an anchored pattern. Consecutive
/// wildcards collapse into one.
fn compile_domain_pattern(domain: &str) -> Result<Regex, ConfigError> {
    let mut pattern = String::from("^");
    let mut previous_wildcard = false;
    for ch in domain.chars() {
        if ch == '*' {
            if !previous_wildcard {
                pattern.push_str(".*");
            }
            previous_wildcard = true;
        } else {
            previous_wildcard = false;
            pattern.push_str(&regex::escape(&ch.to_string()));
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|source| ConfigError::InvalidDomainPattern {
        domain: domain.to_string(),
        source,
    })
}

/// RSASSA-PKCS1-v1_5 over a pre-computed digest.
///
/// The digest length must match the named algorithm; OpenSSL would accept
/// some mismatches and produce a signature no verifier accepts.
pub fn sign_digest(
    pkey: &PKey<Private>,
    algorithm: DigestAlgorithm,
    digest: &[u8],
) -> anyhow::Result<Vec<u8>> {
    if digest.len() != algorithm.size() {
        anyhow::bail!(
            "the {algorithm} digest is {} bytes; payload was {}",
            algorithm.size(),
            digest.len()
        );
    }
    let mut ctx = PkeyCtx::new(pkey).context("signing context")?;
    ctx.sign_init()?;
    ctx.set_signature_md(algorithm.md())?;
    // PKCS #1 should be the default, but lets be explicit about it.
    ctx.set_rsa_padding(Padding::PKCS1)?;
    let mut signature = vec![];
    ctx.sign_to_vec(digest, &mut signature)?;
    Ok(signature)
}
