// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::instrument;

use crate::protocol::{Attributes, Response};
use crate::server::keystore::{sign_digest, DigestAlgorithm, KeyQuery, KeyStore};
use crate::server::options::{self, TagMaps};

/// Signature tags the service accepts but never emits.
const IGNORED_TAGS: [&str; 2] = ["l", "z"];

/// Everything a request handler needs; immutable once the daemon serves.
pub(crate) struct ServerState {
    pub keystore: Arc<KeyStore>,
    pub tag_maps: TagMaps,
}

/// Route one assembled request to its handler and produce the response.
///
/// `request_id` and `log_id` are echoed ahead of any other attribute so
/// the client can correlate pipelined responses.
#[instrument(skip_all, fields(request = attributes.get("request").unwrap_or("-")))]
pub(crate) async fn dispatch(state: &ServerState, attributes: &Attributes) -> Response {
    let mut response = Response::new();
    for name in ["request_id", "log_id"] {
        if let Some(value) = attributes.get(name) {
            response.push(name, value);
        }
    }

    match attributes.get("request") {
        Some("choose_key") => choose_key(state, attributes, &mut response),
        Some("sign") => sign(state, attributes, &mut response).await,
        _ => response.push("reason", "unknown request type"),
    }
    response
}

#[instrument(skip_all)]
fn choose_key(state: &ServerState, attributes: &Attributes, response: &mut Response) {
    let candidates: Vec<(String, String)> = attributes
        .values("candidate")
        .iter()
        .filter_map(|value| match value.split_once(' ') {
            Some((label, mailbox)) => Some((label.to_string(), mailbox.to_string())),
            None => {
                tracing::warn!(candidate = %value, "candidate without a source label");
                None
            }
        })
        .collect();
    let hints: Vec<(String, String)> = attributes
        .iter()
        .filter_map(|(name, values)| {
            let tag = name.strip_prefix("sig.")?;
            Some((tag.to_string(), values.first().cloned().unwrap_or_default()))
        })
        .collect();

    let resolved = options::resolve(&state.tag_maps, &candidates, &hints, &state.keystore);
    let mut tags = resolved.options;

    // ttl is a pseudo-tag: it becomes an absolute expiry relative to the
    // signature timestamp, or to now when the client sets t itself.
    if let Some(ttl) = tags.remove("ttl") {
        match ttl.parse::<u64>() {
            Ok(ttl) => {
                let base = tags
                    .get("t")
                    .and_then(|t| t.parse::<u64>().ok())
                    .unwrap_or_else(unix_now);
                tags.insert("x".to_string(), (base + ttl).to_string());
            }
            Err(_) => tracing::warn!(ttl, "ignoring unparseable ttl signature option"),
        }
    }

    let mut tags: Vec<(String, String)> = tags.into_iter().collect();
    tags.sort();
    for (tag, value) in tags {
        if value.is_empty() || IGNORED_TAGS.contains(&tag.as_str()) {
            continue;
        }
        response.push(format!("sig.{tag}"), value);
    }
    if let Some(chosen) = resolved.chosen {
        response.push(
            "chosen_candidate",
            format!("{} {}", chosen.label, chosen.address),
        );
    }
}

/// Sign a pre-computed digest with the key previously chosen for `(d, s)`.
///
/// The presence of `b` in the response is the success signal; on any
/// failure the response instead carries a single `reason`.
#[instrument(skip_all)]
async fn sign(state: &ServerState, attributes: &Attributes, response: &mut Response) {
    for name in ["digest", "digest_alg", "d", "s"] {
        if attributes.get(name).is_none_or(str::is_empty) {
            response.push("reason", format!("cannot sign, missing {name}"));
            return;
        }
    }
    let digest = attributes.get("digest").expect("checked above").to_string();
    let digest_alg = attributes
        .get("digest_alg")
        .expect("checked above")
        .to_string();
    let query = KeyQuery {
        domain: attributes.get("d").expect("checked above").to_string(),
        selector: Some(attributes.get("s").expect("checked above").to_string()),
        // The compatibility filtering already happened during choose_key.
        algorithm: None,
        identity: None,
    };

    let keystore = state.keystore.clone();
    let signed = tokio::task::spawn_blocking(move || {
        let Some(key) = keystore.select(&query) else {
            return Ok(None);
        };
        let algorithm = DigestAlgorithm::from_name(&digest_alg)
            .ok_or_else(|| anyhow::anyhow!("unsupported digest algorithm {digest_alg}"))?;
        let digest = BASE64
            .decode(digest.trim())
            .context("digest is not valid Base64")?;
        let signature = sign_digest(key.pkey, algorithm, &digest)?;
        Ok::<_, anyhow::Error>(Some((key.domain, key.selector.to_string(), signature)))
    })
    .await;

    match signed {
        Ok(Ok(Some((domain, selector, signature)))) => {
            response.push("d", domain);
            response.push("s", selector);
            response.push("b", BASE64.encode(signature));
        }
        Ok(Ok(None)) => response.push("reason", "cannot sign, signing key not available"),
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "signing request failed");
            response.push("reason", format!("cannot sign: {error}"));
        }
        Err(error) => {
            tracing::error!(?error, "signing task failed to run");
            response.push("reason", "cannot sign: internal error");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use dkimsignd_test::keys;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::server::config::RecordConfig;

    fn state_with_key(domain: &str, selector: &str) -> (ServerState, NamedTempFile) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(keys::RSA_1024_PEM.as_bytes()).unwrap();
        let mut store = KeyStore::new();
        store
            .declare(domain, selector, file.path(), RecordConfig::default())
            .unwrap();
        store.postprocess().unwrap();
        let state = ServerState {
            keystore: Arc::new(store),
            tag_maps: TagMaps::compile(&[]),
        };
        (state, file)
    }

    fn request(pairs: &[(&str, &str)]) -> Attributes {
        let mut attributes = Attributes::new();
        for (name, value) in pairs {
            attributes.push(name.to_string(), value.to_string());
        }
        attributes
    }

    #[tokio::test]
    async fn unknown_request_type_gets_a_reason() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[("request", "make_coffee"), ("request_id", "41")]),
        )
        .await;
        assert_eq!(
            response.attributes(),
            [
                ("request_id".to_string(), "41".to_string()),
                ("reason".to_string(), "unknown request type".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn request_and_log_ids_are_echoed_first() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[
                ("request", "choose_key"),
                ("log_id", "conn-9"),
                ("candidate", "author <u@example.org>"),
            ]),
        )
        .await;
        assert_eq!(response.attributes()[0], ("log_id".to_string(), "conn-9".to_string()));
    }

    #[tokio::test]
    async fn choose_key_emits_merged_tags_and_chosen_candidate() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[
                ("request", "choose_key"),
                ("candidate", "author <u@example.org>"),
            ]),
        )
        .await;
        assert_eq!(response.get("sig.d"), Some("example.org"));
        assert_eq!(response.get("sig.s"), Some("sel1"));
        assert_eq!(response.get("sig.a"), Some("rsa-sha256"));
        assert_eq!(response.get("sig.c"), Some("relaxed/simple"));
        assert_eq!(response.get("chosen_candidate"), Some("author u@example.org"));
    }

    #[tokio::test]
    async fn choose_key_converts_ttl_into_an_absolute_expiry() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[
                ("request", "choose_key"),
                ("candidate", "author <u@example.org>"),
                ("sig.t", "1000000"),
                ("sig.ttl", "120"),
            ]),
        )
        .await;
        assert_eq!(response.get("sig.x"), Some("1000120"));
        assert_eq!(response.get("sig.ttl"), None);
    }

    #[tokio::test]
    async fn choose_key_never_emits_ignored_tags() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[
                ("request", "choose_key"),
                ("candidate", "author <u@example.org>"),
                ("sig.l", "512"),
                ("sig.z", "From:alice"),
            ]),
        )
        .await;
        assert_eq!(response.get("sig.l"), None);
        assert_eq!(response.get("sig.z"), None);
    }

    #[tokio::test]
    async fn sign_requires_all_attributes() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[("request", "sign"), ("d", "example.org"), ("s", "sel1")]),
        )
        .await;
        assert_eq!(response.get("reason"), Some("cannot sign, missing digest"));
        assert_eq!(response.get("b"), None);
    }

    #[tokio::test]
    async fn sign_without_a_key_reports_unavailable() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let digest = BASE64.encode([0u8; 32]);
        let response = dispatch(
            &state,
            &request(&[
                ("request", "sign"),
                ("d", "unknown.test"),
                ("s", "anything"),
                ("digest_alg", "sha256"),
                ("digest", &digest),
            ]),
        )
        .await;
        assert_eq!(
            response.get("reason"),
            Some("cannot sign, signing key not available")
        );
        assert_eq!(response.get("b"), None);
    }

    #[tokio::test]
    async fn sign_surfaces_bad_digests_as_reasons() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let response = dispatch(
            &state,
            &request(&[
                ("request", "sign"),
                ("d", "example.org"),
                ("s", "sel1"),
                ("digest_alg", "sha256"),
                ("digest", "!!! not base64 !!!"),
            ]),
        )
        .await;
        let reason = response.get("reason").unwrap();
        assert!(reason.starts_with("cannot sign:"), "got {reason:?}");
        assert_eq!(response.get("b"), None);
    }

    #[tokio::test]
    async fn sign_produces_a_verifiable_signature() {
        let (state, _file) = state_with_key("example.org", "sel1");
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"hello\n").unwrap();
        let response = dispatch(
            &state,
            &request(&[
                ("request", "sign"),
                ("d", "example.org"),
                ("s", "sel1"),
                ("digest_alg", "sha256"),
                ("digest", &BASE64.encode(&digest)),
            ]),
        )
        .await;
        assert_eq!(response.get("d"), Some("example.org"));
        assert_eq!(response.get("s"), Some("sel1"));
        let signature = BASE64.decode(response.get("b").unwrap()).unwrap();
        assert_eq!(signature.len(), 128);
        assert!(
            dkimsignd_test::verify_rsa_signature(keys::RSA_1024_PEM, "sha256", &digest, &signature)
                .unwrap()
        );
    }
}
