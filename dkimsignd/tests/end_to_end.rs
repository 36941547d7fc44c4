// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dkimsignd::server::config::RecordConfig;
use dkimsignd_test::{attribute, keys, verify_rsa_signature, InstanceBuilder};

fn sha256(data: &[u8]) -> Vec<u8> {
    openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)
        .unwrap()
        .to_vec()
}

// A single declared key serves a matching candidate with full tag
// defaults.
#[tokio::test]
#[tracing_test::traced_test]
async fn basic_choose_key() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("request_id", "1"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;

    assert_eq!(attribute(&response, "request_id"), Some("1"));
    assert_eq!(attribute(&response, "sig.d"), Some("example.org"));
    assert_eq!(attribute(&response, "sig.s"), Some("sel1"));
    assert_eq!(attribute(&response, "sig.a"), Some("rsa-sha256"));
    assert_eq!(attribute(&response, "sig.c"), Some("relaxed/simple"));
    assert_eq!(
        attribute(&response, "chosen_candidate"),
        Some("author u@example.org")
    );

    instance.halt().await?;
    Ok(())
}

// The sign round trip produces a 128-byte RSA signature that verifies
// under RSASSA-PKCS1-v1_5 with SHA-256.
#[tokio::test]
#[tracing_test::traced_test]
async fn sign_round_trip() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let digest = sha256(b"hello\n");
    let response = client
        .request(&[
            ("request", "sign"),
            ("d", "example.org"),
            ("s", "sel1"),
            ("digest_alg", "sha256"),
            ("digest", &BASE64.encode(&digest)),
        ])
        .await?;

    assert_eq!(attribute(&response, "d"), Some("example.org"));
    assert_eq!(attribute(&response, "s"), Some("sel1"));
    assert_eq!(attribute(&response, "reason"), None);
    let signature = BASE64.decode(attribute(&response, "b").unwrap())?;
    assert_eq!(signature.len(), 128);
    assert!(verify_rsa_signature(
        keys::RSA_1024_PEM,
        "sha256",
        &digest,
        &signature
    )?);

    instance.halt().await?;
    Ok(())
}

// With per-selector hash constraints, the requested algorithm steers
// which selector is chosen.
#[tokio::test]
#[tracing_test::traced_test]
async fn hash_constraints_select_the_selector() -> anyhow::Result<()> {
    let sha1_only = RecordConfig {
        h: Some("sha1".to_string()),
        ..Default::default()
    };
    let sha256_only = RecordConfig {
        h: Some("sha256".to_string()),
        ..Default::default()
    };
    let instance = InstanceBuilder::new()
        .with_key_record("example.org", "sel1", keys::RSA_1024_PEM, sha1_only)
        .with_key_record("example.org", "sel2", keys::RSA_1024_ALT_PEM, sha256_only)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("sig.a", "rsa-sha256"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;
    assert_eq!(attribute(&response, "sig.s"), Some("sel2"));

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("sig.a", "rsa-sha1"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;
    assert_eq!(attribute(&response, "sig.s"), Some("sel1"));

    instance.halt().await?;
    Ok(())
}

// A leading-dot tag-map entry rewrites subdomain senders onto the parent
// signing domain.
#[tokio::test]
#[tracing_test::traced_test]
async fn subdomain_rewrite() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.com", "main", keys::RSA_2048_PEM)
        .with_sender_map(&[(".example.com", &[("d", "example.com")])])
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("candidate", "author <bob@mail.example.com>"),
        ])
        .await?;
    assert_eq!(attribute(&response, "sig.d"), Some("example.com"));
    assert_eq!(attribute(&response, "sig.s"), Some("main"));

    instance.halt().await?;
    Ok(())
}

// Without a matching key, choose_key returns the option set it gathered
// but no selector and no chosen candidate, and a later sign request is
// rejected.
#[tokio::test]
#[tracing_test::traced_test]
async fn no_key_available() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("candidate", "author <x@unknown.test>"),
        ])
        .await?;
    assert_eq!(attribute(&response, "sig.s"), None);
    assert_eq!(attribute(&response, "chosen_candidate"), None);
    assert_eq!(attribute(&response, "sig.d"), Some("unknown.test"));

    let digest = sha256(b"hello\n");
    let response = client
        .request(&[
            ("request", "sign"),
            ("d", "unknown.test"),
            ("s", "anything"),
            ("digest_alg", "sha256"),
            ("digest", &BASE64.encode(&digest)),
        ])
        .await?;
    assert_eq!(
        attribute(&response, "reason"),
        Some("cannot sign, signing key not available")
    );
    assert_eq!(attribute(&response, "b"), None);

    instance.halt().await?;
    Ok(())
}

// Two requests pipelined on one connection are answered in order, each
// with its own frame.
#[tokio::test]
#[tracing_test::traced_test]
async fn pipelined_requests() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    client
        .send(&[
            ("request", "choose_key"),
            ("request_id", "first"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;
    client
        .send(&[
            ("request", "choose_key"),
            ("request_id", "second"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;

    let first = client.read_response().await?;
    let second = client.read_response().await?;
    assert_eq!(attribute(&first, "request_id"), Some("first"));
    assert_eq!(attribute(&second, "request_id"), Some("second"));
    assert_eq!(attribute(&second, "sig.s"), Some("sel1"));

    instance.halt().await?;
    Ok(())
}

// The second candidate wins when the first has no declared key.
#[tokio::test]
#[tracing_test::traced_test]
async fn candidate_fallback() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[
            ("request", "choose_key"),
            ("candidate", "author <alice@elsewhere.test>"),
            ("candidate", "sender <bob@example.org>"),
        ])
        .await?;
    assert_eq!(
        attribute(&response, "chosen_candidate"),
        Some("sender bob@example.org")
    );
    assert_eq!(attribute(&response, "sig.d"), Some("example.org"));

    instance.halt().await?;
    Ok(())
}

// Unknown request types keep the connection alive and carry a reason.
#[tokio::test]
#[tracing_test::traced_test]
async fn unknown_request_type() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    let response = client
        .request(&[("request", "frobnicate"), ("request_id", "9")])
        .await?;
    assert_eq!(attribute(&response, "request_id"), Some("9"));
    assert_eq!(attribute(&response, "reason"), Some("unknown request type"));

    // The connection is still usable.
    let response = client
        .request(&[
            ("request", "choose_key"),
            ("candidate", "author <u@example.org>"),
        ])
        .await?;
    assert_eq!(attribute(&response, "sig.s"), Some("sel1"));

    instance.halt().await?;
    Ok(())
}

// Malformed lines are skipped without poisoning the request around them.
#[tokio::test]
#[tracing_test::traced_test]
async fn malformed_lines_are_skipped() -> anyhow::Result<()> {
    let instance = InstanceBuilder::new()
        .with_key("example.org", "sel1", keys::RSA_1024_PEM)
        .build()
        .await?;
    let mut client = instance.connect().await?;

    client.send_raw("request=choose_key\r\n").await?;
    client.send_raw("this line has no separator\r\n").await?;
    client
        .send_raw("candidate=author <u@example.org>\r\n\r\n")
        .await?;
    let response = client.read_response().await?;
    assert_eq!(attribute(&response, "sig.s"), Some("sel1"));

    instance.halt().await?;
    Ok(())
}
