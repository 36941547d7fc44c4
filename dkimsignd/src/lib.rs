// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# dkimsignd

dkimsignd is a DKIM signing oracle for a mail-filtering process. The mail
scanner parses attacker-supplied messages and computes canonicalized
digests, but it never touches private key material: the keys live in this
daemon, which typically runs under its own unprivileged identity and
optionally inside a chroot.

The two halves of a signing operation map onto the two request types:

* `choose_key` — given an ordered list of candidate sender identities and
  optional signature-tag hints, walk the configured sender tag-maps, pick
  the first candidate for which a compatible signing key is declared, and
  return the merged set of DKIM signature tags.

* `sign` — given the message digest the client computed, plus the
  `(domain, selector)` pair chosen earlier, return an RSASSA-PKCS1-v1_5
  signature over that digest.

The client assembles the final `DKIM-Signature:` header itself; this
service only chooses tags and signs digests.

## Wire protocol

Communication is a line-oriented attribute/value exchange in the style of
AM.PDP: percent-encoded `name=value` lines terminated by CR LF, with an
empty line closing each request and each response. Requests on one
connection are answered strictly in order, so clients may pipeline.

## Components

[`server::keystore`] declares, deduplicates, and indexes the signing keys;
[`server::options`] resolves candidate senders against the ordered
tag-maps; [`protocol`] implements the codec; [`server::service`] accepts
connections and runs the per-connection request loop.
*/

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

/// Turn termination signals into a graceful shutdown.
///
/// The first SIGTERM or SIGINT cancels `halt_token`: the listener stops
/// accepting connections and requests already in flight finish before the
/// process exits. Repeated signals are harmless; the shutdown is already
/// under way.
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm = signal(SignalKind::terminate())
        .context("failed to install the SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt())
        .context("failed to install the SIGINT handler")?;

    loop {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "shutting down; draining open connections");
        halt_token.cancel();
    }
}
