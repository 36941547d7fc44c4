// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use dkimsignd::{
    config::load_config,
    server::{config::Config, service::Server},
};
use nix::unistd::{Gid, Group, Uid, User};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

// The path, relative to CONFIGURATION_DIRECTORY, of the default config
// file location.
const DEFAULT_CONFIG: &str = "dkimsignd/dkimsignd.toml";

/// The dkimsignd DKIM signing oracle.
///
/// The daemon loads its signing keys, binds the configured socket, and then
/// sheds privileges: when started as root it chroots (if configured) and
/// switches to the configured unprivileged user before accepting the first
/// connection. The mail filter connects over the socket and never sees the
/// key material.
///
/// All behavior is driven by the configuration file; there are no
/// subcommands. Use --dump-config to see the effective configuration.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the service's configuration file.
    ///
    /// If no path is provided, CONFIGURATION_DIRECTORY is consulted and the
    /// built-in defaults are used as a last resort.
    #[arg(long, short, env = "DKIMSIGND_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR. When unset, the configuration
    /// file's log_level (the historical 0-5 scale) picks the default.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "DKIMSIGND_LOG")]
    log_filter: Option<String>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let config = load_config::<Config>(opts.config, Path::new(DEFAULT_CONFIG))?;

    let log_filter = opts
        .log_filter
        .unwrap_or_else(|| format!("warn,dkimsignd={}", level_directive(config.log_level)));
    let log_filter = EnvFilter::builder().parse(&log_filter).context(
        "DKIMSIGND_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    if opts.dump_config {
        println!("{config}");
        return Ok(());
    }

    // Keys are loaded and the socket is bound while we may still be root;
    // everything after this point runs unprivileged.
    let server = Server::new(config.clone())?;

    if let Some(path) = &config.pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write PID file {}", path.display()))?;
    }
    if let Some(directory) = &config.chroot {
        nix::unistd::chroot(directory.as_path())
            .with_context(|| format!("failed to chroot into {}", directory.display()))?;
        std::env::set_current_dir("/").context("failed to chdir after chroot")?;
        tracing::info!(directory = %directory.display(), "entered chroot");
    }
    drop_privileges(&config).context("drop_privileges")?;
    lock_memory();

    // The privilege transition MUST happen before any threads are spawned,
    // which is why the tokio runtime is built by hand afterwards.
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?
        .block_on(async move {
            let listener = server.run();
            tokio::spawn(dkimsignd::signal_handler(listener.halt_token()));
            listener.wait_to_finish().await
        })?;
    tracing::info!("service shut down cleanly");
    Ok(())
}

/// Switch to the configured unprivileged identity.
///
/// Started as root, the configured `user` is mandatory and both the group
/// and user IDs are changed. Started unprivileged, a configured `user`
/// must match the current identity.
fn drop_privileges(config: &Config) -> anyhow::Result<()> {
    let uid = Uid::effective();
    if !uid.is_root() {
        if let Some(user_name) = &config.user {
            let user = User::from_name(user_name)?
                .ok_or_else(|| anyhow::anyhow!("Invalid user {user_name}"))?;
            if user.uid != uid {
                anyhow::bail!(
                    "configured user '{user_name}' resolves to uid {} \
                     which doesn't match your uid {uid}, and you are not root",
                    user.uid
                );
            }
        }

        return Ok(());
    }

    let user_name = config.user.as_ref().ok_or_else(|| {
        anyhow::anyhow!("when running as root, `user` must be set in the configuration")
    })?;
    let user =
        User::from_name(user_name)?.ok_or_else(|| anyhow::anyhow!("Invalid user {user_name}"))?;
    let gid = match &config.group {
        Some(group_name) => {
            Group::from_name(group_name)?
                .ok_or_else(|| anyhow::anyhow!("Invalid group {group_name}"))?
                .gid
        }
        None => user.gid,
    };

    set_identity(user.uid, gid)?;
    tracing::info!(user = %user_name, "dropped root privileges");
    Ok(())
}

fn set_identity(uid: Uid, gid: Gid) -> anyhow::Result<()> {
    // The group must change first; once the uid is gone, setgid is no
    // longer permitted.
    nix::unistd::setgid(gid).context("setgid")?;
    nix::unistd::setuid(uid).context("setuid")?;
    Ok(())
}

/// Keep the key material out of swap. Not every environment grants
/// CAP_IPC_LOCK, so failure only warns.
fn lock_memory() {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    if let Err(error) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        tracing::warn!(%error, "unable to lock memory; key material may reach swap");
    }
}

/// Map the historical 0-5 log scale onto a tracing level directive.
fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    }
}
