//! Mount binary: parses the CLI, wires up logging, optionally daemonizes,
//! constructs the filesystem, and hands it to `fuser::mount2`.
//!
//! Tracing-subscriber init and top-level `anyhow::Result` style follow
//! `wormhole/src/bin/server/main.rs` and `wormhole/src/bin/wormhole-attach/
//! main.rs`; daemonizing on mount follows `utarfs`'s use of the
//! `daemonize` crate for the same purpose.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use runfs::config::Cli;
use runfs::fs::RunFs;
use runfs::fuse_adapter::FuseAdapter;
use runfs::inode::VerifyPolicy;
use runfs::probe;

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(if cli.debug { Level::TRACE } else { Level::INFO })
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "runfs: startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    // probe self-check: confirm /proc (or the platform equivalent) is
    // readable for our own pid before doing anything else. A filesystem
    // that can never validate an owner is useless to mount at all.
    probe::probe(std::process::id() as i32).context("probe setup: self-check failed")?;

    if !cli.foreground {
        daemonize::Daemonize::new()
            .start()
            .context("daemonize")?;
    }

    let fs = RunFs::new(VerifyPolicy::default());
    let adapter = FuseAdapter::new(fs);

    let options = cli.mount_options();
    fuser::mount2(adapter, &cli.mountpoint, &options)
        .with_context(|| format!("kernel bridge: mount2 on {} failed", cli.mountpoint.display()))?;

    Ok(())
}
