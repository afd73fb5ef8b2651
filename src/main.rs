//! Process entry point. Wires the framed transport, the channel router, and
//! the reauthorize bridge into one current-thread `tokio` runtime, per
//! spec.md §5's single-loop invariant.
//!
//! Grounded on the teacher's `mcp_serve::run` (`Runtime::new()` +
//! `block_on(run_async())` wrapping a socket bridge) and `main.rs`'s
//! `mimalloc` global allocator and `env_logger` setup.

use anyhow::{Context, Result};
use mimalloc::MiMalloc;

use cockpit_bridge::channel::router::Router;
use cockpit_bridge::config;
use cockpit_bridge::reauthorize::{Keystore, ReauthorizeBridge};
use cockpit_bridge::transport::Transport;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    // stderr is the human log stream; the transport itself never touches it.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the current-thread runtime")?;
    rt.block_on(run_async())
}

async fn run_async() -> Result<()> {
    ignore_sigpipe().context("ignoring SIGPIPE")?;
    let wire = redirect_stdout_to_log().context("redirecting stdout")?;

    let io = tokio::io::join(tokio::io::stdin(), wire);
    let (transport, handle, events) = Transport::new(io);
    tokio::spawn(transport.run());

    let keystore = Keystore::open().context("opening the keystore")?;
    let socket_path =
        config::default_reauthorize_socket_path().context("resolving the reauthorize socket path")?;
    let (bridge, reauthorize) = ReauthorizeBridge::bind(socket_path, handle.clone(), &keystore)
        .context("binding the reauthorize bridge socket")?;
    tokio::spawn(bridge.run());

    let router = Router::new(handle.clone(), events, Some(reauthorize));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;

    tokio::select! {
        () = router.run() => {}
        _ = sigterm.recv() => {
            log::info!("received SIGTERM, shutting down");
            handle.close(None);
        }
    }
    Ok(())
}

/// The library's stdout writes (panics, stray `println!`s from a dependency)
/// must never land on the wire. Per spec.md §6's process convention: dup the
/// original stdout fd aside as the transport's write end, then repoint fd 1
/// at fd 2 so anything still writing to "stdout" ends up as log output.
fn redirect_stdout_to_log() -> Result<tokio::fs::File> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: dup(2) on a valid, always-open fd (1) either returns a fresh
    // valid fd or -1; we check the return value before using it.
    let wire_fd = unsafe { libc::dup(1) };
    if wire_fd < 0 {
        return Err(std::io::Error::last_os_error()).context("dup(1) failed");
    }
    // SAFETY: dup2(2, 1) makes fd 1 an alias of fd 2 (always open); it
    // cannot invalidate any fd we already hold, including wire_fd above.
    if unsafe { libc::dup2(2, 1) } < 0 {
        return Err(std::io::Error::last_os_error()).context("dup2(2, 1) failed");
    }

    // SAFETY: wire_fd was just returned by a successful dup(2) above and is
    // not owned or closed by anything else in this process.
    let file = unsafe { std::fs::File::from_raw_fd(wire_fd) };
    Ok(tokio::fs::File::from_std(file))
}

fn ignore_sigpipe() -> Result<()> {
    // SAFETY: signal(2) with SIGPIPE/SIG_IGN has no preconditions beyond a
    // valid signal number, which this is.
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error()).context("signal(SIGPIPE, SIG_IGN) failed");
    }
    Ok(())
}
