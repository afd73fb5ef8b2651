//! Process-wide configuration — the small amount of environment spec.md §6
//! says the bridge depends on: the session runtime directory used for the
//! reauthorize socket, a sanitized `PATH` for anything it spawns, and a test
//! escape hatch that keeps tests off the real OS keyring/Secret Service.
//!
//! Grounded on the teacher's `env.rs` (a single `BOTSTER_ENV`-driven
//! environment enum gating keyring-vs-file storage) and `keyring.rs`'s
//! `credentials_file_path()`, narrowed to what this crate actually needs.

use std::path::PathBuf;

/// Env var that, when set to any value, routes reauthorize secret/socket
/// storage to a permission-guarded file under [`runtime_dir`] instead of the
/// real OS keyring/Secret Service. Mirrors the teacher's `BOTSTER_ENV=test`.
const TEST_ENV_VAR: &str = "COCKPIT_BRIDGE_TEST";

/// `true` if reauthorize storage should bypass the OS keyring.
#[must_use]
pub fn is_test_mode() -> bool {
    cfg!(test) || std::env::var_os(TEST_ENV_VAR).is_some()
}

/// The session's runtime directory: `$XDG_RUNTIME_DIR` if set, otherwise a
/// per-uid directory under the system temp dir. Created with owner-only
/// permissions if it doesn't already exist.
pub fn runtime_dir() -> std::io::Result<PathBuf> {
    let dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            // SAFETY: getuid() has no preconditions and never fails.
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("cockpit-bridge-{uid}"))
        }
    };
    ensure_private_dir(&dir)?;
    Ok(dir)
}

fn ensure_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::create_dir(dir) {
        Ok(()) => std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// A sanitized `PATH` for anything the bridge spawns on the user's behalf,
/// independent of whatever `PATH` the gateway happened to launch it with.
#[must_use]
pub fn sanitized_path() -> &'static str {
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
}

/// Default path for the reauthorize bridge's `SOCK_SEQPACKET` listener, used
/// when the caller doesn't supply one explicitly.
pub fn default_reauthorize_socket_path() -> std::io::Result<PathBuf> {
    Ok(runtime_dir()?.join("cockpit-reauthorize.sock"))
}
