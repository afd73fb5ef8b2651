//! Keyring substitute — spec.md §9 explicitly allows a portable stand-in for
//! the Linux kernel keyring "provided the semantics in §6 are preserved"
//! (per-session scope, permission bits, opaque address storage). Two entries
//! are modeled: `reauthorize/secret/<user>` (a crypt secret string) and
//! `reauthorize/socket` (the bridge's listening socket path).
//!
//! Grounded directly on the teacher's `keyring.rs`: the `keyring` crate (OS
//! keychain / D-Bus Secret Service) in production, and a permission-guarded
//! (owner-only) file under the session runtime directory when
//! [`crate::config::is_test_mode`] is set.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::error::Problem;

const SERVICE: &str = "cockpit-bridge-reauthorize";

/// Storage for the two reauthorize keyring entries. Routes to the real OS
/// keyring/Secret Service in production, or a permission-guarded file store
/// under the session runtime directory in test mode — mirroring the
/// teacher's `should_skip_keyring()` split.
#[derive(Debug, Clone)]
pub struct Keystore {
    file_dir: Option<PathBuf>,
}

impl Keystore {
    /// Build a keystore, resolving the file-backed substitute directory
    /// eagerly so later operations don't have to handle a missing runtime
    /// dir as a surprise failure.
    pub fn open() -> std::io::Result<Self> {
        let file_dir =
            if crate::config::is_test_mode() { Some(crate::config::runtime_dir()?) } else { None };
        Ok(Self { file_dir })
    }

    /// Store the crypt secret for `user`, replacing any prior value.
    pub fn put_secret(&self, user: &str, secret: &str) -> Result<(), Problem> {
        let name = format!("reauthorize/secret/{user}");
        match &self.file_dir {
            Some(dir) => write_private_file(&dir.join(file_name(&name)), secret.as_bytes()),
            None => {
                let entry =
                    keyring::Entry::new(SERVICE, &name).map_err(|_| Problem::InternalError)?;
                entry.set_password(secret).map_err(|_| Problem::InternalError)
            }
        }
    }

    /// Look up the crypt secret for `user`, if one was ever installed.
    #[must_use]
    pub fn get_secret(&self, user: &str) -> Option<String> {
        let name = format!("reauthorize/secret/{user}");
        match &self.file_dir {
            Some(dir) => std::fs::read_to_string(dir.join(file_name(&name))).ok(),
            None => keyring::Entry::new(SERVICE, &name).ok()?.get_password().ok(),
        }
    }

    /// Advertise the bridge's listening socket path for local helpers to
    /// discover.
    pub fn put_socket_path(&self, path: &str) -> Result<(), Problem> {
        const NAME: &str = "reauthorize/socket";
        match &self.file_dir {
            Some(dir) => write_private_file(&dir.join(file_name(NAME)), path.as_bytes()),
            None => {
                let entry =
                    keyring::Entry::new(SERVICE, NAME).map_err(|_| Problem::InternalError)?;
                entry.set_password(path).map_err(|_| Problem::InternalError)
            }
        }
    }

    /// Look up the bridge's advertised listening socket path.
    #[must_use]
    pub fn get_socket_path(&self) -> Option<String> {
        const NAME: &str = "reauthorize/socket";
        match &self.file_dir {
            Some(dir) => std::fs::read_to_string(dir.join(file_name(NAME))).ok(),
            None => keyring::Entry::new(SERVICE, NAME).ok()?.get_password().ok(),
        }
    }
}

/// Keyring entry names contain `/`; flatten that into a filesystem-safe name
/// for the file-backed substitute.
fn file_name(entry_name: &str) -> String {
    entry_name.replace('/', "_")
}

fn write_private_file(path: &std::path::Path, data: &[u8]) -> Result<(), Problem> {
    std::fs::write(path, data).map_err(|e| Problem::from_io_error(&e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Problem::from_io_error(&e))
}
