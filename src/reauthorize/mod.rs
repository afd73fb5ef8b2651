//! Reauthorize subsystem — the crypt1 primitive (C8) plus the seqpacket
//! bridge that carries it between local setuid helpers and the gateway (C9).
//!
//! Grounded directly on `examples/original_source/src/reauthorize/reauthorize.c`
//! (`parse_salt`, `generate_salt`, `reauthorize_prepare`,
//! `build_reauthorize_challenge`, `perform_reauthorize_validate`,
//! `reauthorize_type`, `reauthorize_user`, `reauthorize_crypt1`) and
//! `examples/original_source/src/agent/cockpitreauthorize.c` for the bridge
//! half. The kernel keyring dependency is substituted per spec.md §9's
//! explicit Open Question allowance; see [`keystore`].

pub mod bridge;
pub mod core;
pub mod keystore;

pub use bridge::{ReauthorizeBridge, ReauthorizeHandle};
pub use core::{challenge_kind, crypt1, perform, prepare, user, PerformOutcome};
pub use keystore::Keystore;
