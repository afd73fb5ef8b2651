//! Reauthorize bridge — C9. Listens on a per-session `SOCK_SEQPACKET` socket,
//! advertises its address via the [`Keystore`], and bridges each connected
//! local helper's challenge/response round-trip through the control channel
//! via a monotonically increasing cookie.
//!
//! Grounded on `examples/original_source/src/agent/cockpitreauthorize.c`'s
//! accept-a-caller / correlate-by-cookie / forward-response shape, and the
//! teacher's `broker/connection.rs` per-connection task spawned off an
//! accept loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::keystore::Keystore;
use crate::error::Problem;
use crate::transport::TransportHandle;

const MAX_CHALLENGE_LEN: usize = 4096;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<String>>>>;

/// Cheap, cloneable handle the router hands `authorize` control commands to.
#[derive(Clone)]
pub struct ReauthorizeHandle {
    transport: TransportHandle,
    pending: PendingMap,
    next_cookie: Arc<AtomicI64>,
}

impl ReauthorizeHandle {
    /// Route a gateway `{command: "authorize", cookie, response}` message to
    /// its waiting caller, or close the transport if the message itself is
    /// malformed.
    pub fn handle_gateway_message(&self, value: serde_json::Value) {
        let Some(cookie) = value.get("cookie").and_then(serde_json::Value::as_i64) else {
            self.transport.close(Some(Problem::ProtocolError));
            return;
        };
        if cookie < 0 {
            self.transport.close(Some(Problem::ProtocolError));
            return;
        }
        let Some(response) = value.get("response").and_then(serde_json::Value::as_str) else {
            self.transport.close(Some(Problem::ProtocolError));
            return;
        };

        let sender = self.pending.lock().expect("pending map lock").remove(&cookie);
        match sender {
            Some(sender) => {
                let _ = sender.send(response.to_owned());
            }
            None if cookie < self.next_cookie.load(Ordering::Acquire) => {
                log::warn!("authorize response for already-handled cookie {cookie}");
            }
            None => {
                // Cookie was never issued; the caller that would have
                // wanted it is long gone. Silently discarded per spec.
            }
        }
    }
}

/// Owns the listening socket; [`ReauthorizeBridge::run`] drives accepted
/// callers until the listener itself fails.
pub struct ReauthorizeBridge {
    listener: tokio_seqpacket::UnixSeqpacketListener,
    socket_path: PathBuf,
    transport: TransportHandle,
    pending: PendingMap,
    next_cookie: Arc<AtomicI64>,
}

impl ReauthorizeBridge {
    /// Bind the listening socket at `socket_path`, advertise it via
    /// `keystore`, and return the bridge plus the handle the router uses to
    /// deliver gateway responses.
    pub fn bind(
        socket_path: PathBuf,
        transport: TransportHandle,
        keystore: &Keystore,
    ) -> std::io::Result<(Self, ReauthorizeHandle)> {
        // A stale socket file from a crashed prior run must not block bind.
        let _ = std::fs::remove_file(&socket_path);
        let listener = tokio_seqpacket::UnixSeqpacketListener::bind(&socket_path)?;
        set_owner_only(&socket_path)?;

        if let Some(path_str) = socket_path.to_str() {
            let _ = keystore.put_socket_path(path_str);
        }

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let next_cookie = Arc::new(AtomicI64::new(1));
        let handle = ReauthorizeHandle {
            transport: transport.clone(),
            pending: pending.clone(),
            next_cookie: next_cookie.clone(),
        };
        let bridge = Self { listener, socket_path, transport, pending, next_cookie };
        Ok((bridge, handle))
    }

    /// Accept callers until the listener errors out (session shutdown).
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok(conn) => {
                    let transport = self.transport.clone();
                    let pending = self.pending.clone();
                    let next_cookie = self.next_cookie.clone();
                    tokio::spawn(async move {
                        serve_caller(conn, transport, pending, next_cookie).await;
                    });
                }
                Err(err) => {
                    log::warn!("reauthorize listener closed: {err}");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn set_owner_only(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

/// Drive one connected helper through as many challenge/response rounds as
/// it sends, per spec.md §4.8's per-caller state machine.
async fn serve_caller(
    conn: tokio_seqpacket::UnixSeqpacket,
    transport: TransportHandle,
    pending: PendingMap,
    next_cookie: Arc<AtomicI64>,
) {
    let mut buf = vec![0u8; MAX_CHALLENGE_LEN];
    loop {
        let n = match conn.recv(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let challenge = &buf[..n];
        if challenge.is_empty() || challenge.contains(&0) {
            log::warn!("reauthorize caller sent an invalid challenge; dropping connection");
            return;
        }
        let Ok(challenge) = std::str::from_utf8(challenge) else {
            log::warn!("reauthorize caller sent non-UTF8 challenge; dropping connection");
            return;
        };

        let cookie = next_cookie.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        pending.lock().expect("pending map lock").insert(cookie, tx);

        let sent = transport.send_control(&serde_json::json!({
            "command": "authorize",
            "cookie": cookie,
            "challenge": challenge,
        }));
        if !sent {
            pending.lock().expect("pending map lock").remove(&cookie);
            return;
        }

        let Ok(response) = rx.await else {
            // Transport dropped without ever answering (e.g. shutdown).
            return;
        };
        if conn.send(response.as_bytes()).await.is_err() {
            return;
        }
    }
}
