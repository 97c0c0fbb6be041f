use rand::RngCore;
use rand::rngs::OsRng;

/// Returns an opaque token of the form `<prefix>_<hex>` with `random_bytes`
/// bytes of OS randomness behind it.
///
/// When the OS RNG fails the function degrades to the deterministic
/// `<prefix>_fallback` value instead of crashing the caller; such tokens must
/// not be treated as secret.
pub fn random_token(prefix: &str, random_bytes: usize) -> String {
    let mut buf = vec![0u8; random_bytes];
    if let Err(err) = OsRng.try_fill_bytes(&mut buf) {
        tracing::error!(%prefix, error = %err, "OS RNG unavailable, issuing fallback token");
        return format!("{prefix}_fallback");
    }
    format!("{}_{}", prefix, hex::encode(buf))
}
