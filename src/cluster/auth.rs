use md5::{Digest, Md5};

/// Computes the key for the nonce/digest authentication handshake:
/// `md5(nonce + username + md5(username + ":mongo:" + password))`, all
/// hex-encoded lowercase.
pub(crate) fn build_basic_auth_digest(username: &str, password: &str, nonce: &str) -> String {
    let password_digest = hex::encode(Md5::digest(format!("{}:mongo:{}", username, password)));
    hex::encode(Md5::digest(format!(
        "{}{}{}",
        nonce, username, password_digest
    )))
}
