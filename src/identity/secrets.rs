//! One-time codes, password hashing and bearer tokens.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::identity::model::Role;

/// Number of digits in a verification code.
pub const CODE_DIGITS: usize = 6;

/// Generate a zero-padded numeric verification code.
pub fn generate_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{code:0width$}", width = CODE_DIGITS)
}

/// Scope a code hash is bound to. A pending session is unique per
/// (email, role), and a reused session keeps its id while its code rotates.
pub fn code_scope(email: &str, role: Role) -> String {
    format!("{email}:{role}")
}

/// Hash a code bound to its scope, so a code issued for one identity is
/// useless against another.
pub fn hash_code(scope: &str, code: &str) -> String {
    sha256_hex(format!("{scope}:{}", code.trim()).as_bytes())
}

/// Argon2id PHC string for a password.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Mint a random 256-bit bearer token.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Storage form of a bearer token.
pub fn hash_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
