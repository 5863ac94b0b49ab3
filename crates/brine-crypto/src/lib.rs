use chacha20poly1305::{aead::Aead, KeyInit};
use ed25519_dalek::{Signer, Verifier};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

// ──────────────────────────────────────────────────────────────────────────────
// Session key (shared symmetric key for publish traffic)
// ──────────────────────────────────────────────────────────────────────────────

/// Symmetric key shared by the master with every accepted minion.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Build a key from an unwrapped byte buffer (must be exactly 32 bytes).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != 32 {
            return Err("session key must be 32 bytes");
        }
        let mut array = Zeroizing::new([0u8; 32]);
        array.copy_from_slice(bytes);
        Ok(SessionKey(array))
    }
}

/// Generate a fresh random session key
pub fn generate_session_key() -> SessionKey {
    let mut key = Zeroizing::new([0u8; 32]);
    rand_core::OsRng.fill_bytes(key.as_mut());
    SessionKey(key)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; 24]);

impl Nonce {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != 24 {
            return Err("nonce must be 24 bytes");
        }
        let mut array = [0u8; 24];
        array.copy_from_slice(bytes);
        Ok(Nonce(array))
    }
}

pub struct Ciphertext(pub Vec<u8>);

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("AEAD encryption failed")]
    AeadFailed(chacha20poly1305::aead::Error),
}

/// AEAD encrypt
pub fn encrypt(
    plaintext: &[u8],
    key: &SessionKey,
    aad: &[u8],
) -> Result<(Nonce, Ciphertext), EncryptError> {
    let cipher_key = chacha20poly1305::Key::from(*key.as_bytes());
    let cipher = chacha20poly1305::XChaCha20Poly1305::new(&cipher_key);

    let mut nonce_bytes = [0u8; 24];
    rand_core::OsRng.fill_bytes(&mut nonce_bytes);

    let nonce = chacha20poly1305::XNonce::from(nonce_bytes);
    let ct = cipher
        .encrypt(
            &nonce,
            chacha20poly1305::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(EncryptError::AeadFailed)?;

    Ok((Nonce(nonce_bytes), Ciphertext(ct)))
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("AEAD decryption failed")]
    AeadFailed(chacha20poly1305::aead::Error),
}

/// AEAD decrypt
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    key: &SessionKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    let cipher_key = chacha20poly1305::Key::from(*key.as_bytes());
    let cipher = chacha20poly1305::XChaCha20Poly1305::new(&cipher_key);

    let nonce = chacha20poly1305::XNonce::from(nonce.0);

    let pt = cipher
        .decrypt(
            &nonce,
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(DecryptError::AeadFailed)?;

    Ok(Zeroizing::new(pt))
}

// ──────────────────────────────────────────────────────────────────────────────
// X25519 keypairs for masters and minions
// ──────────────────────────────────────────────────────────────────────────────

/// Identity keypair (X25519)
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random X25519 keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Construct keypair from secret key bytes (e.g., from the pki directory)
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the secret key as bytes (for storage)
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the public key as bytes (for storage and the wire)
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Derive shared secret with the peer's public key (ECDH)
    pub fn shared_secret(&self, their_public: &PublicKey) -> SharedSecret {
        let secret_bytes = self.secret.diffie_hellman(their_public);
        SharedSecret(Zeroizing::new(*secret_bytes.as_bytes()))
    }
}

impl zeroize::ZeroizeOnDrop for Keypair {}

/// Shared secret derived from ECDH
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Construct a public key from bytes (e.g., from a stored key record)
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, &'static str> {
    if bytes.len() != 32 {
        return Err("public key must be 32 bytes");
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(bytes);
    Ok(PublicKey::from(array))
}

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("AEAD encryption failed")]
    AeadFailed(chacha20poly1305::aead::Error),
}

/// Wrap a key (the session key) for a single peer using a shared secret
pub fn wrap_key(
    key: &[u8],
    shared_secret: &SharedSecret,
    aad: &[u8],
) -> Result<(Nonce, Ciphertext), WrapError> {
    let cipher_key = chacha20poly1305::Key::from(*shared_secret.as_bytes());
    let cipher = chacha20poly1305::XChaCha20Poly1305::new(&cipher_key);

    let mut nonce_bytes = [0u8; 24];
    rand_core::OsRng.fill_bytes(&mut nonce_bytes);

    let nonce = chacha20poly1305::XNonce::from(nonce_bytes);
    let ct = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: key, aad })
        .map_err(WrapError::AeadFailed)?;

    Ok((Nonce(nonce_bytes), Ciphertext(ct)))
}

#[derive(Debug, Error)]
pub enum UnwrapError {
    #[error("AEAD decryption failed")]
    AeadFailed(chacha20poly1305::aead::Error),
}

/// Unwrap a key using a shared secret
pub fn unwrap_key(
    wrapped: &[u8],
    nonce: &Nonce,
    shared_secret: &SharedSecret,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    let cipher_key = chacha20poly1305::Key::from(*shared_secret.as_bytes());
    let cipher = chacha20poly1305::XChaCha20Poly1305::new(&cipher_key);

    let nonce = chacha20poly1305::XNonce::from(nonce.0);

    let pt = cipher
        .decrypt(
            &nonce,
            chacha20poly1305::aead::Payload { msg: wrapped, aad },
        )
        .map_err(UnwrapError::AeadFailed)?;

    Ok(Zeroizing::new(pt))
}

// ──────────────────────────────────────────────────────────────────────────────
// Ed25519 master signing key
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed verifying key")]
    MalformedKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed")]
    Invalid,
}

/// Signing keypair the master uses to vouch for its public key.
pub struct SigningKeypair(ed25519_dalek::SigningKey);

impl SigningKeypair {
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand_core::OsRng))
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature produced by [`SigningKeypair::sign`].
pub fn verify_signature(
    verifying_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let key: [u8; 32] = verifying_key
        .try_into()
        .map_err(|_| SignatureError::MalformedKey)?;
    let key =
        ed25519_dalek::VerifyingKey::from_bytes(&key).map_err(|_| SignatureError::MalformedKey)?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::MalformedSignature)?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    key.verify(message, &signature)
        .map_err(|_| SignatureError::Invalid)
}

// ──────────────────────────────────────────────────────────────────────────────
// Hashing utilities
// ──────────────────────────────────────────────────────────────────────────────

/// Digest used for file integrity checks and key fingerprints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::Sha224 => "sha224",
            HashType::Sha256 => "sha256",
            HashType::Sha384 => "sha384",
            HashType::Sha512 => "sha512",
        }
    }

    /// Hex digest of `data`
    pub fn digest_hex(&self, data: &[u8]) -> String {
        match self {
            HashType::Sha224 => hex::encode(Sha224::digest(data)),
            HashType::Sha256 => hex::encode(Sha256::digest(data)),
            HashType::Sha384 => hex::encode(Sha384::digest(data)),
            HashType::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl std::str::FromStr for HashType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha224" => Ok(HashType::Sha224),
            "sha256" => Ok(HashType::Sha256),
            "sha384" => Ok(HashType::Sha384),
            "sha512" => Ok(HashType::Sha512),
            other => Err(format!("unsupported hash type: {}", other)),
        }
    }
}

/// Colon separated hex fingerprint of a public key, e.g. `4f:0a:...`.
///
/// Masters print this so operators can pin it on minions before the first
/// handshake.
pub fn fingerprint(public_key: &[u8], hash_type: HashType) -> String {
    let digest = hash_type.digest_hex(public_key);
    digest
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Compare a presented fingerprint with a pinned one, ignoring case and
/// tolerating a pin written without separators.
pub fn fingerprint_matches(pinned: &str, actual: &str) -> bool {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    normalize(pinned) == normalize(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_round_trip_basic() {
        let key = generate_session_key();

        let plaintext = b"test.ping";
        let aad = b"minion:web01";

        let (nonce, ct) = encrypt(plaintext, &key, aad).unwrap();
        let decrypted = decrypt(&ct.0, &nonce, &key, aad).unwrap();

        assert_eq!(plaintext, &decrypted[..]);
    }

    #[test]
    fn decrypt_fails_with_rotated_key() {
        let old = generate_session_key();
        let new = generate_session_key();
        let (nonce, ct) = encrypt(b"payload", &new, b"pub").unwrap();
        assert!(decrypt(&ct.0, &nonce, &old, b"pub").is_err());
    }

    #[test]
    fn tampering_ciphertext_fails() {
        let key = generate_session_key();
        let (nonce, mut ct) = encrypt(b"hello", &key, b"aad").unwrap();

        ct.0[0] ^= 0x01;

        assert!(decrypt(&ct.0, &nonce, &key, b"aad").is_err());
    }

    #[test]
    fn tampering_aad_fails() {
        let key = generate_session_key();
        let (nonce, ct) = encrypt(b"hello", &key, b"good-aad").unwrap();

        assert!(decrypt(&ct.0, &nonce, &key, b"bad-aad").is_err());
    }

    #[test]
    fn session_key_from_slice_validates_length() {
        assert!(SessionKey::from_slice(&[0u8; 31]).is_err());
        assert!(SessionKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn sensitive_types_impl_zeroize() {
        fn assert_zeroize<T: zeroize::Zeroize>() {}
        assert_zeroize::<SessionKey>();
        assert_zeroize::<SharedSecret>();
    }

    // ───────────────────────────── X25519 Tests ─────────────────────────────

    #[test]
    fn public_key_from_bytes_validates_length() {
        assert!(public_key_from_bytes(&[0u8; 31]).is_err());
        assert!(public_key_from_bytes(&[0u8; 33]).is_err());
        assert!(public_key_from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn ecdh_shared_secret_is_symmetric() {
        let master = Keypair::generate();
        let minion = Keypair::generate();

        let a = master.shared_secret(minion.public_key());
        let b = minion.shared_secret(master.public_key());

        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn session_key_wrap_unwrap_roundtrip() {
        let master = Keypair::generate();
        let minion = Keypair::generate();
        let session = generate_session_key();

        let shared = master.shared_secret(minion.public_key());
        let aad = b"session:web01:3";
        let (nonce, wrapped) = wrap_key(session.as_bytes(), &shared, aad).unwrap();

        let minion_shared = minion.shared_secret(master.public_key());
        let unwrapped = unwrap_key(&wrapped.0, &nonce, &minion_shared, aad).unwrap();

        assert_eq!(&unwrapped[..], session.as_bytes());
    }

    #[test]
    fn key_unwrap_fails_for_other_minion() {
        let master = Keypair::generate();
        let minion = Keypair::generate();
        let eve = Keypair::generate();

        let shared = master.shared_secret(minion.public_key());
        let (nonce, wrapped) = wrap_key(b"secret-key", &shared, b"aad").unwrap();

        let eve_shared = eve.shared_secret(master.public_key());
        assert!(unwrap_key(&wrapped.0, &nonce, &eve_shared, b"aad").is_err());
    }

    // ───────────────────────────── Signing Tests ─────────────────────────────

    #[test]
    fn signature_roundtrip() {
        let signer = SigningKeypair::generate();
        let master = Keypair::generate();
        let sig = signer.sign(&master.public_key_bytes());
        verify_signature(
            &signer.verifying_key_bytes(),
            &master.public_key_bytes(),
            &sig,
        )
        .unwrap();
    }

    #[test]
    fn signature_rejects_other_message() {
        let signer = SigningKeypair::generate();
        let sig = signer.sign(b"master-a");
        assert!(matches!(
            verify_signature(&signer.verifying_key_bytes(), b"master-b", &sig),
            Err(SignatureError::Invalid)
        ));
        assert!(matches!(
            verify_signature(&signer.verifying_key_bytes(), b"master-a", &sig[..10]),
            Err(SignatureError::MalformedSignature)
        ));
    }

    #[test]
    fn signing_key_restores_from_bytes() {
        let signer = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_bytes(&signer.secret_key_bytes());
        assert_eq!(signer.verifying_key_bytes(), restored.verifying_key_bytes());
    }

    // ───────────────────────────── Hashing Tests ─────────────────────────────

    #[test]
    fn fingerprint_is_colon_separated_pairs() {
        let fp = fingerprint(b"master-public-key", HashType::Sha256);
        let parts: Vec<_> = fp.split(':').collect();
        assert_eq!(parts.len(), 32);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn fingerprint_matching_ignores_format() {
        let fp = fingerprint(b"key", HashType::Sha256);
        assert!(fingerprint_matches(&fp, &fp));
        assert!(fingerprint_matches(&fp.replace(':', "").to_uppercase(), &fp));
        let other = fingerprint(b"other", HashType::Sha256);
        assert!(!fingerprint_matches(&other, &fp));
    }

    #[test]
    fn hash_types_have_expected_lengths() {
        assert_eq!(HashType::Sha224.digest_hex(b"x").len(), 56);
        assert_eq!(HashType::Sha256.digest_hex(b"x").len(), 64);
        assert_eq!(HashType::Sha384.digest_hex(b"x").len(), 96);
        assert_eq!(HashType::Sha512.digest_hex(b"x").len(), 128);
        assert_eq!(
            HashType::Sha256.digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_type_parses_from_config() {
        let parsed: HashType = serde_json::from_str("\"sha512\"").unwrap();
        assert_eq!(parsed, HashType::Sha512);
        assert!("md5".parse::<HashType>().is_err());
    }
}
