//! Sealing of post-auth traffic with the session key.

use brine_crypto::{decrypt, encrypt, Nonce, SessionKey};
use brine_storage::MinionId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::{PubFrame, PublishLoad, SealedMessage};

#[derive(Debug, Error)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed nonce")]
    Nonce,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

fn publish_aad(version: u64) -> Vec<u8> {
    format!("publish:{}", version).into_bytes()
}

/// Seal a message exchanged with one minion (`aad` = minion id).
pub fn seal<T: Serialize>(
    key: &SessionKey,
    session_version: u64,
    id: &MinionId,
    msg: &T,
) -> Result<SealedMessage, SealError> {
    let plaintext = serde_json::to_vec(msg)?;
    let (nonce, ct) = encrypt(&plaintext, key, id.0.as_bytes()).map_err(|_| SealError::Encrypt)?;
    Ok(SealedMessage {
        id: id.clone(),
        session_version,
        nonce: nonce.0.to_vec(),
        ciphertext: ct.0,
    })
}

pub fn open<T: DeserializeOwned>(key: &SessionKey, sealed: &SealedMessage) -> Result<T, SealError> {
    let nonce = Nonce::from_slice(&sealed.nonce).map_err(|_| SealError::Nonce)?;
    let plaintext = decrypt(&sealed.ciphertext, &nonce, key, sealed.id.0.as_bytes())
        .map_err(|_| SealError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

pub fn seal_publish(
    key: &SessionKey,
    session_version: u64,
    load: &PublishLoad,
) -> Result<PubFrame, SealError> {
    let plaintext = serde_json::to_vec(load)?;
    let (nonce, ct) =
        encrypt(&plaintext, key, &publish_aad(session_version)).map_err(|_| SealError::Encrypt)?;
    Ok(PubFrame {
        session_version,
        nonce: nonce.0.to_vec(),
        ciphertext: ct.0,
    })
}

pub fn open_publish(key: &SessionKey, frame: &PubFrame) -> Result<PublishLoad, SealError> {
    let nonce = Nonce::from_slice(&frame.nonce).map_err(|_| SealError::Nonce)?;
    let plaintext = decrypt(
        &frame.ciphertext,
        &nonce,
        key,
        &publish_aad(frame.session_version),
    )
    .map_err(|_| SealError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
