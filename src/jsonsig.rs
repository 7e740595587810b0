//! Sign and verify JSON payloads with Ed25519. The signature is attached to
//! the payload (which must be a JSON object) in a `"signature"` field; what
//! is signed is the canonical form of the object with that field absent.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;

pub const SIGNATURE_FIELD: &str = "signature";

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("payload must be a JSON object (e.g. {{...}})")]
    NotAnObject,
    #[error("payload already contains a '{SIGNATURE_FIELD}' field; maybe it is already signed")]
    AlreadySigned,
    #[error("'{SIGNATURE_FIELD}' field missing or not a string")]
    MissingSignature,
    #[error("invalid JSON payload: {0}")]
    Json(String),
    #[error("invalid key: {0}")]
    Key(String),
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Create a new Ed25519 key pair as `(public, private)`, both base64.
/// The private key is the 64-byte seed+public form.
pub fn generate_keys() -> (String, String) {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let public = BASE64.encode(signing_key.verifying_key().to_bytes());
    let private = BASE64.encode(signing_key.to_keypair_bytes());
    (public, private)
}

/// Canonical bytes of a JSON object: serde_json object maps are ordered, so
/// re-serializing a parsed value emits keys in lexicographic order (the
/// RFC 8785 input form used for signing).
fn canonicalize(value: &Value) -> Result<Vec<u8>, SignError> {
    serde_json::to_vec(value).map_err(|e| SignError::Json(e.to_string()))
}

/// Sign a JSON object and return it re-emitted (pretty-printed) with the
/// base64 signature inserted as a `"signature"` field.
pub fn sign(payload: &[u8], private_key_b64: &str) -> Result<Vec<u8>, SignError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| SignError::Json(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(SignError::NotAnObject);
    };
    if map.contains_key(SIGNATURE_FIELD) {
        return Err(SignError::AlreadySigned);
    }

    let canonical = canonicalize(&Value::Object(map.clone()))?;

    let key_bytes = BASE64
        .decode(private_key_b64)
        .map_err(|e| SignError::Key(e.to_string()))?;
    let keypair: [u8; 64] = key_bytes
        .try_into()
        .map_err(|_| SignError::Key("private key must be 64 bytes".to_string()))?;
    let signing_key = SigningKey::from_keypair_bytes(&keypair)
        .map_err(|e| SignError::Key(e.to_string()))?;

    let signature = signing_key.sign(&canonical);
    map.insert(
        SIGNATURE_FIELD.to_string(),
        Value::String(BASE64.encode(signature.to_bytes())),
    );

    serde_json::to_vec_pretty(&Value::Object(map)).map_err(|e| SignError::Json(e.to_string()))
}

/// Verify a signed JSON object. The `"signature"` field is stripped, the
/// remainder re-canonicalized, and the Ed25519 signature checked against it.
pub fn verify(signed_payload: &[u8], public_key_b64: &str) -> Result<bool, SignError> {
    let value: Value =
        serde_json::from_slice(signed_payload).map_err(|e| SignError::Json(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(SignError::NotAnObject);
    };
    let Some(Value::String(signature_b64)) = map.remove(SIGNATURE_FIELD) else {
        return Err(SignError::MissingSignature);
    };

    let canonical = canonicalize(&Value::Object(map))?;

    let key_bytes = BASE64
        .decode(public_key_b64)
        .map_err(|e| SignError::Key(e.to_string()))?;
    let key_array: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| SignError::Key("public key must be 32 bytes".to_string()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|e| SignError::Key(e.to_string()))?;

    let signature_bytes = BASE64
        .decode(&signature_b64)
        .map_err(|_| SignError::VerificationFailed)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| SignError::VerificationFailed)?;

    verifying_key
        .verify(&canonical, &signature)
        .map_err(|_| SignError::VerificationFailed)?;
    Ok(true)
}
