//! Selective field encryption over messages.
//!
//! `encrypt_fields` strips the named dotted-path fields out of a message,
//! rebuilds them in a temporary object with the same hierarchical shape,
//! and stores the AES-128-CBC ciphertext of that object's JSON (base64) in
//! the envelope. `decrypt_fields` reverses it. `re_encrypt` swaps the
//! ciphertext from one secret to another without merging plaintext back
//! into the message, which is what the central post office does when
//! forwarding.
//!
//! On error the message may be left partially stripped; callers treat an
//! error as fatal for that message.

use aes::Aes128;
use base64::{Engine, engine::general_purpose::STANDARD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use courier_proto::{Message, dotted};
use serde_json::{Map, Value};

use crate::{
    derive::{derive_iv, derive_key},
    error::CryptoError,
};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

fn encrypt_bytes(plain: &[u8], secret: &[u8], from: &str, id: &str) -> Vec<u8> {
    let key = derive_key(secret, from, id);
    let iv = derive_iv(from, id);
    Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

fn decrypt_bytes(
    ciphertext: &[u8],
    secret: &[u8],
    from: &str,
    id: &str,
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_key(secret, from, id);
    let iv = derive_iv(from, id);
    Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed {
            reason: "bad padding; wrong secret or corrupted ciphertext",
        })
}

/// Encrypt the named dotted-path fields under `secret`.
///
/// Every named field must be present; with an empty field list this is a
/// no-op.
///
/// # Errors
///
/// `CryptoError::MissingField` if a named field is absent (including a
/// field shadowed by an earlier, shorter path in the same call).
pub fn encrypt_fields(
    message: &mut Message,
    secret: &[u8],
    fields: &[&str],
) -> Result<(), CryptoError> {
    if fields.is_empty() {
        return Ok(());
    }
    for path in fields {
        if !message.has_dotted(path) {
            return Err(CryptoError::MissingField { path: (*path).to_string() });
        }
    }

    let mut collected = Map::new();
    for path in fields {
        let value = message.remove_dotted(path).ok_or_else(|| CryptoError::MissingField {
            path: (*path).to_string(),
        })?;
        dotted::put(&mut collected, path, value)?;
    }

    let plain = serde_json::to_vec(&Value::Object(collected))?;
    let ciphertext =
        encrypt_bytes(&plain, secret, message.from_addr(), message.id());
    message.set_secure_payload(STANDARD.encode(ciphertext));
    Ok(())
}

/// Decrypt the encrypted fields under `secret` and merge them back.
///
/// On success the ciphertext is removed from the envelope and the message
/// reads as if it had never been encrypted.
pub fn decrypt_fields(message: &mut Message, secret: &[u8]) -> Result<(), CryptoError> {
    let ciphertext =
        STANDARD.decode(message.secure_payload().ok_or(CryptoError::NotEncrypted)?)?;

    let plain = decrypt_bytes(&ciphertext, secret, message.from_addr(), message.id())?;
    let recovered: Value = serde_json::from_slice(&plain)?;
    let Value::Object(map) = recovered else {
        return Err(CryptoError::DecryptionFailed {
            reason: "recovered payload is not a JSON object",
        });
    };

    message.merge_object(map);
    message.take_secure_payload();
    Ok(())
}

/// Re-wrap the ciphertext from `from_secret` to `to_secret`.
///
/// The recovered plaintext exists only inside this call; the message's
/// fields are never repopulated, so a forwarding hop cannot leak them.
pub fn re_encrypt(
    message: &mut Message,
    from_secret: &[u8],
    to_secret: &[u8],
) -> Result<(), CryptoError> {
    let ciphertext =
        STANDARD.decode(message.secure_payload().ok_or(CryptoError::NotEncrypted)?)?;

    let from = message.from_addr().to_string();
    let id = message.id().to_string();

    let plain = decrypt_bytes(&ciphertext, from_secret, &from, &id)?;
    let rewrapped = encrypt_bytes(&plain, to_secret, &from, &id);
    message.set_secure_payload(STANDARD.encode(rewrapped));
    Ok(())
}

#[cfg(test)]
mod tests {
    use courier_proto::Address;
    use proptest::prelude::*;

    use super::*;

    const SECRET_A: &[u8] = b"alpha secret";
    const SECRET_B: &[u8] = b"beta secret";

    fn sample_message() -> Message {
        let from: Address = "alpha.io".parse().unwrap();
        let to: Address = "beta.io".parse().unwrap();
        let mut m = Message::direct(&from, &to, "login", "1.alpha", false);
        m.put_dotted("cred", "correct-horse-battery").unwrap();
        m.put_dotted("user.name", "kit-the-operator").unwrap();
        m.put_dotted("user.site", "r12").unwrap();
        m
    }

    #[test]
    fn encrypt_strips_fields_and_decrypt_restores_them() {
        let mut m = sample_message();
        let original = m.clone();

        encrypt_fields(&mut m, SECRET_A, &["cred", "user.name"]).unwrap();
        assert!(m.is_encrypted());
        assert!(!m.has_dotted("cred"));
        assert!(!m.has_dotted("user.name"));
        assert!(m.has_dotted("user.site"), "unnamed fields stay in place");

        // Plaintext must not survive anywhere in the wire form.
        let wire = String::from_utf8(m.to_bytes().unwrap()).unwrap();
        assert!(!wire.contains("correct-horse-battery"));
        assert!(!wire.contains("kit-the-operator"));

        decrypt_fields(&mut m, SECRET_A).unwrap();
        assert_eq!(m, original);
    }

    #[test]
    fn missing_field_is_an_error() {
        let mut m = sample_message();
        assert!(matches!(
            encrypt_fields(&mut m, SECRET_A, &["nope"]),
            Err(CryptoError::MissingField { .. })
        ));
    }

    #[test]
    fn empty_field_list_is_a_no_op() {
        let mut m = sample_message();
        encrypt_fields(&mut m, SECRET_A, &[]).unwrap();
        assert!(!m.is_encrypted());
    }

    #[test]
    fn wrong_secret_fails_decryption() {
        let mut m = sample_message();
        encrypt_fields(&mut m, SECRET_A, &["cred"]).unwrap();
        assert!(decrypt_fields(&mut m, SECRET_B).is_err());
    }

    #[test]
    fn decrypt_without_ciphertext_is_an_error() {
        let mut m = sample_message();
        assert!(matches!(
            decrypt_fields(&mut m, SECRET_A),
            Err(CryptoError::NotEncrypted)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut m = sample_message();
        encrypt_fields(&mut m, SECRET_A, &["cred"]).unwrap();

        let mut raw = STANDARD.decode(m.secure_payload().unwrap()).unwrap();
        raw[0] ^= 0xFF;
        m.set_secure_payload(STANDARD.encode(raw));

        assert!(decrypt_fields(&mut m, SECRET_A).is_err());
    }

    #[test]
    fn re_encrypt_switches_secrets_without_exposing_fields() {
        let mut m = sample_message();
        let original = m.clone();

        encrypt_fields(&mut m, SECRET_A, &["cred", "user.name"]).unwrap();
        let under_a = m.secure_payload().unwrap().to_string();

        re_encrypt(&mut m, SECRET_A, SECRET_B).unwrap();
        assert!(!m.has_dotted("cred"), "fields stay stripped across the hop");
        assert_ne!(m.secure_payload().unwrap(), under_a);

        decrypt_fields(&mut m, SECRET_B).unwrap();
        assert_eq!(m, original);
    }

    #[test]
    fn re_encrypt_with_wrong_source_secret_fails() {
        let mut m = sample_message();
        encrypt_fields(&mut m, SECRET_A, &["cred"]).unwrap();
        assert!(re_encrypt(&mut m, SECRET_B, SECRET_A).is_err());
    }

    proptest! {
        /// Round trip holds for arbitrary field values and nesting.
        #[test]
        fn encrypt_decrypt_round_trip(
            cred in "[ -~]{0,64}",
            depth_value in any::<i64>(),
        ) {
            let from: Address = "alpha.io".parse().unwrap();
            let mut m = Message::publish(&from, "t", "9.alpha");
            m.put_dotted("cred", cred).unwrap();
            m.put_dotted("a.b.c", depth_value).unwrap();
            let original = m.clone();

            encrypt_fields(&mut m, SECRET_A, &["cred", "a.b.c"]).unwrap();
            prop_assert!(m.is_encrypted());
            decrypt_fields(&mut m, SECRET_A).unwrap();
            prop_assert_eq!(m, original);
        }

        /// Re-encryption is equivalent to decrypt-under-the-old-secret.
        #[test]
        fn re_encryption_equivalence(payload in "[ -~]{0,64}") {
            let from: Address = "alpha.io".parse().unwrap();
            let mut m = Message::publish(&from, "t", "7.alpha");
            m.put_dotted("payload", payload).unwrap();

            let mut direct = m.clone();
            encrypt_fields(&mut direct, SECRET_A, &["payload"]).unwrap();
            let mut hopped = direct.clone();

            decrypt_fields(&mut direct, SECRET_A).unwrap();

            re_encrypt(&mut hopped, SECRET_A, SECRET_B).unwrap();
            decrypt_fields(&mut hopped, SECRET_B).unwrap();

            prop_assert_eq!(direct, hopped);
        }
    }
}
