//! Field-level AES-256-GCM encryption.
//!
//! The key is the SHA-256 digest of a passphrase. Each encrypted string is
//! `base64(nonce || ciphertext || tag)` with a fresh random 96-bit nonce.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{MemError, Result};
use crate::model::{FieldValue, Record};

pub struct FieldCipher {
    key: [u8; 32],
    rng: SystemRandom,
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn derive(passphrase: &str) -> Self {
        Self {
            key: Sha256::digest(passphrase.as_bytes()).into(),
            rng: SystemRandom::new(),
        }
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| MemError::Validation("failed to create AES-256-GCM key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        let key = self.aead_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| MemError::Validation("failed to generate random nonce".into()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| MemError::Validation("AES-256-GCM encryption failed".into()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + in_out.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&in_out);
        Ok(STANDARD.encode(token))
    }

    /// Strict primitive: wrong key, tampering or a value that was never
    /// encrypted all yield `EncryptionKeyMismatch`.
    pub fn decrypt_str(&self, token: &str) -> Result<String> {
        let raw = STANDARD.decode(token).map_err(|_| MemError::EncryptionKeyMismatch)?;
        if raw.len() < NONCE_LEN {
            return Err(MemError::EncryptionKeyMismatch);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| MemError::EncryptionKeyMismatch)?;

        let key = self.aead_key()?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| MemError::EncryptionKeyMismatch)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| MemError::EncryptionKeyMismatch)
    }

    pub fn encrypt_field(&self, value: &FieldValue) -> Result<FieldValue> {
        value.try_map_text(&mut |s: &str| self.encrypt_str(s))
    }

    /// Fail-soft: every leaf that does not decrypt is returned unchanged.
    pub fn decrypt_field(&self, value: &FieldValue) -> FieldValue {
        value.map_text(&mut |s: &str| match self.decrypt_str(s) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(error = %e, "field did not decrypt, keeping stored value");
                s.to_string()
            }
        })
    }

    /// Encrypts content, tags, source and metadata in place and flags the
    /// record as encrypted.
    pub fn seal_record(&self, record: &mut Record) -> Result<()> {
        record.content = self.encrypt_str(&record.content)?;
        record.source = self.encrypt_str(&record.source)?;
        if let Some(tags) = record.tags.take() {
            record.tags = self.encrypt_field(&FieldValue::from(tags))?.into_list();
        }
        if let Some(metadata) = record.metadata.take() {
            record.metadata = self.encrypt_field(&FieldValue::from(metadata))?.into_map();
        }
        record.encrypted = true;
        Ok(())
    }

    /// Strict counterpart of `decrypt_field`: the first leaf that does not
    /// decrypt fails the whole value.
    pub fn try_decrypt_field(&self, value: &FieldValue) -> Result<FieldValue> {
        value.try_map_text(&mut |s: &str| self.decrypt_str(s))
    }

    /// Inverse of `seal_record`. Either every sealed field decrypts or the
    /// record is left exactly as stored. The `encrypted` flag is not touched
    /// since it describes the stored form.
    pub fn try_open_record(&self, record: &mut Record) -> Result<()> {
        let content = self.decrypt_str(&record.content)?;
        let source = self.decrypt_str(&record.source)?;
        let tags = match &record.tags {
            Some(tags) => self.try_decrypt_field(&FieldValue::from(tags.clone()))?.into_list(),
            None => None,
        };
        let metadata = match &record.metadata {
            Some(metadata) => self.try_decrypt_field(&FieldValue::from(metadata.clone()))?.into_map(),
            None => None,
        };

        record.content = content;
        record.source = source;
        record.tags = tags;
        record.metadata = metadata;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    #[test]
    fn string_round_trip() {
        let cipher = FieldCipher::derive("correct horse");
        let token = cipher.encrypt_str("secret").unwrap();
        assert_ne!(token, "secret");
        assert_eq!(cipher.decrypt_str(&token).unwrap(), "secret");
    }

    #[test]
    fn same_plaintext_gets_fresh_nonce() {
        let cipher = FieldCipher::derive("k");
        assert_ne!(cipher.encrypt_str("x").unwrap(), cipher.encrypt_str("x").unwrap());
    }

    #[test]
    fn wrong_key_is_strict_error_but_soft_field() {
        let token = FieldCipher::derive("right").encrypt_str("secret").unwrap();
        let wrong = FieldCipher::derive("wrong");

        assert!(matches!(wrong.decrypt_str(&token), Err(MemError::EncryptionKeyMismatch)));
        let soft = wrong.decrypt_field(&FieldValue::Text(token.clone()));
        assert_eq!(soft, FieldValue::Text(token));
    }

    #[test]
    fn plain_values_pass_through_soft_decrypt() {
        let cipher = FieldCipher::derive("k");
        let value = FieldValue::from(vec!["plain".to_string()]);
        assert_eq!(cipher.decrypt_field(&value), value);
    }

    #[test]
    fn nested_fields_are_walked() {
        let cipher = FieldCipher::derive("k");
        let metadata = Metadata::from([("a".to_string(), "1".to_string()), ("b".to_string(), "two".to_string())]);
        let value = FieldValue::from(metadata.clone());

        let sealed = cipher.encrypt_field(&value).unwrap();
        let FieldValue::Map(ref entries) = sealed else { panic!("shape changed") };
        assert_eq!(entries.len(), 2);
        assert_ne!(entries["b"], FieldValue::Text("two".into()));

        assert_eq!(cipher.decrypt_field(&sealed).into_map(), Some(metadata));
    }

    #[test]
    fn record_seal_and_open() {
        let cipher = FieldCipher::derive("k");
        let original = crate::model::RecordBuilder::new()
            .content("hello")
            .tags(["a", "b"])
            .source("test")
            .build()
            .unwrap();

        let mut sealed = original.clone();
        cipher.seal_record(&mut sealed).unwrap();
        assert!(sealed.encrypted);
        assert_ne!(sealed.content, original.content);
        assert_eq!(sealed.tags().len(), 2);

        let mut opened = sealed.clone();
        cipher.try_open_record(&mut opened).unwrap();
        assert_eq!(opened.content, "hello");
        assert_eq!(opened.tags(), ["a", "b"]);
        assert_eq!(opened.source, "test");
        assert!(opened.metadata.is_none());
    }

    #[test]
    fn wrong_key_leaves_record_untouched() {
        let mut sealed = crate::model::RecordBuilder::new()
            .content("hello")
            .tags(["a"])
            .build()
            .unwrap();
        FieldCipher::derive("right").seal_record(&mut sealed).unwrap();

        let mut attempt = sealed.clone();
        let result = FieldCipher::derive("wrong").try_open_record(&mut attempt);
        assert!(matches!(result, Err(MemError::EncryptionKeyMismatch)));
        assert_eq!(attempt, sealed);
    }
}
