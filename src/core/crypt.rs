use crate::core::keys::{make_40bit, KeyStrength, SessionKeys};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use md5::Digest;
use rc4::consts::{U16, U8};
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use ring::digest;
use tracing::{debug, trace};

/// Number of messages processed with one key before it is refreshed
pub const ROTATION_THRESHOLD: u32 = 4096;

/// Size of the signature carried by secured messages
pub const SIGNATURE_SIZE: usize = 8;

const PAD1: [u8; 40] = [0x36; 40];
const PAD2: [u8; 48] = [0x5c; 48];

/// RC4 keystream of either key size
enum Cipher {
    Reduced(Rc4<U8>),
    Full(Rc4<U16>),
}

impl Cipher {
    fn new(key: &[u8], strength: KeyStrength) -> Self {
        match strength {
            KeyStrength::Reduced => Cipher::Reduced(Rc4::new(Key::<U8>::from_slice(&key[..8]))),
            KeyStrength::Full => Cipher::Full(Rc4::new(Key::<U16>::from_slice(&key[..16]))),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Cipher::Reduced(rc4) => rc4.apply_keystream(data),
            Cipher::Full(rc4) => rc4.apply_keystream(data),
        }
    }
}

/// One direction of the secure channel
pub struct CryptContext {
    key: [u8; 16],
    update_key: [u8; 16],
    strength: KeyStrength,
    use_count: u32,
    cipher: Cipher,
}

impl CryptContext {
    pub fn new(key: [u8; 16], strength: KeyStrength) -> Self {
        CryptContext {
            key,
            update_key: key,
            strength,
            use_count: 0,
            cipher: Cipher::new(&key, strength),
        }
    }

    /// Key currently feeding the keystream
    pub fn key(&self) -> &[u8] {
        &self.key[..self.strength.key_length()]
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Derive the next key from the initial one and the current one
    fn rotate(&mut self) {
        let length = self.strength.key_length();
        let update_key = &self.update_key[..length];
        let sha = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &[update_key, &PAD1[..], &self.key[..length]].concat(),
        );
        let mut md5 = md5::Md5::new();
        md5.input(update_key);
        md5.input(&PAD2[..]);
        md5.input(sha.as_ref());

        let mut next = [0; 16];
        next[..length].copy_from_slice(&md5.result()[..length]);
        Cipher::new(&next, self.strength).apply(&mut next[..length]);
        if self.strength == KeyStrength::Reduced {
            make_40bit(&mut next);
        }

        self.key = next;
        self.cipher = Cipher::new(&self.key, self.strength);
        self.use_count = 0;
        debug!("CRYPT: key updated");
    }

    /// Apply the keystream in place, the key is refreshed
    /// once it has been used `ROTATION_THRESHOLD` times
    pub fn process(&mut self, data: &mut [u8]) {
        if self.use_count == ROTATION_THRESHOLD {
            self.rotate();
        }
        self.cipher.apply(data);
        self.use_count += 1;
    }
}

/// MAC of a message, the first 8 bytes are sent on the wire
/// and the licensing exchange keeps 16
pub fn sign(key: &[u8], data: &[u8]) -> [u8; 16] {
    let sha = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY,
        &[
            key,
            &PAD1[..],
            &(data.len() as u32).to_le_bytes()[..],
            data,
        ]
        .concat(),
    );
    let mut md5 = md5::Md5::new();
    md5.input(key);
    md5.input(&PAD2[..]);
    md5.input(sha.as_ref());
    let mut result = [0; 16];
    result.copy_from_slice(&md5.result());
    result
}

/// Both directions of the standard RDP security layer
pub struct SecureChannel {
    encrypt: CryptContext,
    decrypt: CryptContext,
    sign_key: [u8; 16],
    strength: KeyStrength,
}

impl SecureChannel {
    pub fn new(keys: &SessionKeys) -> Self {
        SecureChannel {
            encrypt: CryptContext::new(keys.encrypt_key, keys.strength),
            decrypt: CryptContext::new(keys.decrypt_key, keys.strength),
            sign_key: keys.sign_key,
            strength: keys.strength,
        }
    }

    fn signature(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let mut result = [0; SIGNATURE_SIZE];
        result.copy_from_slice(
            &sign(&self.sign_key[..self.strength.key_length()], data)[..SIGNATURE_SIZE],
        );
        result
    }

    /// Sign then encrypt a payload, returns (signature, ciphertext)
    pub fn protect(&mut self, data: &[u8]) -> ([u8; SIGNATURE_SIZE], Vec<u8>) {
        let signature = self.signature(data);
        let mut encrypted = data.to_vec();
        self.encrypt.process(&mut encrypted);
        trace!(size = data.len(), "CRYPT: payload protected");
        (signature, encrypted)
    }

    /// Decrypt a payload and check its signature
    pub fn unprotect(&mut self, signature: &[u8], data: &[u8]) -> RdpResult<Vec<u8>> {
        let mut decrypted = data.to_vec();
        self.decrypt.process(&mut decrypted);
        if self.signature(&decrypted)[..] != *signature {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidChecksum,
                "CRYPT: invalid message signature",
            )));
        }
        Ok(decrypted)
    }

    pub fn encrypt_context(&self) -> &CryptContext {
        &self.encrypt
    }

    pub fn decrypt_context(&self) -> &CryptContext {
        &self.decrypt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::Role;

    fn channels(strength: KeyStrength) -> (SecureChannel, SecureChannel) {
        let client_random = (0..32).collect::<Vec<u8>>();
        let server_random = (32..64).collect::<Vec<u8>>();
        (
            SecureChannel::new(
                &SessionKeys::derive(&client_random, &server_random, strength, Role::Initiator)
                    .unwrap(),
            ),
            SecureChannel::new(
                &SessionKeys::derive(&client_random, &server_random, strength, Role::Responder)
                    .unwrap(),
            ),
        )
    }

    #[test]
    fn test_key_kept_for_threshold_uses() {
        let mut context = CryptContext::new([7; 16], KeyStrength::Full);
        for _ in 0..ROTATION_THRESHOLD {
            context.process(&mut [0; 4]);
        }
        assert_eq!(context.key(), [7; 16]);
        assert_eq!(context.use_count(), ROTATION_THRESHOLD);

        context.process(&mut [0; 4]);
        assert_ne!(context.key(), [7; 16]);
        assert_eq!(context.use_count(), 1);
    }

    #[test]
    fn test_reduced_rotation_keeps_prefix() {
        let mut key = [9; 16];
        make_40bit(&mut key);
        let mut context = CryptContext::new(key, KeyStrength::Reduced);
        for _ in 0..=ROTATION_THRESHOLD {
            context.process(&mut [0; 1]);
        }
        assert_eq!(context.key().len(), 8);
        assert_eq!(context.key()[..3], [0xd1, 0x26, 0x9e]);
        assert_ne!(context.key(), &key[..8]);
    }

    #[test]
    fn test_channels_stay_in_sync_across_rotation() {
        for strength in [KeyStrength::Full, KeyStrength::Reduced] {
            let (mut client, mut server) = channels(strength);
            for i in 0..5000_u32 {
                let message = i.to_le_bytes();
                let (signature, encrypted) = client.protect(&message);
                assert_eq!(server.unprotect(&signature, &encrypted).unwrap(), message);
            }
            assert_eq!(client.encrypt_context().use_count(), 5000 - ROTATION_THRESHOLD);
        }
    }

    #[test]
    fn test_tampered_message() {
        let (mut client, mut server) = channels(KeyStrength::Full);
        let (signature, mut encrypted) = client.protect(b"hello");
        encrypted[0] ^= 1;
        assert_eq!(
            server.unprotect(&signature, &encrypted).unwrap_err().kind(),
            Some(RdpErrorKind::InvalidChecksum)
        );
    }

    #[test]
    fn test_sign_depends_on_length_prefix() {
        assert_ne!(sign(&[1; 16], b"ab"), sign(&[1; 16], b"ab\0"));
        assert_eq!(sign(&[1; 16], b"ab"), sign(&[1; 16], b"ab"));
    }
}
