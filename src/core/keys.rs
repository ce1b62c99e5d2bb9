use crate::core::cert::PublicKey;
use crate::core::gcc;
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use md5::Digest;
use num_bigint::BigUint;
use ring::digest;
use rsa::PublicKeyParts;
use tracing::debug;

pub const CLIENT_RANDOM_SIZE: usize = 32;
pub const PREMASTER_SECRET_SIZE: usize = 48;

/// Bytes written over the first bytes of a 40 bits key
const REDUCED_KEY_PREFIX: [u8; 3] = [0xd1, 0x26, 0x9e];

/// Effective strength of the negotiated RC4 keys
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyStrength {
    /// 40 bits
    Reduced,
    /// 128 bits
    Full,
}

impl KeyStrength {
    /// Map the encryption method selected by the server
    pub fn from_method(method: u32) -> RdpResult<Self> {
        match method {
            gcc::ENCRYPTION_FLAG_40BIT => Ok(KeyStrength::Reduced),
            gcc::ENCRYPTION_FLAG_128BIT => Ok(KeyStrength::Full),
            other => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::NotImplemented,
                &format!("KEYS: encryption method {:#x} is not supported", other),
            ))),
        }
    }

    /// Number of key bytes fed to RC4
    pub fn key_length(self) -> usize {
        match self {
            KeyStrength::Reduced => 8,
            KeyStrength::Full => 16,
        }
    }
}

/// Which end of the connection uses the keys
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = md5::Md5::new();
    for part in parts {
        hasher.input(part);
    }
    let mut result = [0; 16];
    result.copy_from_slice(&hasher.result());
    result
}

fn sha1(parts: &[&[u8]]) -> digest::Digest {
    let mut context = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for part in parts {
        context.update(part);
    }
    context.finish()
}

/// MD5(input ‖ salt1 ‖ salt2)
pub fn hash_16(input: &[u8], salt1: &[u8], salt2: &[u8]) -> [u8; 16] {
    md5(&[input, salt1, salt2])
}

/// Three salted MD5 over SHA1 rounds, the salt of round i
/// being i + 1 copies of `base + i`
pub fn hash_48(input: &[u8], salt1: &[u8], salt2: &[u8], base: u8) -> [u8; 48] {
    let mut result = [0; 48];
    for i in 0..3 {
        let salt = vec![base.wrapping_add(i as u8); i + 1];
        let sha = sha1(&[&salt[..], input, salt1, salt2]);
        result[16 * i..16 * (i + 1)].copy_from_slice(&md5(&[input, sha.as_ref()]));
    }
    result
}

/// Weaken a key to 40 bits
///
/// # Example
/// ```
/// use rdp::core::keys::make_40bit;
/// let mut key = [0xff; 8];
/// make_40bit(&mut key);
/// assert_eq!(key, [0xd1, 0x26, 0x9e, 0xff, 0xff, 0xff, 0xff, 0xff]);
/// ```
pub fn make_40bit(key: &mut [u8]) {
    let size = REDUCED_KEY_PREFIX.len().min(key.len());
    key[..size].copy_from_slice(&REDUCED_KEY_PREFIX[..size]);
}

/// Keys of the secure channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub strength: KeyStrength,
    pub sign_key: [u8; 16],
    pub encrypt_key: [u8; 16],
    pub decrypt_key: [u8; 16],
}

impl SessionKeys {
    pub fn derive(
        client_random: &[u8],
        server_random: &[u8],
        strength: KeyStrength,
        role: Role,
    ) -> RdpResult<Self> {
        if client_random.len() != CLIENT_RANDOM_SIZE || server_random.len() != gcc::SERVER_RANDOM_SIZE {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "KEYS: client and server randoms must be 32 bytes",
            )));
        }
        let premaster = [&client_random[..24], &server_random[..24]].concat();
        let master = hash_48(&premaster, client_random, server_random, b'A');
        let key_block = hash_48(&master, client_random, server_random, b'X');

        let mut sign_key = [0; 16];
        sign_key.copy_from_slice(&key_block[..16]);
        let mut first = hash_16(&key_block[16..32], client_random, server_random);
        let mut second = hash_16(&key_block[32..48], client_random, server_random);

        if strength == KeyStrength::Reduced {
            make_40bit(&mut sign_key);
            make_40bit(&mut first);
            make_40bit(&mut second);
        }

        let (decrypt_key, encrypt_key) = match role {
            Role::Initiator => (first, second),
            Role::Responder => (second, first),
        };
        debug!(?strength, ?role, "KEYS: session keys derived");
        Ok(SessionKeys {
            strength,
            sign_key,
            encrypt_key,
            decrypt_key,
        })
    }
}

/// Keys of the licensing exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseKeys {
    pub sign_key: [u8; 16],
    pub crypt_key: [u8; 16],
}

impl LicenseKeys {
    pub fn derive(premaster_secret: &[u8], client_random: &[u8], server_random: &[u8]) -> Self {
        let master = hash_48(premaster_secret, client_random, server_random, b'A');
        let key_block = hash_48(&master, server_random, client_random, b'A');
        let mut sign_key = [0; 16];
        sign_key.copy_from_slice(&key_block[..16]);
        LicenseKeys {
            sign_key,
            crypt_key: hash_16(&key_block[16..32], client_random, server_random),
        }
    }

    /// Keys used when the client random and premaster secret are left blank
    pub fn from_server_random(server_random: &[u8]) -> Self {
        Self::derive(
            &[0; PREMASTER_SECRET_SIZE],
            &[0; CLIENT_RANDOM_SIZE],
            server_random,
        )
    }
}

/// Little endian modular exponentiation, the result is zero extended to `size`
fn modpow_le(data: &[u8], exponent: &BigUint, modulus: &BigUint, size: usize) -> Vec<u8> {
    let mut result = BigUint::from_bytes_le(data)
        .modpow(exponent, modulus)
        .to_bytes_le();
    if result.len() < size {
        result.resize(size, 0);
    }
    result
}

/// Raw RSA used to send the client random
pub fn rsa_encrypt(data: &[u8], public_key: &PublicKey) -> Vec<u8> {
    let key = public_key.rsa();
    let modulus = BigUint::from_bytes_be(&key.n().to_bytes_be());
    let exponent = BigUint::from_bytes_be(&key.e().to_bytes_be());
    modpow_le(data, &exponent, &modulus, public_key.modulus_size())
}

/// Recover a value encrypted with `rsa_encrypt`,
/// modulus and private exponent are little endian
pub fn rsa_decrypt(data: &[u8], modulus: &[u8], private_exponent: &[u8]) -> Vec<u8> {
    let modulus = BigUint::from_bytes_le(modulus);
    let exponent = BigUint::from_bytes_le(private_exponent);
    let size = (modulus.bits() as usize + 7) / 8;
    modpow_le(data, &exponent, &modulus, size)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::cert::tests::X509_CERTIFICATE;
    use crate::core::cert::ServerCertificate;
    use proptest::prelude::*;

    const CLIENT_RANDOM: &str = "1d5b65d23a06fd7524d18054e55b1cd000416da4eb0a1645b7b89ed1809d7abb";
    const SERVER_RANDOM: &str = "872ba7dac39f4686c13b28f9a88133e645122d13b717eead5f329c2dfeaec2ff";
    const PREMASTER_SECRET: &str = "0a3f6b679e119913dd9d1cd77932594fc2ab6822b47cf8bb42b4a33cd05aecd8046289ec976c7ed7a402bf6eec5d3328";
    const MASTER_SECRET: &str = "79401c6618880dc69efc3937de7a045dc1daa43b9985b79128866defe97ad64bf84293a6878590b2919c33d457caeebe";
    const SESSION_KEY_BLOB: &str = "74c0d50d7e4b47848e04e38909ec7c2eb403c66589474508f9a5cb7852f5db6666059e5716dd89c3f1787d7fe00eae2f";
    const LICENSE_KEY: &str = "2ce533b6f1625ef9c9f0d1be4871f629";
    const ENCRYPTED_PREMASTER_SECRET: &str = "3ebbee9fbcd5987c10772bb26d7f1c08dce9ac84ab84be0c98f3f866ed66dbdd8a64c8ff01df179179dfa409ddbaabb6501ccf004e335a81f935bbddcf1fd53e";

    /// 512 bits test key pair, little endian
    pub const TEST_MODULUS: &str = "719c089eb7cef525602da571cf3d0797677d8493a85de2caf729fb2859882e7039477d6acba287f2b9e3fb64f33933b1b41cbe70d831b13b8ffc594406462dac";
    pub const TEST_PRIVATE_EXPONENT: &str = "ad8aaddabb490b1e36efeeb67dadf45cfaf6f4cf9cd9e8d7992fea75175b699327a0f17bc37cf4ac17f4c62520030e5a585dad511089524d9b03eb902549eb79";
    pub const TEST_EXPONENT: u32 = 65537;

    pub fn test_public_key() -> PublicKey {
        PublicKey::new(&hex::decode(TEST_MODULUS).unwrap(), TEST_EXPONENT).unwrap()
    }

    fn bytes(value: &str) -> Vec<u8> {
        hex::decode(value).unwrap()
    }

    #[test]
    fn test_master_secret_vector() {
        let master = hash_48(
            &bytes(PREMASTER_SECRET),
            &bytes(CLIENT_RANDOM),
            &bytes(SERVER_RANDOM),
            b'A',
        );
        assert_eq!(master.to_vec(), bytes(MASTER_SECRET));
    }

    #[test]
    fn test_key_block_vector() {
        let key_block = hash_48(
            &bytes(MASTER_SECRET),
            &bytes(SERVER_RANDOM),
            &bytes(CLIENT_RANDOM),
            b'A',
        );
        assert_eq!(key_block.to_vec(), bytes(SESSION_KEY_BLOB));
    }

    #[test]
    fn test_license_keys_vector() {
        let keys = LicenseKeys::derive(
            &bytes(PREMASTER_SECRET),
            &bytes(CLIENT_RANDOM),
            &bytes(SERVER_RANDOM),
        );
        assert_eq!(keys.crypt_key.to_vec(), bytes(LICENSE_KEY));
        assert_eq!(keys.sign_key.to_vec(), bytes(SESSION_KEY_BLOB)[..16].to_vec());
    }

    #[test]
    fn test_rsa_encrypt_vector() {
        let key = ServerCertificate::public_key_from_der(X509_CERTIFICATE).unwrap();
        assert_eq!(
            rsa_encrypt(&bytes(PREMASTER_SECRET), &key),
            bytes(ENCRYPTED_PREMASTER_SECRET)
        );
    }

    #[test]
    fn test_rsa_toy_key() {
        // n = 3233, e = 17, d = 2753
        let modulus = BigUint::from(3233_u32);
        assert_eq!(
            modpow_le(&[65], &BigUint::from(17_u32), &modulus, 2),
            [0xe6, 0x0a]
        );
        assert_eq!(rsa_decrypt(&[0xe6, 0x0a], &[0xa1, 0x0c], &[0xc1, 0x0a]), [65, 0]);
    }

    #[test]
    fn test_rsa_round_trip() {
        let random = (0..32).collect::<Vec<u8>>();
        let encrypted = rsa_encrypt(&random, &test_public_key());
        assert_eq!(encrypted.len(), 64);
        let decrypted = rsa_decrypt(
            &encrypted,
            &bytes(TEST_MODULUS),
            &bytes(TEST_PRIVATE_EXPONENT),
        );
        assert_eq!(&decrypted[..32], random.as_slice());
        assert!(decrypted[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roles_mirror_each_other() {
        let client = SessionKeys::derive(&[1; 32], &[2; 32], KeyStrength::Full, Role::Initiator)
            .unwrap();
        let server = SessionKeys::derive(&[1; 32], &[2; 32], KeyStrength::Full, Role::Responder)
            .unwrap();
        assert_eq!(client.encrypt_key, server.decrypt_key);
        assert_eq!(client.decrypt_key, server.encrypt_key);
        assert_eq!(client.sign_key, server.sign_key);
        assert_ne!(client.encrypt_key, client.decrypt_key);
    }

    #[test]
    fn test_reduced_strength_keys() {
        let keys = SessionKeys::derive(&[1; 32], &[2; 32], KeyStrength::Reduced, Role::Initiator)
            .unwrap();
        for key in [keys.sign_key, keys.encrypt_key, keys.decrypt_key] {
            assert_eq!(key[..3], REDUCED_KEY_PREFIX);
        }
    }

    #[test]
    fn test_unsupported_method() {
        assert_eq!(
            KeyStrength::from_method(gcc::ENCRYPTION_FLAG_56BIT)
                .unwrap_err()
                .kind(),
            Some(RdpErrorKind::NotImplemented)
        );
        assert_eq!(KeyStrength::from_method(1).unwrap().key_length(), 8);
    }

    proptest! {
        #[test]
        fn prop_hash_48_is_deterministic(
            input in prop::collection::vec(any::<u8>(), 48),
            salt1 in prop::collection::vec(any::<u8>(), 32),
            salt2 in prop::collection::vec(any::<u8>(), 32),
            base in any::<u8>(),
        ) {
            prop_assert_eq!(
                hash_48(&input, &salt1, &salt2, base),
                hash_48(&input, &salt1, &salt2, base)
            );
        }

        #[test]
        fn prop_single_byte_change_changes_output(
            input in prop::collection::vec(any::<u8>(), 48),
            salt in prop::collection::vec(any::<u8>(), 32),
            index in 0_usize..48,
            delta in 1_u8..=255,
        ) {
            let mut other = input.clone();
            other[index] = other[index].wrapping_add(delta);
            prop_assert_ne!(
                hash_48(&input, &salt, &salt, b'A'),
                hash_48(&other, &salt, &salt, b'A')
            );
            if index < 16 {
                prop_assert_ne!(
                    hash_16(&input[..16], &salt, &salt),
                    hash_16(&other[..16], &salt, &salt)
                );
            }
        }

        #[test]
        fn prop_make_40bit_is_idempotent(key in prop::collection::vec(any::<u8>(), 8..=16)) {
            let mut once = key.clone();
            make_40bit(&mut once);
            let mut twice = once.clone();
            make_40bit(&mut twice);
            prop_assert_eq!(once, twice);
        }
    }
}
