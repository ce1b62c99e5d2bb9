use crate::model::data::{read_slice, remaining, to_vec, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use byteorder::{LittleEndian, ReadBytesExt};
use rsa::{PublicKeyParts, RsaPublicKey};
use std::io::Cursor;
use tracing::{debug, warn};
use x509_parser::{certificate::X509Certificate, prelude::*};

/// "RSA1"
pub const RSA1_MAGIC: u32 = 0x31415352;
/// Accepted modulus sizes in bytes, 512 to 2048 bits
pub const MIN_MODULUS_SIZE: usize = 64;
pub const MAX_MODULUS_SIZE: usize = 256;
/// Zero bytes following the modulus
pub const MODULUS_PADDING_SIZE: usize = 8;

const CERT_CHAIN_VERSION_1: u32 = 0x00000001;
const CERT_CHAIN_VERSION_2: u32 = 0x00000002;
const CERT_CHAIN_VERSION_MASK: u32 = 0x7FFFFFFF;
const SIGNATURE_ALG_RSA: u32 = 0x00000001;
const KEY_EXCHANGE_ALG_RSA: u32 = 0x00000001;
const BB_RSA_KEY_BLOB: u16 = 0x0006;
const BB_RSA_SIGNATURE_BLOB: u16 = 0x0008;
const MAX_CHAIN_LENGTH: u32 = 32;

fn certificate_error(message: &str) -> Error {
    Error::RdpError(RdpError::new(RdpErrorKind::InvalidCertificate, message))
}

/// Server RSA public key used to encrypt the client random
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    /// Size in bytes of the modulus as announced by the server
    modulus_size: usize,
}

impl PublicKey {
    /// Build a key from a little endian modulus and its exponent
    pub fn new(modulus: &[u8], exponent: u32) -> RdpResult<Self> {
        let key = RsaPublicKey::new(
            rsa::BigUint::from_bytes_le(modulus),
            rsa::BigUint::from(exponent),
        )
        .map_err(|e| certificate_error(&format!("invalid RSA public key: {}", e)))?;
        Ok(PublicKey {
            key,
            modulus_size: modulus.len(),
        })
    }

    pub fn from_rsa(key: RsaPublicKey) -> Self {
        let modulus_size = key.size();
        PublicKey { key, modulus_size }
    }

    pub fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }

    pub fn modulus_size(&self) -> usize {
        self.modulus_size
    }

    /// Modulus as little endian bytes, zero extended to the modulus size
    pub fn modulus(&self) -> Vec<u8> {
        let mut modulus = self.key.n().to_bytes_le();
        modulus.resize(self.modulus_size.max(modulus.len()), 0);
        modulus
    }

    pub fn exponent(&self) -> RdpResult<u32> {
        let bytes = self.key.e().to_bytes_le();
        if bytes.len() > 4 {
            return Err(certificate_error("public exponent does not fit 32 bits"));
        }
        let mut exponent = [0_u8; 4];
        exponent[..bytes.len()].copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(exponent))
    }

    /// Parse a RSA1 public key blob
    fn from_blob(blob: &[u8]) -> RdpResult<Self> {
        let mut stream = Cursor::new(blob);
        let magic = stream.read_u32::<LittleEndian>()?;
        if magic != RSA1_MAGIC {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidMagic,
                &format!("public key magic {:#010x} is not RSA1", magic),
            )));
        }
        let key_length = stream.read_u32::<LittleEndian>()? as usize;
        let modulus_size = key_length.saturating_sub(MODULUS_PADDING_SIZE);
        if !(MIN_MODULUS_SIZE..=MAX_MODULUS_SIZE).contains(&modulus_size) {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidModulusSize,
                &format!("declared modulus size {} is out of range", modulus_size),
            )));
        }
        let _bit_length = stream.read_u32::<LittleEndian>()?;
        let _data_length = stream.read_u32::<LittleEndian>()?;
        let exponent = stream.read_u32::<LittleEndian>()?;
        if remaining(&stream) < key_length {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidModulusSize,
                "declared modulus size exceeds the key blob",
            )));
        }
        let modulus = read_slice(&mut stream, modulus_size)?;
        Self::new(modulus, exponent)
    }

    fn to_blob(&self) -> RdpResult<Vec<u8>> {
        let mut modulus = self.modulus();
        modulus.extend_from_slice(&[0; MODULUS_PADDING_SIZE]);
        to_vec(&trame![
            U32::LE(RSA1_MAGIC),
            U32::LE(modulus.len() as u32),
            U32::LE(self.modulus_size as u32 * 8),
            U32::LE(self.modulus_size as u32 - 1),
            U32::LE(self.exponent()?),
            modulus
        ])
    }
}

/// Server certificate carried by the server security block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCertificate {
    /// RDP 4 proprietary certificate
    Proprietary {
        public_key: PublicKey,
        signature: Vec<u8>,
    },
    /// RDP 5 X.509 chain, the key comes from the last certificate
    X509 {
        public_key: PublicKey,
        chain: Vec<Vec<u8>>,
    },
}

impl ServerCertificate {
    pub fn public_key(&self) -> &PublicKey {
        match self {
            ServerCertificate::Proprietary { public_key, .. } => public_key,
            ServerCertificate::X509 { public_key, .. } => public_key,
        }
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        let mut stream = Cursor::new(data);
        let version = stream.read_u32::<LittleEndian>()?;
        match version & CERT_CHAIN_VERSION_MASK {
            CERT_CHAIN_VERSION_1 => Self::read_proprietary(&mut stream),
            CERT_CHAIN_VERSION_2 => Self::read_x509_chain(&mut stream),
            other => Err(certificate_error(&format!(
                "unknown certificate version {}",
                other
            ))),
        }
    }

    fn read_proprietary(stream: &mut Cursor<&[u8]>) -> RdpResult<Self> {
        let sig_alg_id = stream.read_u32::<LittleEndian>()?;
        let key_alg_id = stream.read_u32::<LittleEndian>()?;
        if sig_alg_id != SIGNATURE_ALG_RSA || key_alg_id != KEY_EXCHANGE_ALG_RSA {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::NotImplemented,
                &format!(
                    "unsupported signature or key algorithm, dwSigAlgId={} dwKeyAlgId={}",
                    sig_alg_id, key_alg_id
                ),
            )));
        }

        let mut public_key = None;
        let mut signature = Vec::new();
        while remaining(stream) >= 4 {
            let tag = stream.read_u16::<LittleEndian>()?;
            let length = stream.read_u16::<LittleEndian>()? as usize;
            let blob = read_slice(stream, length)?;
            match tag {
                BB_RSA_KEY_BLOB => public_key = Some(PublicKey::from_blob(blob)?),
                BB_RSA_SIGNATURE_BLOB => signature = blob.to_vec(),
                other => warn!(tag = other, "ignoring unknown certificate blob"),
            }
        }

        match public_key {
            Some(public_key) => Ok(ServerCertificate::Proprietary {
                public_key,
                signature,
            }),
            None => Err(certificate_error("proprietary certificate without public key")),
        }
    }

    fn read_x509_chain(stream: &mut Cursor<&[u8]>) -> RdpResult<Self> {
        let count = stream.read_u32::<LittleEndian>()?;
        if !(2..=MAX_CHAIN_LENGTH).contains(&count) {
            return Err(certificate_error(&format!(
                "invalid number of certificates in the chain: {}",
                count
            )));
        }
        let mut chain = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let length = stream.read_u32::<LittleEndian>()? as usize;
            let certificate = read_slice(stream, length)
                .map_err(|_| certificate_error("certificate length exceeds the chain"))?;
            chain.push(certificate.to_vec());
        }
        debug!(count, "X509 certificate chain");
        let public_key = match chain.last() {
            Some(last) => Self::public_key_from_der(last)?,
            None => return Err(certificate_error("empty certificate chain")),
        };
        Ok(ServerCertificate::X509 { public_key, chain })
    }

    /// Extract the RSA key of a DER certificate
    pub fn public_key_from_der(data: &[u8]) -> RdpResult<PublicKey> {
        let (_, mut x509) = X509Certificate::from_der(data)
            .map_err(|_| certificate_error("invalid X509 certificate"))?;

        // Some Windows servers use certificates with old and invalid OIDs, e.g. Oid(1.3.14.3.2.15)
        // which can't be parsed, so the algorithm is forced to RSA
        x509.tbs_certificate.subject_pki.algorithm.algorithm =
            oid_registry::OID_PKCS1_RSAENCRYPTION;
        let public_key = x509
            .tbs_certificate
            .subject_pki
            .parsed()
            .map_err(|_| certificate_error("can't parse X509 subject public key"))?;

        match public_key {
            x509_parser::public_key::PublicKey::RSA(key) => {
                let key = RsaPublicKey::new(
                    rsa::BigUint::from_bytes_be(key.modulus),
                    rsa::BigUint::from_bytes_be(key.exponent),
                )
                .map_err(|_| certificate_error("invalid RSA key in X509 certificate"))?;
                Ok(PublicKey::from_rsa(key))
            }
            _ => Err(certificate_error("X509 certificate does not carry a RSA key")),
        }
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        match self {
            ServerCertificate::Proprietary {
                public_key,
                signature,
            } => {
                let blob = public_key.to_blob()?;
                to_vec(&trame![
                    U32::LE(CERT_CHAIN_VERSION_1),
                    U32::LE(SIGNATURE_ALG_RSA),
                    U32::LE(KEY_EXCHANGE_ALG_RSA),
                    U16::LE(BB_RSA_KEY_BLOB),
                    U16::LE(blob.len() as u16),
                    blob,
                    U16::LE(BB_RSA_SIGNATURE_BLOB),
                    U16::LE(signature.len() as u16),
                    signature.clone()
                ])
            }
            ServerCertificate::X509 { chain, .. } => {
                let mut result = to_vec(&trame![
                    U32::LE(CERT_CHAIN_VERSION_2),
                    U32::LE(chain.len() as u32)
                ])?;
                for certificate in chain {
                    result.extend_from_slice(&(certificate.len() as u32).to_le_bytes());
                    result.extend_from_slice(certificate);
                }
                result.resize(result.len() + 8 + 4 * chain.len(), 0);
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const X509_CERTIFICATE: &[u8] = include_bytes!("testdata/x509_license_server.der");

    pub fn proprietary_certificate() -> ServerCertificate {
        ServerCertificate::Proprietary {
            public_key: ServerCertificate::public_key_from_der(X509_CERTIFICATE).unwrap(),
            signature: vec![0x5a; 72],
        }
    }

    #[test]
    fn test_x509_public_key() {
        let key = ServerCertificate::public_key_from_der(X509_CERTIFICATE).unwrap();
        assert_eq!(key.modulus_size(), 64);
        assert_eq!(key.exponent().unwrap(), 0x10001);
    }

    #[test]
    fn test_proprietary_round_trip() {
        let certificate = proprietary_certificate();
        let bytes = certificate.to_bytes().unwrap();
        assert_eq!(ServerCertificate::from_bytes(&bytes).unwrap(), certificate);
    }

    #[test]
    fn test_x509_chain_round_trip() {
        let certificate = ServerCertificate::X509 {
            public_key: ServerCertificate::public_key_from_der(X509_CERTIFICATE).unwrap(),
            chain: vec![X509_CERTIFICATE.to_vec(), X509_CERTIFICATE.to_vec()],
        };
        let bytes = certificate.to_bytes().unwrap();
        assert_eq!(ServerCertificate::from_bytes(&bytes).unwrap(), certificate);
    }

    #[test]
    fn test_x509_chain_too_short() {
        let mut bytes = vec![2, 0, 0, 0, 1, 0, 0, 0];
        bytes.extend_from_slice(&(X509_CERTIFICATE.len() as u32).to_le_bytes());
        bytes.extend_from_slice(X509_CERTIFICATE);
        assert_eq!(
            ServerCertificate::from_bytes(&bytes).unwrap_err().kind(),
            Some(RdpErrorKind::InvalidCertificate)
        );
    }

    #[test]
    fn test_x509_chain_truncated() {
        let bytes = vec![2, 0, 0, 0, 2, 0, 0, 0, 0xff, 0, 0, 0, 0x30];
        assert_eq!(
            ServerCertificate::from_bytes(&bytes).unwrap_err().kind(),
            Some(RdpErrorKind::InvalidCertificate)
        );
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = proprietary_certificate().to_bytes().unwrap();
        // version, algorithms and blob header come first
        bytes[16] = b'X';
        assert_eq!(
            ServerCertificate::from_bytes(&bytes).unwrap_err().kind(),
            Some(RdpErrorKind::InvalidMagic)
        );
    }

    #[test]
    fn test_modulus_size_out_of_range() {
        let mut bytes = proprietary_certificate().to_bytes().unwrap();
        bytes[20..24].copy_from_slice(&(32_u32 + 8).to_le_bytes());
        assert_eq!(
            ServerCertificate::from_bytes(&bytes).unwrap_err().kind(),
            Some(RdpErrorKind::InvalidModulusSize)
        );
    }
}
