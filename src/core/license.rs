use crate::core::crypt::sign;
use crate::core::keys::LicenseKeys;
use crate::core::mcs;
use crate::core::sec::{self, SecurityFlag};
use crate::core::LicenseStore;
use crate::model::data::{read_slice, remaining, to_vec, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::ByteChannel;
use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::TryFromPrimitive;
use rc4::consts::U16 as KeySize;
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use std::convert::TryFrom;
use std::io::Cursor;
use tracing::{debug, info, warn};

/// Preamble version sent and expected by this client
pub const PREAMBLE_VERSION: u8 = 2;

/// Tag, version and 16 bits length
pub const PREAMBLE_SIZE: usize = 4;

pub const SERVER_RANDOM_SIZE: usize = 32;
pub const TOKEN_SIZE: usize = 10;
pub const HWID_SIZE: usize = 20;
pub const LICENSE_SIGNATURE_SIZE: usize = 16;

const KEY_EXCHANGE_ALG_RSA: u32 = 0x00000001;
const PLATFORM_ID_REQUEST: u16 = 0xff01;
const PLATFORM_ID_PRESENT: u16 = 0x0201;
/// Placeholder of the encrypted premaster secret
const ENCRYPTED_PREMASTER_SIZE: usize = 72;
const HWID_PLATFORM: u32 = 2;
const HWID_HOST_SIZE: usize = 16;

/// All type of message
/// which can follow a license preamble
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/73170ca2-5f82-4a2d-9d1b-b439f3d8dadc
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum MessageType {
    /// Server demand for a license
    LicenseRequest = 0x01,
    /// Server authentication request
    PlatformChallenge = 0x02,
    /// License issue
    NewLicense = 0x03,
    /// License reissue
    UpgradeLicense = 0x04,
    LicenseInfo = 0x12,
    NewLicenseRequest = 0x13,
    PlatformChallengeResponse = 0x15,
    /// Final result of the exchange
    ErrorAlert = 0xFF,
}

/// Error code of the license automata
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/f18b6c9f-f3d8-4a0e-8398-f9b153233dca?redirectedfrom=MSDN
#[repr(u32)]
#[derive(Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ErrorCode {
    ErrInvalidServerCertificate = 0x00000001,
    ErrNoLicense = 0x00000002,
    ErrInvalidMac = 0x00000003,
    ErrInvalidScope = 0x00000004,
    ErrNoLicenseServer = 0x00000006,
    StatusValidClient = 0x00000007,
    ErrInvalidClient = 0x00000008,
    ErrInvalidProductid = 0x0000000B,
    ErrInvalidMessageLen = 0x0000000C,
}

/// All valid state transition available
/// for license automata
#[repr(u32)]
#[derive(Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum StateTransition {
    StTotalAbort = 0x00000001,
    StNoTransition = 0x00000002,
    StResetPhaseToStart = 0x00000003,
    StResendLastMessage = 0x00000004,
}

#[repr(u16)]
#[allow(dead_code)]
enum BlobType {
    Data = 0x0001,
    ClientUserName = 0x000F,
    ClientMachineName = 0x0010,
}

/// Progress of the license exchange
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LicenseState {
    NoLicense,
    /// Request or stored license sent after the server demand
    DemandSent,
    ChallengeReceived,
    ResponseSent,
    Issued,
    Declined,
}

/// License PDU: preamble then body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicensePdu {
    pub message_type: MessageType,
    pub version: u8,
    pub body: Vec<u8>,
}

impl LicensePdu {
    pub fn new(message_type: MessageType, body: Vec<u8>) -> Self {
        LicensePdu {
            message_type,
            version: PREAMBLE_VERSION,
            body,
        }
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let size = u16::try_from(self.body.len() + PREAMBLE_SIZE)?;
        to_vec(&trame![
            self.message_type as u8,
            self.version,
            U16::LE(size),
            self.body.clone()
        ])
    }

    /// The declared length covers the preamble and must fit the message
    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        let mut stream = Cursor::new(data);
        let tag = stream.read_u8()?;
        let version = stream.read_u8()?;
        let size = stream.read_u16::<LittleEndian>()? as usize;
        if size < PREAMBLE_SIZE || size > data.len() {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                &format!("LICENSE: declared size {} for a {} bytes message", size, data.len()),
            )));
        }
        let message_type = MessageType::try_from(tag).map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::UnknownPdu,
                &format!("LICENSE: unknown message type {:#x}", tag),
            ))
        })?;
        Ok(LicensePdu {
            message_type,
            version,
            body: read_slice(&mut stream, size - PREAMBLE_SIZE)?.to_vec(),
        })
    }
}

/// Platform id followed by the first bytes of the host name
pub fn hardware_id(host: &str) -> [u8; HWID_SIZE] {
    let mut hwid = [0; HWID_SIZE];
    hwid[..4].copy_from_slice(&HWID_PLATFORM.to_le_bytes());
    let name = host.as_bytes();
    let size = name.len().min(HWID_HOST_SIZE);
    hwid[4..4 + size].copy_from_slice(&name[..size]);
    hwid
}

/// Each message is processed with a fresh keystream
fn rc4(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut result = data.to_vec();
    Rc4::new(Key::<KeySize>::from_slice(key)).apply_keystream(&mut result);
    result
}

fn null_terminated(value: &str) -> Vec<u8> {
    let mut result = value.as_bytes().to_vec();
    result.push(0);
    result
}

fn blob(blob_type: u16, data: Vec<u8>) -> RdpResult<Vec<u8>> {
    to_vec(&trame![U16::LE(blob_type), U16::LE(u16::try_from(data.len())?), data])
}

/// Client side of the licensing exchange
pub struct LicenseExchange {
    host: String,
    user: String,
    hwid: [u8; HWID_SIZE],
    keys: Option<LicenseKeys>,
    state: LicenseState,
}

impl LicenseExchange {
    pub fn new(host: &str, user: &str) -> Self {
        LicenseExchange {
            host: host.to_string(),
            user: user.to_string(),
            hwid: hardware_id(host),
            keys: None,
            state: LicenseState::NoLicense,
        }
    }

    pub fn state(&self) -> LicenseState {
        self.state
    }

    pub fn keys(&self) -> Option<&LicenseKeys> {
        self.keys.as_ref()
    }

    fn set_state(&mut self, state: LicenseState) {
        info!(from = ?self.state, to = ?state, "LICENSE: state changed");
        self.state = state;
    }

    /// Mark the exchange as refused by the server, an issued license is kept
    pub fn decline(&mut self) {
        if self.state != LicenseState::Issued {
            self.set_state(LicenseState::Declined);
        }
    }

    /// Handle one license PDU, returns the reply to send if any.
    ///
    /// Unknown or client side messages are ignored. Malformed challenge
    /// or issue messages, or ones received before the demand, are logged
    /// and dropped without changing the state.
    pub fn process<L: LicenseStore>(
        &mut self,
        data: &[u8],
        store: &mut L,
    ) -> RdpResult<Option<Vec<u8>>> {
        let pdu = match LicensePdu::from_bytes(data) {
            Ok(pdu) => pdu,
            Err(e) if e.kind() == Some(RdpErrorKind::UnknownPdu) => {
                warn!("LICENSE: {}, message ignored", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        debug!(message = ?pdu.message_type, size = pdu.body.len(), "LICENSE: received");
        match pdu.message_type {
            MessageType::LicenseRequest => self.process_demand(&pdu.body, store).map(Some),
            MessageType::PlatformChallenge => {
                Ok(dropped_on_error(pdu.message_type, self.process_challenge(&pdu.body)))
            }
            MessageType::NewLicense => {
                dropped_on_error(pdu.message_type, self.process_issue(&pdu.body, store));
                Ok(None)
            }
            MessageType::ErrorAlert => {
                log_result(&pdu.body);
                Ok(None)
            }
            MessageType::UpgradeLicense => Ok(None),
            other => {
                warn!(message = ?other, "LICENSE: client message received from server, ignored");
                Ok(None)
            }
        }
    }

    fn crypt_keys(&self) -> RdpResult<&LicenseKeys> {
        try_option!(self.keys.as_ref(), "LICENSE: no license demand received")
    }

    fn process_demand<L: LicenseStore>(&mut self, body: &[u8], store: &mut L) -> RdpResult<Vec<u8>> {
        let mut stream = Cursor::new(body);
        let server_random = read_slice(&mut stream, SERVER_RANDOM_SIZE)?;
        self.keys = Some(LicenseKeys::from_server_random(server_random));

        let reply = match store.read_license(&self.host) {
            Some(license) => {
                debug!(size = license.len(), "LICENSE: present stored license");
                LicensePdu::new(MessageType::LicenseInfo, self.present_body(&license)?)
            }
            None => LicensePdu::new(MessageType::NewLicenseRequest, self.request_body()?),
        };
        self.set_state(LicenseState::DemandSent);
        reply.to_bytes()
    }

    fn preamble(platform_id: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(42 + ENCRYPTED_PREMASTER_SIZE);
        body.extend_from_slice(&KEY_EXCHANGE_ALG_RSA.to_le_bytes());
        body.extend_from_slice(&0_u16.to_le_bytes());
        body.extend_from_slice(&platform_id.to_le_bytes());
        body.extend_from_slice(&[0; 32]);
        body.extend_from_slice(&0_u16.to_le_bytes());
        body.extend_from_slice(&(ENCRYPTED_PREMASTER_SIZE as u16).to_le_bytes());
        body.extend_from_slice(&[0; ENCRYPTED_PREMASTER_SIZE]);
        body
    }

    fn request_body(&self) -> RdpResult<Vec<u8>> {
        let mut body = Self::preamble(PLATFORM_ID_REQUEST);
        body.extend(blob(
            BlobType::ClientUserName as u16,
            null_terminated(&self.user),
        )?);
        body.extend(blob(
            BlobType::ClientMachineName as u16,
            null_terminated(&self.host),
        )?);
        Ok(body)
    }

    fn present_body(&self, license: &[u8]) -> RdpResult<Vec<u8>> {
        let keys = self.crypt_keys()?;
        let mut body = Self::preamble(PLATFORM_ID_PRESENT);
        body.extend(blob(BlobType::Data as u16, license.to_vec())?);
        body.extend(blob(BlobType::Data as u16, rc4(&keys.crypt_key, &self.hwid))?);
        body.extend_from_slice(&sign(&keys.sign_key, &self.hwid));
        Ok(body)
    }

    fn process_challenge(&mut self, body: &[u8]) -> RdpResult<Option<Vec<u8>>> {
        let keys = self.crypt_keys()?.clone();
        let mut stream = Cursor::new(body);
        read_slice(&mut stream, 6)?;
        let token_size = stream.read_u16::<LittleEndian>()? as usize;
        if token_size != TOKEN_SIZE {
            warn!(token_size, "LICENSE: unexpected token size, challenge dropped");
            return Ok(None);
        }
        let token = read_slice(&mut stream, TOKEN_SIZE)?;
        let _signature = read_slice(&mut stream, LICENSE_SIGNATURE_SIZE)?;
        self.set_state(LicenseState::ChallengeReceived);

        let decrypted_token = rc4(&keys.crypt_key, token);
        let signature = sign(&keys.sign_key, &[&decrypted_token[..], &self.hwid[..]].concat());
        let encrypted_hwid = rc4(&keys.crypt_key, &self.hwid);

        let mut response = Vec::with_capacity(8 + TOKEN_SIZE + HWID_SIZE + 16);
        response.extend(blob(BlobType::Data as u16, token.to_vec())?);
        response.extend(blob(BlobType::Data as u16, encrypted_hwid)?);
        response.extend_from_slice(&signature);
        self.set_state(LicenseState::ResponseSent);
        LicensePdu::new(MessageType::PlatformChallengeResponse, response)
            .to_bytes()
            .map(Some)
    }

    fn process_issue<L: LicenseStore>(&mut self, body: &[u8], store: &mut L) -> RdpResult<Option<()>> {
        let keys = self.crypt_keys()?.clone();
        let mut stream = Cursor::new(body);
        read_slice(&mut stream, 2)?;
        let size = stream.read_u16::<LittleEndian>()? as usize;
        if remaining(&stream) < size {
            warn!(size, "LICENSE: issued license truncated, message dropped");
            return Ok(None);
        }
        let decrypted = rc4(&keys.crypt_key, read_slice(&mut stream, size)?);
        match extract_license(&decrypted) {
            Some(license) => {
                store.write_license(&self.host, license);
                info!(size = license.len(), "LICENSE: license stored");
                self.set_state(LicenseState::Issued);
            }
            None => warn!("LICENSE: invalid issued license, message dropped"),
        }
        Ok(None)
    }
}

/// License faults only cost the current message
fn dropped_on_error<T>(message_type: MessageType, result: RdpResult<Option<T>>) -> Option<T> {
    result.unwrap_or_else(|e| {
        warn!(message = ?message_type, "LICENSE: {}, message dropped", e);
        None
    })
}

/// Zero checksum then four length prefixed fields, the license is the last one
fn extract_license(data: &[u8]) -> Option<&[u8]> {
    let mut stream = Cursor::new(data);
    if stream.read_u16::<LittleEndian>().ok()? != 0 {
        return None;
    }
    read_slice(&mut stream, 2).ok()?;
    let mut size = 0;
    for _ in 0..4 {
        read_slice(&mut stream, size).ok()?;
        size = stream.read_u32::<LittleEndian>().ok()? as usize;
        if remaining(&stream) < size {
            return None;
        }
    }
    read_slice(&mut stream, size).ok()
}

fn log_result(body: &[u8]) {
    let mut stream = Cursor::new(body);
    match (
        stream.read_u32::<LittleEndian>(),
        stream.read_u32::<LittleEndian>(),
    ) {
        (Ok(code), Ok(transition)) => info!(
            code = ?ErrorCode::try_from(code).map_err(|_| code),
            transition = ?StateTransition::try_from(transition).map_err(|_| transition),
            "LICENSE: result received"
        ),
        _ => warn!("LICENSE: truncated result message"),
    }
}

/// Drive the exchange until a license is issued or the server ends it
pub fn client_connect<C: ByteChannel, L: LicenseStore>(
    sec: &mut sec::Client<C>,
    host: &str,
    user: &str,
    store: &mut L,
) -> RdpResult<LicenseState> {
    let mut exchange = LicenseExchange::new(host, user);
    loop {
        let pdu = sec.read_pdu()?;
        if !pdu.has_flag(SecurityFlag::SecLicensePkt) {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                &format!("LICENSE: expected a license message, flags {:#x}", pdu.flags),
            )));
        }
        let is_result = pdu.payload.first() == Some(&(MessageType::ErrorAlert as u8));
        if let Some(reply) = exchange.process(&pdu.payload, store)? {
            sec.write_pdu(
                mcs::GLOBAL_CHANNEL_NAME,
                SecurityFlag::SecLicensePkt as u16,
                &reply,
                false,
            )?;
        }
        if is_result {
            exchange.decline();
        }
        if is_result || exchange.state() == LicenseState::Issued {
            return Ok(exchange.state());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::sec::tests::{client, indication, sent_payloads};
    use std::collections::HashMap;

    pub const SERVER_RANDOM: [u8; 32] = [0x5a; 32];
    pub const HOST: &str = "workstation";

    /// Security header of a clear license message
    fn license_message(pdu: &LicensePdu) -> Vec<u8> {
        let mut message = vec![0x80, 0x00, 0x00, 0x00];
        message.extend(pdu.to_bytes().unwrap());
        message
    }

    pub fn demand() -> LicensePdu {
        let mut body = SERVER_RANDOM.to_vec();
        // product info and certificate blobs are never parsed
        body.extend_from_slice(&[0; 16]);
        LicensePdu::new(MessageType::LicenseRequest, body)
    }

    pub fn issue(blob: &[u8], checksum: u16) -> LicensePdu {
        let keys = LicenseKeys::from_server_random(&SERVER_RANDOM);
        let mut plain = checksum.to_le_bytes().to_vec();
        plain.extend_from_slice(&[0, 0]);
        for field in [&b"scope"[..], b"company", b"product", blob] {
            plain.extend_from_slice(&(field.len() as u32).to_le_bytes());
            plain.extend_from_slice(field);
        }
        let mut body = vec![0x09, 0x00];
        body.extend_from_slice(&(plain.len() as u16).to_le_bytes());
        body.extend(rc4(&keys.crypt_key, &plain));
        LicensePdu::new(MessageType::NewLicense, body)
    }

    pub fn result() -> LicensePdu {
        let mut body = (ErrorCode::StatusValidClient as u32).to_le_bytes().to_vec();
        body.extend_from_slice(&(StateTransition::StNoTransition as u32).to_le_bytes());
        body.extend_from_slice(&[0x04, 0x00, 0x00, 0x00]);
        LicensePdu::new(MessageType::ErrorAlert, body)
    }

    /// Server messages of a license exchange on the global channel
    pub fn license_frames(pdus: &[LicensePdu]) -> Vec<u8> {
        pdus.iter()
            .flat_map(|pdu| indication(license_message(pdu)))
            .collect()
    }

    fn challenge(token: &[u8]) -> LicensePdu {
        let keys = LicenseKeys::from_server_random(&SERVER_RANDOM);
        let mut body = vec![0; 6];
        body.extend_from_slice(&(token.len() as u16).to_le_bytes());
        body.extend(rc4(&keys.crypt_key, token));
        body.extend_from_slice(&[0; 16]);
        LicensePdu::new(MessageType::PlatformChallenge, body)
    }

    fn demanded() -> (LicenseExchange, HashMap<String, Vec<u8>>) {
        let mut exchange = LicenseExchange::new(HOST, "user");
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        exchange
            .process(&demand().to_bytes().unwrap(), &mut store)
            .unwrap();
        (exchange, store)
    }

    #[test]
    fn test_preamble_layout() {
        let pdu = LicensePdu::new(MessageType::NewLicenseRequest, vec![1, 2, 3]);
        let data = pdu.to_bytes().unwrap();
        assert_eq!(data, [0x13, 0x02, 0x07, 0x00, 1, 2, 3]);
        assert_eq!(LicensePdu::from_bytes(&data).unwrap(), pdu);
    }

    #[test]
    fn test_declared_size_too_large() {
        assert_eq!(
            LicensePdu::from_bytes(&[0x03, 0x02, 0x08, 0x00, 1, 2])
                .unwrap_err()
                .kind(),
            Some(RdpErrorKind::InvalidSize)
        );
    }

    #[test]
    fn test_hardware_id() {
        let hwid = hardware_id("a-very-long-host-name");
        assert_eq!(hwid[..4], [2, 0, 0, 0]);
        assert_eq!(&hwid[4..], b"a-very-long-host");
        assert_eq!(hardware_id("pc")[4..8], [b'p', b'c', 0, 0]);
    }

    #[test]
    fn test_demand_without_license() {
        let mut exchange = LicenseExchange::new(HOST, "user");
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        let reply = exchange
            .process(&demand().to_bytes().unwrap(), &mut store)
            .unwrap()
            .unwrap();
        let reply = LicensePdu::from_bytes(&reply).unwrap();
        assert_eq!(reply.message_type, MessageType::NewLicenseRequest);
        assert_eq!(exchange.state(), LicenseState::DemandSent);
        assert_eq!(
            exchange.keys().unwrap(),
            &LicenseKeys::from_server_random(&SERVER_RANDOM)
        );

        let body = reply.body;
        assert_eq!(body[..8], [1, 0, 0, 0, 0, 0, 0x01, 0xff]);
        let names = &body[8 + 32 + 4 + 72..];
        assert_eq!(names[..4], [0x0f, 0x00, 5, 0]);
        assert_eq!(&names[4..9], b"user\0");
        assert_eq!(names[9..13], [0x10, 0x00, 12, 0]);
        assert_eq!(&names[13..], b"workstation\0");
    }

    #[test]
    fn test_demand_with_stored_license() {
        let mut exchange = LicenseExchange::new(HOST, "user");
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        store.insert(HOST.to_string(), vec![0xab; 5]);
        let reply = exchange
            .process(&demand().to_bytes().unwrap(), &mut store)
            .unwrap()
            .unwrap();
        let reply = LicensePdu::from_bytes(&reply).unwrap();
        assert_eq!(reply.message_type, MessageType::LicenseInfo);

        let keys = LicenseKeys::from_server_random(&SERVER_RANDOM);
        let body = reply.body;
        assert_eq!(body[6..8], [0x01, 0x02]);
        let blobs = &body[8 + 32 + 4 + 72..];
        assert_eq!(blobs[..9], [1, 0, 5, 0, 0xab, 0xab, 0xab, 0xab, 0xab]);
        assert_eq!(blobs[9..13], [1, 0, 20, 0]);
        assert_eq!(rc4(&keys.crypt_key, &blobs[13..33]), hardware_id(HOST));
        assert_eq!(blobs[33..], sign(&keys.sign_key, &hardware_id(HOST)));
    }

    #[test]
    fn test_challenge_response() {
        let (mut exchange, mut store) = demanded();
        let token = *b"0123456789";
        let request = challenge(&token);
        let reply = exchange
            .process(&request.to_bytes().unwrap(), &mut store)
            .unwrap()
            .unwrap();
        assert_eq!(exchange.state(), LicenseState::ResponseSent);

        let keys = LicenseKeys::from_server_random(&SERVER_RANDOM);
        let reply = LicensePdu::from_bytes(&reply).unwrap();
        assert_eq!(reply.message_type, MessageType::PlatformChallengeResponse);
        let body = reply.body;
        assert_eq!(body[..4], [1, 0, 10, 0]);
        assert_eq!(body[4..14], request.body[8..18]);
        assert_eq!(body[14..18], [1, 0, 20, 0]);
        assert_eq!(rc4(&keys.crypt_key, &body[18..38]), hardware_id(HOST));
        assert_eq!(
            body[38..],
            sign(&keys.sign_key, &[&token[..], &hardware_id(HOST)[..]].concat())
        );
    }

    #[test]
    fn test_challenge_with_bad_token_size_is_dropped() {
        let (mut exchange, mut store) = demanded();
        let reply = exchange
            .process(&challenge(b"short").to_bytes().unwrap(), &mut store)
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(exchange.state(), LicenseState::DemandSent);
    }

    #[test]
    fn test_issue_stores_license() {
        let (mut exchange, mut store) = demanded();
        let reply = exchange
            .process(&issue(b"license-blob", 0).to_bytes().unwrap(), &mut store)
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(exchange.state(), LicenseState::Issued);
        assert_eq!(store.get(HOST).unwrap(), b"license-blob");
    }

    #[test]
    fn test_issue_with_bad_checksum_is_dropped() {
        let (mut exchange, mut store) = demanded();
        exchange
            .process(&issue(b"license-blob", 1).to_bytes().unwrap(), &mut store)
            .unwrap();
        assert_eq!(exchange.state(), LicenseState::DemandSent);
        assert!(store.is_empty());
    }

    #[test]
    fn test_messages_before_demand_are_dropped() {
        let mut exchange = LicenseExchange::new(HOST, "user");
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        for pdu in [issue(b"blob", 0), challenge(b"0123456789")] {
            assert!(exchange
                .process(&pdu.to_bytes().unwrap(), &mut store)
                .unwrap()
                .is_none());
        }
        assert_eq!(exchange.state(), LicenseState::NoLicense);
        assert!(store.is_empty());
    }

    #[test]
    fn test_truncated_bodies_are_dropped() {
        let (mut exchange, mut store) = demanded();
        let mut truncated_challenge = challenge(b"0123456789");
        truncated_challenge.body.truncate(12);
        let truncated_issue = LicensePdu::new(MessageType::NewLicense, vec![0x09, 0x00, 0x10]);
        for pdu in [truncated_challenge, truncated_issue] {
            assert!(exchange
                .process(&pdu.to_bytes().unwrap(), &mut store)
                .unwrap()
                .is_none());
        }
        assert_eq!(exchange.state(), LicenseState::DemandSent);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_and_client_messages_are_ignored() {
        let (mut exchange, mut store) = demanded();
        assert!(exchange
            .process(&[0x05, 0x02, 0x04, 0x00], &mut store)
            .unwrap()
            .is_none());
        for message_type in [
            MessageType::LicenseInfo,
            MessageType::NewLicenseRequest,
            MessageType::PlatformChallengeResponse,
        ] {
            let pdu = LicensePdu::new(message_type, vec![0; 4]);
            assert!(exchange
                .process(&pdu.to_bytes().unwrap(), &mut store)
                .unwrap()
                .is_none());
        }
        assert_eq!(exchange.state(), LicenseState::DemandSent);
    }

    #[test]
    fn test_driver_skips_unknown_messages() {
        let unknown = indication(vec![0x80, 0x00, 0x00, 0x00, 0x05, 0x02, 0x04, 0x00]);
        let mut input = license_frames(&[demand()]);
        input.extend(unknown);
        input.extend(license_frames(&[issue(b"blob", 0)]));
        let (mut sec, _) = client(input);
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        assert_eq!(
            client_connect(&mut sec, HOST, "user", &mut store).unwrap(),
            LicenseState::Issued
        );
    }

    #[test]
    fn test_reissue_and_result_are_ignored() {
        let (mut exchange, mut store) = demanded();
        let reissue = LicensePdu::new(MessageType::UpgradeLicense, vec![0; 8]);
        for pdu in [reissue, result()] {
            assert!(exchange
                .process(&pdu.to_bytes().unwrap(), &mut store)
                .unwrap()
                .is_none());
        }
        assert_eq!(exchange.state(), LicenseState::DemandSent);
    }

    #[test]
    fn test_driver_until_issue() {
        let (mut sec, output) = client(license_frames(&[demand(), issue(b"blob", 0)]));
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        let state = client_connect(&mut sec, HOST, "user", &mut store).unwrap();
        assert_eq!(state, LicenseState::Issued);
        assert_eq!(store.get(HOST).unwrap(), b"blob");

        let sent = sent_payloads(&output.borrow());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][..4], [0x80, 0x00, 0x00, 0x00]);
        assert_eq!(sent[0][4], MessageType::NewLicenseRequest as u8);
    }

    #[test]
    fn test_driver_declined() {
        let (mut sec, _) = client(license_frames(&[demand(), result()]));
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        let state = client_connect(&mut sec, HOST, "user", &mut store).unwrap();
        assert_eq!(state, LicenseState::Declined);
    }

    #[test]
    fn test_driver_rejects_other_messages() {
        let (mut sec, _) = client(indication(vec![0x40, 0x00, 0x00, 0x00, 1]));
        assert_eq!(
            client_connect(&mut sec, HOST, "user", &mut HashMap::<String, Vec<u8>>::new())
                .unwrap_err()
                .kind(),
            Some(RdpErrorKind::InvalidRespond)
        );
    }
}
