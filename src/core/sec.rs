use crate::core::crypt::{SecureChannel, SIGNATURE_SIZE};
use crate::core::keys::SessionKeys;
use crate::core::mcs;
use crate::model::data::{read_slice, remaining, to_vec, Component, Message, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::ByteChannel;
use crate::model::unicode::Unicode;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::{debug, trace};

/// Flags of the basic security header
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/e13405c5-668b-4716-94b2-1c2654ca1ad4?redirectedfrom=MSDN
#[repr(u16)]
#[allow(dead_code)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityFlag {
    SecExchangePkt = 0x0001,
    SecTransportReq = 0x0002,
    RdpSecTransportRsp = 0x0004,
    SecEncrypt = 0x0008,
    SecResetSeqno = 0x0010,
    SecIgnoreSeqno = 0x0020,
    SecInfoPkt = 0x0040,
    SecLicensePkt = 0x0080,
    SecLicenseEncryptCs = 0x0200,
    SecRedirectionPkt = 0x0400,
    SecSecureChecksum = 0x0800,
    SecAutodetectReq = 0x1000,
    SecAutodetectRsp = 0x2000,
    SecHeartbeat = 0x4000,
    SecFlagshiValid = 0x8000,
}

/// RDP option someone links to capabilities
/// https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpbcgr/732394f5-e2b5-4ac5-8a0a-35345386b0d1?redirectedfrom=MSDN
#[allow(dead_code)]
pub enum InfoFlag {
    InfoMouse = 0x00000001,
    InfoDisablectrlaltdel = 0x00000002,
    InfoAutologon = 0x00000008,
    InfoUnicode = 0x00000010,
    InfoMaximizeshell = 0x00000020,
    InfoLogonnotify = 0x00000040,
    InfoCompression = 0x00000080,
    InfoEnablewindowskey = 0x00000100,
    InfoRemoteconsoleaudio = 0x00002000,
    InfoForceEncryptedCsPdu = 0x00004000,
    InfoRail = 0x00008000,
    InfoLogonerrors = 0x00010000,
    InfoMouseHasWheel = 0x00020000,
    InfoPasswordIsScPin = 0x00040000,
    InfoNoaudioplayback = 0x00080000,
    InfoUsingSavedCreds = 0x00100000,
    InfoAudiocapture = 0x00200000,
    InfoVideoDisable = 0x00400000,
    InfoCompressionTypeMask = 0x00001E00,
}

/// Optional performance flags as specified in
/// 2.2.1.11.1.1.1 (TS_EXTENDED_INFO_PACKET)
#[allow(dead_code)]
pub enum ExtendedInfoFlag {
    PerfDisableWallpaper = 0x00000001,
    PerfDisableFullWindowDrag = 0x00000002,
    PerfDisableMenuAnimations = 0x00000004,
    PerfDisableTheming = 0x00000008,
    PerfDisableCursorShadow = 0x00000020,
    PerfDisableCursorBlink = 0x00000040,
    PerfEnableFontSmoothing = 0x00000080,
    PerfEnableDesktopComposition = 0x00000100,
}

const AF_INET: u16 = 0x0002;

/// Size of the flags and flags-hi words
const SECURITY_HEADER_SIZE: usize = 4;

/// Logon credentials carried by the client info PDU
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub domain: String,
    pub username: String,
    pub password: String,
    pub auto_logon: bool,
    /// Extra `InfoFlag` bits
    pub info_flags: u32,
    /// `ExtendedInfoFlag` bits, only sent to RDP 5 servers
    pub performance_flags: u32,
}

fn null_terminated(value: &str) -> Vec<u8> {
    let mut result = value.to_unicode();
    result.extend_from_slice(&[0, 0]);
    result
}

impl ClientInfo {
    fn flags(&self) -> u32 {
        self.info_flags
            | InfoFlag::InfoMouse as u32
            | InfoFlag::InfoMouseHasWheel as u32
            | InfoFlag::InfoUnicode as u32
            | InfoFlag::InfoDisablectrlaltdel as u32
            | InfoFlag::InfoEnablewindowskey as u32
            | if self.auto_logon {
                InfoFlag::InfoAutologon as u32
            } else {
                0
            }
    }

    /// On RDP version > 5
    /// Client have to send IP information
    fn extended_infos(&self) -> Component {
        component![
            "clientAddressFamily" => U16::LE(AF_INET),
            "cbClientAddress" => U16::LE(2),
            "clientAddress" => b"\x00\x00".to_vec(),
            "cbClientDir" => U16::LE(2),
            "clientDir" => b"\x00\x00".to_vec(),
            "clientTimeZone" => vec![0; 172],
            "clientSessionId" => U32::LE(0),
            "performanceFlags" => U32::LE(self.performance_flags)
        ]
    }

    /// TS_INFO_PACKET, the extended part is only
    /// understood by RDP 5 servers
    pub fn component(&self, extended: bool) -> Component {
        let domain = null_terminated(&self.domain);
        let username = null_terminated(&self.username);
        let password = null_terminated(&self.password);

        component![
            "codePage" => U32::LE(0),
            "flag" => U32::LE(self.flags()),
            "cbDomain" => U16::LE((domain.len() - 2) as u16),
            "cbUserName" => U16::LE((username.len() - 2) as u16),
            "cbPassword" => U16::LE((password.len() - 2) as u16),
            "cbAlternateShell" => U16::LE(0),
            "cbWorkingDir" => U16::LE(0),
            "domain" => domain,
            "userName" => username,
            "password" => password,
            "alternateShell" => b"\x00\x00".to_vec(),
            "workingDir" => b"\x00\x00".to_vec(),
            "extendedInfos" => if extended { self.extended_infos() } else { component![] }
        ]
    }
}

/// Message read through the security layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPdu {
    pub channel: String,
    pub flags: u16,
    pub payload: Vec<u8>,
}

impl SecurityPdu {
    pub fn has_flag(&self, flag: SecurityFlag) -> bool {
        self.flags & flag as u16 != 0
    }
}

/// Standard RDP security on top of the MCS layer.
///
/// Until `enable` is called every message is sent in clear.
pub struct Client<C> {
    mcs: mcs::Client<C>,
    channel: Option<SecureChannel>,
}

impl<C: ByteChannel> Client<C> {
    pub fn new(mcs: mcs::Client<C>) -> Self {
        Client { mcs, channel: None }
    }

    /// Start signing and encrypting with the derived session keys
    pub fn enable(&mut self, keys: &SessionKeys) {
        debug!(strength = ?keys.strength, "SEC: secure channel enabled");
        self.channel = Some(SecureChannel::new(keys));
    }

    pub fn is_secured(&self) -> bool {
        self.channel.is_some()
    }

    /// Security exchange PDU, the encrypted client random
    /// followed by 8 bytes of padding
    pub fn send_client_random(&mut self, encrypted_random: &[u8]) -> RdpResult<()> {
        let mut payload = Vec::with_capacity(encrypted_random.len() + 12);
        payload.extend_from_slice(&((encrypted_random.len() + 8) as u32).to_le_bytes());
        payload.extend_from_slice(encrypted_random);
        payload.extend_from_slice(&[0; 8]);
        trace!(size = encrypted_random.len(), "SEC: send client random");
        self.write_pdu(
            mcs::GLOBAL_CHANNEL_NAME,
            SecurityFlag::SecExchangePkt as u16,
            &payload,
            false,
        )
    }

    /// Client info PDU, encrypted once the secure channel is up
    pub fn send_client_info(&mut self, info: &ClientInfo) -> RdpResult<()> {
        let payload = to_vec(&info.component(self.mcs.is_rdp_version_5_plus()))?;
        let encrypt = self.is_secured();
        self.write_pdu(
            mcs::GLOBAL_CHANNEL_NAME,
            SecurityFlag::SecInfoPkt as u16,
            &payload,
            encrypt,
        )
    }

    /// Write a payload behind a basic security header
    pub fn write_pdu(
        &mut self,
        channel_name: &str,
        flags: u16,
        payload: &[u8],
        encrypt: bool,
    ) -> RdpResult<()> {
        let mut flags = flags;
        let body = match (encrypt, self.channel.as_mut()) {
            (true, Some(channel)) => {
                flags |= SecurityFlag::SecEncrypt as u16;
                let (signature, encrypted) = channel.protect(payload);
                [&signature[..], &encrypted[..]].concat()
            }
            (true, None) => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidAutomata,
                    "SEC: encryption requested before key exchange",
                )))
            }
            (false, _) => payload.to_vec(),
        };
        self.mcs.write(
            channel_name,
            &trame![U16::LE(flags), U16::LE(0), body],
        )
    }

    /// Read the next message and strip its basic security header,
    /// encrypted payloads are decrypted and their signature checked
    pub fn read_pdu(&mut self) -> RdpResult<SecurityPdu> {
        let (channel, data) = self.mcs.read()?;
        let (flags, payload) = self.unwrap_security(&data)?;
        Ok(SecurityPdu {
            channel,
            flags,
            payload,
        })
    }

    fn unwrap_security(&mut self, data: &[u8]) -> RdpResult<(u16, Vec<u8>)> {
        let mut stream = Cursor::new(data);
        if remaining(&stream) < SECURITY_HEADER_SIZE {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "SEC: message shorter than the security header",
            )));
        }
        let flags = stream.read_u16::<LittleEndian>()?;
        let _flags_hi = stream.read_u16::<LittleEndian>()?;

        if flags & SecurityFlag::SecEncrypt as u16 == 0 {
            let left = remaining(&stream);
            return Ok((flags, read_slice(&mut stream, left)?.to_vec()));
        }

        let channel = try_option!(
            self.channel.as_mut(),
            "SEC: encrypted message before key exchange"
        )?;
        let signature = read_slice(&mut stream, SIGNATURE_SIZE)?;
        let left = remaining(&stream);
        let encrypted = read_slice(&mut stream, left)?;
        Ok((flags, channel.unprotect(signature, encrypted)?))
    }

    /// Send an application message, the security header
    /// is only present once the secure channel is enabled
    pub fn write(&mut self, channel_name: &str, message: &dyn Message) -> RdpResult<()> {
        if self.is_secured() {
            let payload = to_vec(message)?;
            self.write_pdu(channel_name, 0, &payload, true)
        } else {
            self.mcs.write(channel_name, message)
        }
    }

    /// Read an application message
    pub fn read(&mut self) -> RdpResult<(String, Vec<u8>)> {
        let (channel, data) = self.mcs.read()?;
        if !self.is_secured() {
            return Ok((channel, data));
        }
        let (_, payload) = self.unwrap_security(&data)?;
        Ok((channel, payload))
    }

    pub fn mcs(&self) -> &mcs::Client<C> {
        &self.mcs
    }

    pub fn disconnect(&mut self) -> RdpResult<()> {
        self.channel = None;
        self.mcs.disconnect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::keys::{KeyStrength, Role};
    use crate::core::mcs::tests::{client_data, data_frame, server_data, server_frames, USER_ID};
    use crate::core::mcs::DomainPdu;
    use crate::core::{tpkt, x224};
    use crate::model::link::{Link, ScriptedStream, Stream};
    use std::cell::RefCell;
    use std::rc::Rc;

    pub const CLIENT_RANDOM: [u8; 32] = [0x11; 32];
    pub const SERVER_RANDOM: [u8; 32] = [0x22; 32];

    pub fn keys(role: Role) -> SessionKeys {
        SessionKeys::derive(&CLIENT_RANDOM, &SERVER_RANDOM, KeyStrength::Full, role).unwrap()
    }

    /// Send data indication from the server on the global channel
    pub fn indication(payload: Vec<u8>) -> Vec<u8> {
        data_frame(
            DomainPdu::SendDataIndication {
                user_id: USER_ID,
                channel_id: mcs::GLOBAL_CHANNEL_ID,
                data: payload,
            }
            .to_bytes()
            .unwrap(),
        )
    }

    /// Payloads of every send data request written by the client
    pub fn sent_payloads(output: &[u8]) -> Vec<Vec<u8>> {
        mcs::tests::sent_domain_pdus(output)
            .into_iter()
            .filter_map(|pdu| match pdu {
                DomainPdu::SendDataRequest { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Security client over an opened MCS layer with no extra channel
    pub fn client(input: Vec<u8>) -> (Client<Link<ScriptedStream>>, Rc<RefCell<Vec<u8>>>) {
        let mut frames = mcs::tests::confirm_frame();
        frames.extend(server_frames(&server_data(0), &[0, 0]));
        frames.extend(input);
        let (stream, output) = ScriptedStream::new(frames);
        let transport = tpkt::Client::new(Link::new(Stream::Raw(stream)));
        let x224 = x224::Client::connect(transport, None, 0, false).unwrap();
        let mut mcs = mcs::Client::new(x224);
        mcs.open(&client_data(&[])).unwrap();
        output.borrow_mut().clear();
        (Client::new(mcs), output)
    }

    #[test]
    fn test_client_random_layout() {
        let (mut sec, output) = client(vec![]);
        sec.send_client_random(&[0xaa; 64]).unwrap();
        let payload = &sent_payloads(&output.borrow())[0];
        assert_eq!(payload.len(), 4 + 4 + 64 + 8);
        assert_eq!(payload[..8], [0x01, 0x00, 0x00, 0x00, 72, 0, 0, 0]);
        assert!(payload[8..72].iter().all(|&b| b == 0xaa));
        assert_eq!(payload[72..], [0; 8]);
    }

    #[test]
    fn test_info_is_encrypted_once_secured() {
        let (mut sec, output) = client(vec![]);
        sec.enable(&keys(Role::Initiator));
        let info = ClientInfo {
            username: "user".to_string(),
            ..Default::default()
        };
        sec.send_client_info(&info).unwrap();

        let payload = &sent_payloads(&output.borrow())[0];
        let flags = u16::from_le_bytes([payload[0], payload[1]]);
        assert_eq!(
            flags,
            SecurityFlag::SecInfoPkt as u16 | SecurityFlag::SecEncrypt as u16
        );

        let mut server = SecureChannel::new(&keys(Role::Responder));
        let plain = server.unprotect(&payload[4..12], &payload[12..]).unwrap();
        assert_eq!(plain, to_vec(&info.component(false)).unwrap());
    }

    #[test]
    fn test_read_encrypted_message() {
        let mut server = SecureChannel::new(&keys(Role::Responder));
        let (signature, encrypted) = server.protect(b"hello");
        let mut message = vec![0x08, 0x00, 0x00, 0x00];
        message.extend_from_slice(&signature);
        message.extend(encrypted);

        let (mut sec, _) = client(indication(message));
        sec.enable(&keys(Role::Initiator));
        assert_eq!(
            sec.read().unwrap(),
            (mcs::GLOBAL_CHANNEL_NAME.to_string(), b"hello".to_vec())
        );
    }

    #[test]
    fn test_read_bad_signature() {
        let mut server = SecureChannel::new(&keys(Role::Responder));
        let (_, encrypted) = server.protect(b"hello");
        let mut message = vec![0x08, 0x00, 0x00, 0x00];
        message.extend_from_slice(&[0; 8]);
        message.extend(encrypted);

        let (mut sec, _) = client(indication(message));
        sec.enable(&keys(Role::Initiator));
        assert_eq!(
            sec.read_pdu().unwrap_err().kind(),
            Some(RdpErrorKind::InvalidChecksum)
        );
    }

    #[test]
    fn test_encrypted_message_without_keys() {
        let (mut sec, _) = client(indication(vec![0x08, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert_eq!(
            sec.read_pdu().unwrap_err().kind(),
            Some(RdpErrorKind::InvalidOptionalField)
        );
    }

    #[test]
    fn test_plain_application_data() {
        let (mut sec, output) = client(indication(vec![1, 2, 3]));
        sec.write(mcs::GLOBAL_CHANNEL_NAME, &vec![4_u8, 5]).unwrap();
        assert_eq!(sent_payloads(&output.borrow()), vec![vec![4, 5]]);
        assert_eq!(sec.read().unwrap().1, [1, 2, 3]);
    }
}
