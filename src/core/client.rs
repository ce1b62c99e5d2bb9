use crate::core::gcc;
use crate::core::keys::{self, KeyStrength, Role, SessionKeys, CLIENT_RANDOM_SIZE};
use crate::core::license::{self, LicenseState};
use crate::core::mcs::{self, McsState};
use crate::core::sec::{self, ClientInfo};
use crate::core::tpkt;
use crate::core::x224::{self, Protocols};
use crate::core::LicenseStore;
use crate::model::data::Message;
use crate::model::error::{Phase, PhaseContext, RdpResult};
use crate::model::link::ByteChannel;
use crate::model::rnd::random;
use indexmap::IndexMap;
use tracing::{debug, info};

/// Session parameters, resolved by the caller
///
/// # Example
/// ```no_run
/// use rdp::core::client::Connector;
/// use rdp::model::link::{Link, Stream};
/// use std::collections::HashMap;
/// use std::net::TcpStream;
/// let stream = TcpStream::connect("127.0.0.1:3389").unwrap();
/// let mut licenses: HashMap<String, Vec<u8>> = HashMap::new();
/// let mut connection = Connector::new()
///     .screen(800, 600)
///     .credentials("domain", "user", "password")
///     .channels(&["cliprdr"])
///     .connect(Link::new(Stream::Raw(stream)), &mut licenses)
///     .unwrap();
/// let (channel, payload) = connection.read().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Connector {
    width: u16,
    height: u16,
    bpp: u16,
    keyboard_layout: u32,
    client_name: String,
    info: ClientInfo,
    channels: Vec<gcc::ChannelDef>,
    console_session: bool,
    encryption_methods: u32,
    use_tls: bool,
    check_certificate: bool,
    frame_capacity: usize,
}

impl Default for Connector {
    fn default() -> Self {
        Connector {
            width: 1024,
            height: 768,
            bpp: 16,
            keyboard_layout: gcc::KBD_LAYOUT_US,
            client_name: "rdp-secure-core".to_string(),
            info: ClientInfo::default(),
            channels: Vec::new(),
            console_session: false,
            encryption_methods: gcc::ENCRYPTION_FLAG_40BIT | gcc::ENCRYPTION_FLAG_128BIT,
            use_tls: false,
            check_certificate: false,
            frame_capacity: tpkt::DEFAULT_CAPACITY,
        }
    }
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn screen(mut self, width: u16, height: u16) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn color_depth(mut self, bpp: u16) -> Self {
        self.bpp = bpp;
        self
    }

    pub fn keyboard_layout(mut self, layout: u32) -> Self {
        self.keyboard_layout = layout;
        self
    }

    /// Host name announced to the server, also keys stored licenses
    pub fn client_name(mut self, name: &str) -> Self {
        self.client_name = name.to_string();
        self
    }

    pub fn credentials(mut self, domain: &str, username: &str, password: &str) -> Self {
        self.info.domain = domain.to_string();
        self.info.username = username.to_string();
        self.info.password = password.to_string();
        self
    }

    pub fn auto_logon(mut self, auto_logon: bool) -> Self {
        self.info.auto_logon = auto_logon;
        self
    }

    /// Extended info performance flags
    pub fn performance_flags(mut self, flags: u32) -> Self {
        self.info.performance_flags = flags;
        self
    }

    /// Static virtual channels to join, in order
    pub fn channels(mut self, names: &[&str]) -> Self {
        self.channels = names
            .iter()
            .map(|name| gcc::ChannelDef::new(name, gcc::CHANNEL_OPTION_INITIALIZED))
            .collect();
        self
    }

    pub fn channel(mut self, definition: gcc::ChannelDef) -> Self {
        self.channels.push(definition);
        self
    }

    pub fn console_session(mut self, console: bool) -> Self {
        self.console_session = console;
        self
    }

    pub fn encryption_methods(mut self, methods: u32) -> Self {
        self.encryption_methods = methods;
        self
    }

    /// Ask for TLS instead of standard RDP security
    pub fn use_tls(mut self, use_tls: bool, check_certificate: bool) -> Self {
        self.use_tls = use_tls;
        self.check_certificate = check_certificate;
        self
    }

    pub fn frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    fn cookie(&self) -> String {
        format!("Cookie: mstshash={}", self.info.username)
    }

    fn requested_protocols(&self) -> u32 {
        if self.use_tls {
            Protocols::ProtocolSSL as u32
        } else {
            Protocols::ProtocolRDP as u32
        }
    }

    /// User data blocks of the conference create request
    pub fn client_data(&self, selected_protocol: Protocols) -> gcc::ClientData {
        gcc::ClientData {
            core: gcc::ClientCoreData::new(
                self.width,
                self.height,
                self.bpp,
                self.keyboard_layout,
                &self.client_name,
                selected_protocol as u32,
            ),
            cluster: Some(gcc::ClientClusterData::new(self.console_session)),
            security: gcc::ClientSecurityData::new(self.encryption_methods),
            network: gcc::ClientNetworkData {
                channels: self.channels.clone(),
            },
        }
    }

    /// Run the whole connection sequence.
    ///
    /// Any failure is tagged with the phase it happened in
    /// and leaves the channel disconnected.
    pub fn connect<C: ByteChannel, L: LicenseStore>(
        &self,
        channel: C,
        mut store: L,
    ) -> RdpResult<Connection<C>> {
        let transport = tpkt::Client::with_capacity(channel, self.frame_capacity);
        let x224 = x224::Client::connect(
            transport,
            Some(self.cookie()),
            self.requested_protocols(),
            self.check_certificate,
        )
        .during(Phase::Framing)?;
        let selected_protocol = x224.get_selected_protocols();

        let mut mcs = mcs::Client::new(x224);
        let server_data = mcs
            .open(&self.client_data(selected_protocol))
            .during(Phase::ChannelNegotiation)?;

        let mut sec = sec::Client::new(mcs);
        let key_exchange = self.exchange_keys(&mut sec, &server_data, selected_protocol);
        abort_on_error(&mut sec, key_exchange, Phase::KeyExchange)?;

        let licensing =
            license::client_connect(&mut sec, &self.client_name, &self.info.username, &mut store);
        let license_state = abort_on_error(&mut sec, licensing, Phase::Licensing)?;

        info!(?license_state, secured = sec.is_secured(), "CLIENT: connection ready");
        Ok(Connection {
            sec,
            server_data,
            selected_protocol,
            license_state,
        })
    }

    fn exchange_keys<C: ByteChannel>(
        &self,
        sec: &mut sec::Client<C>,
        server_data: &gcc::ServerData,
        selected_protocol: Protocols,
    ) -> RdpResult<()> {
        let security = &server_data.security;
        if selected_protocol == Protocols::ProtocolRDP
            && security.encryption_level != gcc::ENCRYPTION_LEVEL_NONE
        {
            let key_info = try_option!(
                security.key_info.as_ref(),
                "CLIENT: encryption enabled without server random"
            )?;
            let strength = KeyStrength::from_method(security.encryption_method)?;
            info!(
                method = security.encryption_method,
                level = security.encryption_level,
                "CLIENT: standard RDP security"
            );

            let client_random = random(CLIENT_RANDOM_SIZE);
            let public_key = key_info.certificate.public_key();
            sec.send_client_random(&keys::rsa_encrypt(&client_random, public_key))?;
            sec.enable(&SessionKeys::derive(
                &client_random,
                &key_info.server_random,
                strength,
                Role::Initiator,
            )?);
        } else {
            debug!(protocol = ?selected_protocol, "CLIENT: no standard RDP security");
        }
        sec.send_client_info(&self.info)
    }
}

/// Best effort disconnect before returning a tagged error
fn abort_on_error<C: ByteChannel, T>(
    sec: &mut sec::Client<C>,
    result: RdpResult<T>,
    phase: Phase,
) -> RdpResult<T> {
    result.map_err(|e| {
        if let Err(close) = sec.disconnect() {
            debug!("CLIENT: disconnect after failure: {}", close);
        }
        e.during(phase)
    })
}

/// Secured and multiplexed connection
pub struct Connection<C> {
    sec: sec::Client<C>,
    server_data: gcc::ServerData,
    selected_protocol: Protocols,
    license_state: LicenseState,
}

impl<C: ByteChannel> Connection<C> {
    /// Send a message on a joined channel
    pub fn write(&mut self, channel_name: &str, message: &dyn Message) -> RdpResult<()> {
        self.sec.write(channel_name, message)
    }

    /// Next message from the server, with the name of its channel
    pub fn read(&mut self) -> RdpResult<(String, Vec<u8>)> {
        self.sec.read()
    }

    /// Joined channels and their ids
    pub fn channels(&self) -> &IndexMap<String, u16> {
        self.sec.mcs().channels()
    }

    pub fn license_state(&self) -> LicenseState {
        self.license_state
    }

    pub fn server_data(&self) -> &gcc::ServerData {
        &self.server_data
    }

    pub fn selected_protocol(&self) -> Protocols {
        self.selected_protocol
    }

    pub fn state(&self) -> McsState {
        self.sec.mcs().state()
    }

    pub fn is_secured(&self) -> bool {
        self.sec.is_secured()
    }

    pub fn disconnect(&mut self) -> RdpResult<()> {
        self.sec.disconnect()
    }
}

impl<C> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("selected_protocol", &self.selected_protocol)
            .field("license_state", &self.license_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cert::ServerCertificate;
    use crate::core::crypt::SecureChannel;
    use crate::core::keys::tests::{test_public_key, TEST_MODULUS, TEST_PRIVATE_EXPONENT};
    use crate::core::license::tests::{demand, issue, license_frames, result, HOST};
    use crate::core::mcs::tests::{confirm_frame, sent_domain_pdus, server_data, server_frames};
    use crate::core::mcs::DomainPdu;
    use crate::core::sec::tests::{indication, sent_payloads};
    use crate::core::sec::SecurityFlag;
    use crate::model::data::to_vec;
    use crate::model::error::RdpErrorKind;
    use crate::model::link::{Link, ScriptedStream, Stream};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    const SERVER_RANDOM: [u8; 32] = [0x42; 32];

    fn link(input: Vec<u8>) -> (Link<ScriptedStream>, Rc<RefCell<Vec<u8>>>) {
        let (stream, output) = ScriptedStream::new(input);
        (Link::new(Stream::Raw(stream)), output)
    }

    fn secured_server_data() -> gcc::ServerData {
        let mut data = server_data(0);
        data.security = gcc::ServerSecurityData {
            encryption_method: gcc::ENCRYPTION_FLAG_128BIT,
            encryption_level: gcc::ENCRYPTION_LEVEL_CLIENT_COMPATIBLE,
            key_info: Some(gcc::ServerKeyInfo {
                server_random: SERVER_RANDOM.to_vec(),
                certificate: ServerCertificate::Proprietary {
                    public_key: test_public_key(),
                    signature: vec![0; 72],
                },
            }),
        };
        data
    }

    /// Provider ultimatum in a data TPDU then the X224 disconnect request
    const DISCONNECT_TAIL: [u8; 20] = [
        3, 0, 0, 9, 2, 0xf0, 0x80, 0x21, 0x80, 3, 0, 0, 11, 6, 0x80, 0, 0, 0, 0, 0,
    ];

    fn assert_disconnected(output: &Rc<RefCell<Vec<u8>>>) {
        let written = output.borrow();
        assert!(written.ends_with(&DISCONNECT_TAIL), "{:02x?}", &written[..]);
    }

    fn script(server_data: &gcc::ServerData, license: Vec<u8>) -> Vec<u8> {
        let mut input = confirm_frame();
        input.extend(server_frames(server_data, &[0, 0]));
        input.extend(license);
        input
    }

    #[test]
    fn test_minimal_handshake() {
        let (channel, output) = link(script(&server_data(0), license_frames(&[result()])));
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        let connection = Connector::new()
            .credentials("", "user", "")
            .connect(channel, &mut store)
            .unwrap();

        assert_eq!(connection.state(), McsState::Ready);
        assert_eq!(connection.license_state(), LicenseState::Declined);
        assert!(!connection.is_secured());
        assert_eq!(
            connection.channels().keys().collect::<Vec<_>>(),
            ["user", "global"]
        );

        let sent = sent_domain_pdus(&output.borrow());
        let attach = sent
            .iter()
            .filter(|pdu| matches!(pdu, DomainPdu::AttachUserRequest))
            .count();
        let joins = sent
            .iter()
            .filter(|pdu| matches!(pdu, DomainPdu::ChannelJoinRequest { .. }))
            .count();
        assert_eq!((attach, joins), (1, 2));

        let payloads = sent_payloads(&output.borrow());
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0][..4], [0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_malformed_public_key() {
        let mut input = script(&secured_server_data(), vec![]);
        let magic = input
            .windows(4)
            .position(|window| window == b"RSA1")
            .unwrap();
        input[magic] = b'X';
        let (channel, output) = link(input);

        let error = Connector::new()
            .connect(channel, HashMap::<String, Vec<u8>>::new())
            .unwrap_err();
        assert_eq!(error.kind(), Some(RdpErrorKind::InvalidMagic));
        assert_eq!(error.phase(), Some(Phase::ChannelNegotiation));
        assert!(sent_payloads(&output.borrow()).is_empty());
    }

    #[test]
    fn test_license_issue() {
        let (channel, _) = link(script(
            &server_data(0),
            license_frames(&[demand(), issue(b"issued-license", 0)]),
        ));
        let mut store: HashMap<String, Vec<u8>> = HashMap::new();
        let connection = Connector::new()
            .client_name(HOST)
            .connect(channel, &mut store)
            .unwrap();
        assert_eq!(connection.license_state(), LicenseState::Issued);
        assert_eq!(store.get(HOST).unwrap(), b"issued-license");
    }

    #[test]
    fn test_encrypted_handshake() {
        let server_data = secured_server_data();
        let (channel, output) = link(script(&server_data, license_frames(&[result()])));
        let connector = Connector::new().credentials("corp", "alice", "secret");
        let connection = connector
            .connect(channel, HashMap::<String, Vec<u8>>::new())
            .unwrap();
        assert!(connection.is_secured());

        let payloads = sent_payloads(&output.borrow());
        assert_eq!(payloads.len(), 2);

        let exchange = &payloads[0];
        assert_eq!(exchange[..8], [0x01, 0x00, 0x00, 0x00, 72, 0, 0, 0]);
        let client_random = keys::rsa_decrypt(
            &exchange[8..72],
            &hex::decode(TEST_MODULUS).unwrap(),
            &hex::decode(TEST_PRIVATE_EXPONENT).unwrap(),
        );
        let keys = SessionKeys::derive(
            &client_random[..32],
            &SERVER_RANDOM,
            KeyStrength::Full,
            Role::Responder,
        )
        .unwrap();

        let info = &payloads[1];
        let flags = u16::from_le_bytes([info[0], info[1]]);
        assert_eq!(
            flags,
            SecurityFlag::SecInfoPkt as u16 | SecurityFlag::SecEncrypt as u16
        );
        let plain = SecureChannel::new(&keys)
            .unprotect(&info[4..12], &info[12..])
            .unwrap();
        assert_eq!(plain, to_vec(&connector.info.component(true)).unwrap());
    }

    #[test]
    fn test_framing_failure() {
        let (channel, _) = link(vec![0x02, 0x00, 0x00, 0x0b, 6, 0xd0, 0, 0, 0, 0, 0]);
        let error = Connector::new()
            .connect(channel, HashMap::<String, Vec<u8>>::new())
            .unwrap_err();
        assert_eq!(error.kind(), Some(RdpErrorKind::InvalidVersion));
        assert_eq!(error.phase(), Some(Phase::Framing));
    }

    #[test]
    fn test_unsupported_encryption_method() {
        let mut server_data = secured_server_data();
        server_data.security.encryption_method = gcc::ENCRYPTION_FLAG_56BIT;
        let (channel, output) = link(script(&server_data, vec![]));
        let error = Connector::new()
            .connect(channel, HashMap::<String, Vec<u8>>::new())
            .unwrap_err();
        assert_eq!(error.kind(), Some(RdpErrorKind::NotImplemented));
        assert_eq!(error.phase(), Some(Phase::KeyExchange));
        assert_disconnected(&output);
    }

    #[test]
    fn test_licensing_failure_disconnects() {
        // data security header instead of a license one
        let (channel, output) = link(script(
            &server_data(0),
            indication(vec![0x40, 0x00, 0x00, 0x00, 1]),
        ));
        let error = Connector::new()
            .connect(channel, HashMap::<String, Vec<u8>>::new())
            .unwrap_err();
        assert_eq!(error.kind(), Some(RdpErrorKind::InvalidRespond));
        assert_eq!(error.phase(), Some(Phase::Licensing));
        // client info went out before the failure
        assert_eq!(sent_payloads(&output.borrow()).len(), 1);
        assert_disconnected(&output);
    }

    #[test]
    fn test_client_data_follows_settings() {
        let data = Connector::new()
            .screen(800, 600)
            .channels(&["cliprdr", "rdpsnd"])
            .console_session(true)
            .client_data(Protocols::ProtocolRDP);
        assert_eq!((data.core.desktop_width, data.core.desktop_height), (800, 600));
        assert_eq!(data.network.channels.len(), 2);
        assert_eq!(data.core.keyboard_layout, gcc::KBD_LAYOUT_US);
        assert!(data.cluster.unwrap().redirection_supported());
        assert_eq!(
            data.security.encryption_methods,
            gcc::ENCRYPTION_FLAG_40BIT | gcc::ENCRYPTION_FLAG_128BIT
        );
    }
}
