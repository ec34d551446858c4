//! TLS ClientHello parsing, RFC 8446 §4.1.2 framing.
//!
//! The relay only consumes the SNI, but the whole message is validated so a
//! random payload that happens to start with 0x16 does not produce a bogus
//! hostname.

use std::collections::HashSet;

/// Signalling cipher suite value for secure renegotiation (RFC 5746).
const SCSV_RENEGOTIATION: u16 = 0x00ff;

const STATUS_TYPE_OCSP: u8 = 1;

/// TLS extension identifiers, per the IANA registry.
mod ext {
    pub(super) const SERVER_NAME: u16 = 0;
    pub(super) const STATUS_REQUEST: u16 = 5;
    pub(super) const SUPPORTED_GROUPS: u16 = 10;
    pub(super) const EC_POINT_FORMATS: u16 = 11;
    pub(super) const SIGNATURE_ALGORITHMS: u16 = 13;
    pub(super) const ALPN: u16 = 16;
    pub(super) const SCT: u16 = 18;
    pub(super) const EXTENDED_MASTER_SECRET: u16 = 23;
    pub(super) const SESSION_TICKET: u16 = 35;
    pub(super) const PRE_SHARED_KEY: u16 = 41;
    pub(super) const EARLY_DATA: u16 = 42;
    pub(super) const SUPPORTED_VERSIONS: u16 = 43;
    pub(super) const COOKIE: u16 = 44;
    pub(super) const PSK_MODES: u16 = 45;
    pub(super) const CERTIFICATE_AUTHORITIES: u16 = 47;
    pub(super) const SIGNATURE_ALGORITHMS_CERT: u16 = 50;
    pub(super) const KEY_SHARE: u16 = 51;
    pub(super) const QUIC_TRANSPORT_PARAMETERS: u16 = 57;
    pub(super) const RENEGOTIATION_INFO: u16 = 0xff01;
    pub(super) const ECH_OUTER_EXTENSIONS: u16 = 0xfd00;
    pub(super) const ENCRYPTED_CLIENT_HELLO: u16 = 0xfe0d;
}

#[derive(Debug, thiserror::Error)]
pub enum HelloParseError {
    #[error("empty buffer")]
    Empty,
    #[error("not a TLS handshake record")]
    NotHandshake,
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("duplicate extension {0}")]
    DuplicateExtension(u16),
}

use HelloParseError::Malformed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    pub group: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskIdentity {
    pub label: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

#[derive(Debug, Default, Clone)]
pub struct ClientHello {
    pub version: u16,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub server_name: Option<String>,
    pub ocsp_stapling: bool,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub ticket_supported: bool,
    pub session_ticket: Vec<u8>,
    pub signature_schemes: Vec<u16>,
    pub signature_schemes_cert: Vec<u16>,
    pub secure_renegotiation_supported: bool,
    pub secure_renegotiation: Vec<u8>,
    pub extended_master_secret: bool,
    pub alpn_protocols: Vec<String>,
    pub scts: bool,
    pub supported_versions: Vec<u16>,
    pub cookie: Vec<u8>,
    pub key_shares: Vec<KeyShare>,
    pub early_data: bool,
    pub psk_modes: Vec<u8>,
    pub psk_identities: Vec<PskIdentity>,
    pub psk_binders: Vec<Vec<u8>>,
    pub quic_transport_parameters: Vec<u8>,
    pub certificate_authorities: Vec<u8>,
    pub ech_outer_extensions: Vec<u8>,
    pub encrypted_client_hello: Vec<u8>,
}

impl ClientHello {
    /// Parses a raw TCP buffer holding a TLS handshake record.
    pub fn parse(record: &[u8]) -> Result<Self, HelloParseError> {
        if record.is_empty() {
            return Err(HelloParseError::Empty);
        }
        if record[0] != 0x16 {
            return Err(HelloParseError::NotHandshake);
        }
        if record.len() < 5 {
            return Err(Malformed("record header"));
        }

        Self::parse_handshake(&record[5..])
    }

    fn parse_handshake(data: &[u8]) -> Result<Self, HelloParseError> {
        let mut hello = ClientHello::default();
        let mut s = Cursor::new(data);

        // Handshake type and 24-bit length.
        s.skip(4).ok_or(Malformed("handshake header"))?;

        hello.version = s.u16().ok_or(Malformed("legacy_version"))?;
        hello.random = s.bytes(32).ok_or(Malformed("random"))?.to_vec();
        hello.session_id = s.u8_prefixed().ok_or(Malformed("session_id"))?.to_vec();

        let mut cipher_suites = Cursor::new(s.u16_prefixed().ok_or(Malformed("cipher_suites"))?);
        while !cipher_suites.is_empty() {
            let suite = cipher_suites.u16().ok_or(Malformed("cipher_suites"))?;
            if suite == SCSV_RENEGOTIATION {
                hello.secure_renegotiation_supported = true;
            }
            hello.cipher_suites.push(suite);
        }

        hello.compression_methods = s.u8_prefixed().ok_or(Malformed("compression_methods"))?.to_vec();

        // A ClientHello without an extensions block never carries an SNI;
        // reject it rather than report a half-parsed message.
        if s.is_empty() {
            return Err(Malformed("extensions block"));
        }

        let extensions_block = s.u16_prefixed().ok_or(Malformed("extensions block"))?;
        if !s.is_empty() {
            return Err(Malformed("bytes after extensions"));
        }

        let mut extensions = Cursor::new(extensions_block);
        let mut seen = HashSet::new();

        while !extensions.is_empty() {
            let id = extensions.u16().ok_or(Malformed("extension header"))?;
            let data = extensions.u16_prefixed().ok_or(Malformed("extension data"))?;

            if !seen.insert(id) {
                return Err(HelloParseError::DuplicateExtension(id));
            }

            let mut ext = Cursor::new(data);

            match id {
                ext::SERVER_NAME => {
                    let mut names = Cursor::new(ext.u16_prefixed().ok_or(Malformed("server_name"))?);
                    if names.is_empty() {
                        return Err(Malformed("server_name"));
                    }
                    while !names.is_empty() {
                        let name_type = names.u8().ok_or(Malformed("server_name"))?;
                        let name = names.u16_prefixed().ok_or(Malformed("server_name"))?;
                        if name.is_empty() {
                            return Err(Malformed("server_name"));
                        }
                        // Only host_name entries are meaningful.
                        if name_type != 0 {
                            continue;
                        }
                        if hello.server_name.is_some() {
                            return Err(Malformed("server_name"));
                        }
                        let name = std::str::from_utf8(name).map_err(|_| Malformed("server_name"))?;
                        if name.ends_with('.') {
                            return Err(Malformed("server_name"));
                        }
                        hello.server_name = Some(name.to_owned());
                    }
                }
                ext::STATUS_REQUEST => {
                    let status_type = ext.u8().ok_or(Malformed("status_request"))?;
                    ext.u16_prefixed().ok_or(Malformed("status_request"))?;
                    ext.u16_prefixed().ok_or(Malformed("status_request"))?;
                    hello.ocsp_stapling = status_type == STATUS_TYPE_OCSP;
                }
                ext::SUPPORTED_GROUPS => {
                    let mut groups = Cursor::new(ext.u16_prefixed().ok_or(Malformed("supported_groups"))?);
                    if groups.is_empty() {
                        return Err(Malformed("supported_groups"));
                    }
                    while !groups.is_empty() {
                        hello
                            .supported_groups
                            .push(groups.u16().ok_or(Malformed("supported_groups"))?);
                    }
                }
                ext::EC_POINT_FORMATS => {
                    let formats = ext.u8_prefixed().ok_or(Malformed("ec_point_formats"))?;
                    if formats.is_empty() {
                        return Err(Malformed("ec_point_formats"));
                    }
                    hello.ec_point_formats = formats.to_vec();
                }
                ext::SESSION_TICKET => {
                    hello.ticket_supported = true;
                    hello.session_ticket = ext.take_rest().to_vec();
                }
                ext::SIGNATURE_ALGORITHMS => {
                    let mut schemes = Cursor::new(ext.u16_prefixed().ok_or(Malformed("signature_algorithms"))?);
                    if schemes.is_empty() {
                        return Err(Malformed("signature_algorithms"));
                    }
                    while !schemes.is_empty() {
                        hello
                            .signature_schemes
                            .push(schemes.u16().ok_or(Malformed("signature_algorithms"))?);
                    }
                }
                ext::SIGNATURE_ALGORITHMS_CERT => {
                    let mut schemes = Cursor::new(ext.u16_prefixed().ok_or(Malformed("signature_algorithms_cert"))?);
                    if schemes.is_empty() {
                        return Err(Malformed("signature_algorithms_cert"));
                    }
                    while !schemes.is_empty() {
                        hello
                            .signature_schemes_cert
                            .push(schemes.u16().ok_or(Malformed("signature_algorithms_cert"))?);
                    }
                }
                ext::RENEGOTIATION_INFO => {
                    hello.secure_renegotiation = ext.u8_prefixed().ok_or(Malformed("renegotiation_info"))?.to_vec();
                    hello.secure_renegotiation_supported = true;
                }
                ext::EXTENDED_MASTER_SECRET => {
                    hello.extended_master_secret = true;
                }
                ext::ALPN => {
                    let mut protocols = Cursor::new(ext.u16_prefixed().ok_or(Malformed("alpn"))?);
                    if protocols.is_empty() {
                        return Err(Malformed("alpn"));
                    }
                    while !protocols.is_empty() {
                        let protocol = protocols.u8_prefixed().ok_or(Malformed("alpn"))?;
                        if protocol.is_empty() {
                            return Err(Malformed("alpn"));
                        }
                        hello
                            .alpn_protocols
                            .push(String::from_utf8_lossy(protocol).into_owned());
                    }
                }
                ext::SCT => {
                    hello.scts = true;
                }
                ext::SUPPORTED_VERSIONS => {
                    let mut versions = Cursor::new(ext.u8_prefixed().ok_or(Malformed("supported_versions"))?);
                    if versions.is_empty() {
                        return Err(Malformed("supported_versions"));
                    }
                    while !versions.is_empty() {
                        hello
                            .supported_versions
                            .push(versions.u16().ok_or(Malformed("supported_versions"))?);
                    }
                }
                ext::COOKIE => {
                    let cookie = ext.u16_prefixed().ok_or(Malformed("cookie"))?;
                    if cookie.is_empty() {
                        return Err(Malformed("cookie"));
                    }
                    hello.cookie = cookie.to_vec();
                }
                ext::KEY_SHARE => {
                    let mut shares = Cursor::new(ext.u16_prefixed().ok_or(Malformed("key_share"))?);
                    while !shares.is_empty() {
                        let group = shares.u16().ok_or(Malformed("key_share"))?;
                        let data = shares.u16_prefixed().ok_or(Malformed("key_share"))?;
                        if data.is_empty() {
                            return Err(Malformed("key_share"));
                        }
                        hello.key_shares.push(KeyShare {
                            group,
                            data: data.to_vec(),
                        });
                    }
                }
                ext::EARLY_DATA => {
                    hello.early_data = true;
                }
                ext::PSK_MODES => {
                    hello.psk_modes = ext.u8_prefixed().ok_or(Malformed("psk_key_exchange_modes"))?.to_vec();
                }
                ext::CERTIFICATE_AUTHORITIES => {
                    let authorities = ext.take_rest();
                    if authorities.is_empty() {
                        return Err(Malformed("certificate_authorities"));
                    }
                    hello.certificate_authorities = authorities.to_vec();
                }
                ext::QUIC_TRANSPORT_PARAMETERS => {
                    hello.quic_transport_parameters = ext.take_rest().to_vec();
                }
                ext::ECH_OUTER_EXTENSIONS => {
                    hello.ech_outer_extensions = ext.take_rest().to_vec();
                }
                ext::ENCRYPTED_CLIENT_HELLO => {
                    hello.encrypted_client_hello = ext.take_rest().to_vec();
                }
                ext::PRE_SHARED_KEY => {
                    // pre_shared_key must be the last extension.
                    if !extensions.is_empty() {
                        return Err(Malformed("pre_shared_key position"));
                    }

                    let mut identities = Cursor::new(ext.u16_prefixed().ok_or(Malformed("pre_shared_key"))?);
                    if identities.is_empty() {
                        return Err(Malformed("pre_shared_key"));
                    }
                    while !identities.is_empty() {
                        let label = identities.u16_prefixed().ok_or(Malformed("pre_shared_key"))?;
                        let obfuscated_ticket_age = identities.u32().ok_or(Malformed("pre_shared_key"))?;
                        if label.is_empty() {
                            return Err(Malformed("pre_shared_key"));
                        }
                        hello.psk_identities.push(PskIdentity {
                            label: label.to_vec(),
                            obfuscated_ticket_age,
                        });
                    }

                    let mut binders = Cursor::new(ext.u16_prefixed().ok_or(Malformed("pre_shared_key"))?);
                    if binders.is_empty() {
                        return Err(Malformed("pre_shared_key"));
                    }
                    while !binders.is_empty() {
                        let binder = binders.u8_prefixed().ok_or(Malformed("pre_shared_key"))?;
                        if binder.is_empty() {
                            return Err(Malformed("pre_shared_key"));
                        }
                        hello.psk_binders.push(binder.to_vec());
                    }
                }
                _ => continue,
            }

            if !ext.is_empty() {
                return Err(Malformed("extension trailing bytes"));
            }
        }

        Ok(hello)
    }
}

/// Bounded big-endian reader over a byte slice.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        self.bytes(count).map(|_| ())
    }

    fn bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        if self.rest.len() < count {
            return None;
        }
        let (taken, rest) = self.rest.split_at(count);
        self.rest = rest;
        Some(taken)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.rest)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.bytes(usize::from(len))
    }

    fn u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.bytes(usize::from(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sni_entry(name_type: u8, host: &[u8]) -> Vec<u8> {
        let mut entry = vec![name_type];
        entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        entry.extend_from_slice(host);
        entry
    }

    fn sni_ext(entries: &[Vec<u8>]) -> Vec<u8> {
        let list: Vec<u8> = entries.concat();
        let mut data = (list.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&list);
        data
    }

    fn supported_versions_ext(versions: &[u16]) -> Vec<u8> {
        let mut data = vec![(versions.len() * 2) as u8];
        for version in versions {
            data.extend_from_slice(&version.to_be_bytes());
        }
        data
    }

    fn alpn_ext(protocols: &[&[u8]]) -> Vec<u8> {
        let mut list = Vec::new();
        for protocol in protocols {
            list.push(protocol.len() as u8);
            list.extend_from_slice(protocol);
        }
        let mut data = (list.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&list);
        data
    }

    fn key_share_ext(group: u16, share: &[u8]) -> Vec<u8> {
        let mut entry = group.to_be_bytes().to_vec();
        entry.extend_from_slice(&(share.len() as u16).to_be_bytes());
        entry.extend_from_slice(share);
        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&entry);
        data
    }

    fn psk_ext() -> Vec<u8> {
        let mut identity = (2u16).to_be_bytes().to_vec();
        identity.extend_from_slice(b"id");
        identity.extend_from_slice(&1234u32.to_be_bytes());

        let mut binder = vec![32u8];
        binder.extend_from_slice(&[0xab; 32]);

        let mut data = (identity.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&identity);
        data.extend_from_slice(&(binder.len() as u16).to_be_bytes());
        data.extend_from_slice(&binder);
        data
    }

    fn hello_record(extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0x42; 32]);
        body.push(0); // empty session id

        let suites = [0x1301u16, SCSV_RENEGOTIATION];
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for suite in suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }

        body.extend_from_slice(&[1, 0]); // null compression only

        let mut ext_block = Vec::new();
        for (id, data) in extensions {
            ext_block.extend_from_slice(&id.to_be_bytes());
            ext_block.extend_from_slice(&(data.len() as u16).to_be_bytes());
            ext_block.extend_from_slice(data);
        }
        body.extend_from_slice(&(ext_block.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext_block);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn well_formed_hello_yields_its_sni() {
        let record = hello_record(&[
            (ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com")])),
            (ext::SUPPORTED_VERSIONS, supported_versions_ext(&[0x0304, 0x0303])),
            (ext::ALPN, alpn_ext(&[b"h2", b"http/1.1"])),
            (ext::KEY_SHARE, key_share_ext(29, &[0x11; 32])),
        ]);

        let hello = ClientHello::parse(&record).unwrap();

        assert_eq!(hello.server_name.as_deref(), Some("internal.example.com"));
        assert_eq!(hello.version, 0x0303);
        assert_eq!(hello.random, vec![0x42; 32]);
        assert_eq!(hello.cipher_suites, vec![0x1301, SCSV_RENEGOTIATION]);
        assert!(hello.secure_renegotiation_supported);
        assert_eq!(hello.alpn_protocols, vec!["h2".to_owned(), "http/1.1".to_owned()]);
        assert_eq!(hello.supported_versions, vec![0x0304, 0x0303]);
        assert_eq!(hello.key_shares.len(), 1);
        assert_eq!(hello.key_shares[0].group, 29);
    }

    #[test]
    fn pre_shared_key_is_accepted_as_the_last_extension() {
        let record = hello_record(&[
            (ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com")])),
            (ext::PRE_SHARED_KEY, psk_ext()),
        ]);

        let hello = ClientHello::parse(&record).unwrap();
        assert_eq!(hello.psk_identities.len(), 1);
        assert_eq!(hello.psk_identities[0].label, b"id");
        assert_eq!(hello.psk_binders.len(), 1);
    }

    #[test]
    fn pre_shared_key_must_be_last() {
        let record = hello_record(&[
            (ext::PRE_SHARED_KEY, psk_ext()),
            (ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com")])),
        ]);

        assert!(matches!(
            ClientHello::parse(&record),
            Err(HelloParseError::Malformed("pre_shared_key position"))
        ));
    }

    #[test]
    fn duplicate_extensions_are_rejected() {
        let record = hello_record(&[
            (ext::EARLY_DATA, Vec::new()),
            (ext::EARLY_DATA, Vec::new()),
        ]);

        assert!(matches!(
            ClientHello::parse(&record),
            Err(HelloParseError::DuplicateExtension(id)) if id == ext::EARLY_DATA
        ));
    }

    #[test]
    fn trailing_dot_in_sni_is_rejected() {
        let record = hello_record(&[(ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com.")]))]);

        assert!(ClientHello::parse(&record).is_err());
    }

    #[test]
    fn non_hostname_sni_entries_are_skipped() {
        let record = hello_record(&[(ext::SERVER_NAME, sni_ext(&[sni_entry(1, b"ignored.example.com")]))]);

        let hello = ClientHello::parse(&record).unwrap();
        assert_eq!(hello.server_name, None);
    }

    #[test]
    fn unknown_extensions_are_skipped_wholesale() {
        let record = hello_record(&[
            (0x7777, vec![1, 2, 3, 4]),
            (ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com")])),
        ]);

        let hello = ClientHello::parse(&record).unwrap();
        assert_eq!(hello.server_name.as_deref(), Some("internal.example.com"));
    }

    #[test]
    fn extension_trailing_bytes_are_rejected() {
        let mut data = sni_ext(&[sni_entry(0, b"internal.example.com")]);
        data.push(0xff);
        let record = hello_record(&[(ext::SERVER_NAME, data)]);

        assert!(matches!(
            ClientHello::parse(&record),
            Err(HelloParseError::Malformed("extension trailing bytes"))
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = hello_record(&[(ext::SERVER_NAME, sni_ext(&[sni_entry(0, b"internal.example.com")]))]);

        for len in [0, 1, 4, 20, record.len() - 1] {
            assert!(ClientHello::parse(&record[..len]).is_err(), "accepted {len} bytes");
        }
    }

    #[test]
    fn non_handshake_payload_is_rejected_up_front() {
        assert!(matches!(
            ClientHello::parse(b"GET / HTTP/1.1\r\n"),
            Err(HelloParseError::NotHandshake)
        ));
        assert!(matches!(ClientHello::parse(b""), Err(HelloParseError::Empty)));
    }

    #[test]
    fn hello_without_extensions_is_rejected() {
        let record = hello_record(&[]);
        // Strip the (empty) extensions block: keep everything up to the
        // compression methods.
        let truncated = &record[..record.len() - 2];

        assert!(ClientHello::parse(truncated).is_err());
    }
}
