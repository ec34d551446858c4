use crate::ReadWriteStream;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const PASSWORD_NEGOTIATION_VERSION: u8 = 0x01;
const ADDR_MAX_LEN: usize = 260;

const AUTH_METHOD_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_STATUS_SUCCESS: u8 = 0x00;
const AUTH_STATUS_FAILURE: u8 = 0x01;

/// Destination (or bound) address carried in SOCKS5 requests and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl DestAddr {
    pub fn host(&self) -> String {
        match self {
            DestAddr::Ip(addr) => addr.ip().to_string(),
            DestAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            DestAddr::Ip(addr) => addr.port(),
            DestAddr::Domain(_, port) => *port,
        }
    }
}

impl core::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DestAddr::Ip(addr) => write!(f, "{addr}"),
            DestAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// SOCKS5 failure codes defined in RFC1928.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5FailureCode {
    GeneralSocksServerFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl std::error::Error for Socks5FailureCode {}

impl core::fmt::Display for Socks5FailureCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Socks5FailureCode::GeneralSocksServerFailure => write!(f, "general SOCKS server failure"),
            Socks5FailureCode::ConnectionNotAllowedByRuleset => write!(f, "connection not allowed by ruleset"),
            Socks5FailureCode::NetworkUnreachable => write!(f, "network unreachable"),
            Socks5FailureCode::HostUnreachable => write!(f, "host unreachable"),
            Socks5FailureCode::ConnectionRefused => write!(f, "connection refused"),
            Socks5FailureCode::TtlExpired => write!(f, "TTL expired"),
            Socks5FailureCode::CommandNotSupported => write!(f, "command not supported"),
            Socks5FailureCode::AddressTypeNotSupported => write!(f, "address type not supported"),
        }
    }
}

impl Socks5FailureCode {
    fn to_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug)]
pub struct SocksRequest {
    pub command: Command,
    pub dest: DestAddr,
}

impl SocksRequest {
    pub fn is_connect(&self) -> bool {
        matches!(self.command, Command::Connect)
    }
}

/// Staged SOCKS5 request acceptor for usage in the proxy server.
///
/// `start` performs the method negotiation and unconditionally selects
/// username/password authentication; the caller then reads the credentials,
/// decides, and either denies or grants before reading the request.
#[derive(Debug)]
pub struct Socks5Acceptor<S> {
    inner: S,
}

impl<S> Socks5Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn start(mut stream: S) -> io::Result<Self> {
        negotiate_password_method(&mut stream).await?;
        Ok(Self { inner: stream })
    }

    /// Reads the RFC 1929 username/password subnegotiation.
    pub async fn read_credentials(&mut self) -> io::Result<(String, String)> {
        let request = PasswordNegotiationRequest::read(&mut self.inner).await?;
        Ok((request.username, request.password))
    }

    /// Answers the subnegotiation with a failure status and consumes the
    /// acceptor; the caller closes the stream by dropping it.
    pub async fn deny_authentication(mut self) -> io::Result<()> {
        PasswordNegotiationResponse {
            status: AUTH_STATUS_FAILURE,
        }
        .write(&mut self.inner)
        .await
    }

    pub async fn grant_authentication(&mut self) -> io::Result<()> {
        PasswordNegotiationResponse {
            status: AUTH_STATUS_SUCCESS,
        }
        .write(&mut self.inner)
        .await
    }

    /// Reads the SOCKS request. An unrecognized address type yields an
    /// `io::ErrorKind::Unsupported` error so the caller can answer with
    /// [`Socks5FailureCode::AddressTypeNotSupported`].
    pub async fn read_request(&mut self) -> io::Result<SocksRequest> {
        SocksRequest::read(&mut self.inner).await
    }

    /// Sends a SOCKS failure reply and consumes the acceptor.
    pub async fn failed(mut self, code: Socks5FailureCode) -> io::Result<()> {
        SocksResponse::failure(code).write(&mut self.inner).await
    }

    /// Sends the final success reply carrying the local address the server
    /// used to connect to the target, and hands the stream back for the
    /// relay.
    pub async fn connected(mut self, bound_address: DestAddr) -> io::Result<S> {
        SocksResponse::success(bound_address).write(&mut self.inner).await?;
        Ok(self.inner)
    }
}

// Negotiation request (client greeting)
// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
//
// The server always answers {0x05, 0x02}; a client that did not offer
// username/password is disconnected right after.
async fn negotiate_password_method(stream: &mut dyn ReadWriteStream) -> io::Result<()> {
    let mut fixed_part = [0; 2];
    stream.read_exact(&mut fixed_part).await?;
    let [version, nmethods] = fixed_part;

    if version != SOCKS_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid request version"));
    }

    let mut methods = vec![0; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS_VERSION, AUTH_METHOD_USERNAME_PASSWORD]).await?;

    if !methods.contains(&AUTH_METHOD_USERNAME_PASSWORD) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client does not accept username/password authentication",
        ));
    }

    Ok(())
}

// https://datatracker.ietf.org/doc/html/rfc1929
// +----+------+----------+------+----------+
// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
// +----+------+----------+------+----------+
// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
// +----+------+----------+------+----------+
struct PasswordNegotiationRequest {
    username: String,
    password: String,
}

impl PasswordNegotiationRequest {
    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        if stream.read_u8().await? != PASSWORD_NEGOTIATION_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid negotiation version"));
        }

        let username_len = usize::from(stream.read_u8().await?);
        let mut username = vec![0; username_len];
        stream.read_exact(&mut username).await?;
        let username =
            String::from_utf8(username).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf8 for username"))?;

        let password_len = usize::from(stream.read_u8().await?);
        let mut password = vec![0; password_len];
        stream.read_exact(&mut password).await?;
        let password =
            String::from_utf8(password).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf8 for password"))?;

        Ok(Self { username, password })
    }
}

/// https://datatracker.ietf.org/doc/html/rfc1929
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
struct PasswordNegotiationResponse {
    status: u8,
}

impl PasswordNegotiationResponse {
    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let packet = [PASSWORD_NEGOTIATION_VERSION, self.status];
        stream.write_all(&packet).await?;
        Ok(())
    }
}

/// SOCKS request
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
impl SocksRequest {
    async fn read(stream: &mut dyn ReadWriteStream) -> io::Result<Self> {
        if stream.read_u8().await? != SOCKS_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid request version"));
        }

        let command = match stream.read_u8().await? {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown command")),
        };

        if stream.read_u8().await? != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid reserved byte"));
        }

        let dest = read_addr(stream).await?;

        Ok(Self { command, dest })
    }
}

/// SOCKS reply
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
struct SocksResponse {
    rep: u8,
    bnd: DestAddr,
}

impl SocksResponse {
    const FIXED_PART_LEN: usize = 3;

    fn failure(code: Socks5FailureCode) -> Self {
        Self {
            rep: code.to_u8(),
            bnd: DestAddr::Ip(SocketAddr::from(([0, 0, 0, 0], 0))),
        }
    }

    fn success(bound_address: DestAddr) -> Self {
        Self {
            rep: 0x00,
            bnd: bound_address,
        }
    }

    async fn write(&self, stream: &mut dyn ReadWriteStream) -> io::Result<()> {
        let mut packet = [0x00; ADDR_MAX_LEN + Self::FIXED_PART_LEN];

        // fixed part
        packet[0] = SOCKS_VERSION;
        packet[1] = self.rep;
        packet[2] = 0x00; // reserved

        // variable part
        let variable_part_len = write_addr(&self.bnd, &mut packet[Self::FIXED_PART_LEN..])?;

        let packet_len = Self::FIXED_PART_LEN + variable_part_len;
        stream.write_all(&packet[..packet_len]).await?;

        Ok(())
    }
}

// https://www.ietf.org/rfc/rfc1928.txt
// o  ATYP (1 byte)  address type of following addresses:
//     o  IP V4 address: X'01'
//     o  DOMAINNAME: X'03'
//     o  IP V6 address: X'04'
// o  DST.ADDR (variable)
// o  DST.PORT (2 bytes)

async fn read_addr(stream: &mut dyn ReadWriteStream) -> io::Result<DestAddr> {
    match stream.read_u8().await? {
        1 => {
            let ip = Ipv4Addr::from(stream.read_u32().await?);
            let port = stream.read_u16().await?;
            Ok(DestAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        3 => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0; len as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let port = stream.read_u16().await?;
            Ok(DestAddr::Domain(domain, port))
        }
        4 => {
            let mut ip = [0; 16];
            stream.read_exact(&mut ip).await?;
            let ip = Ipv6Addr::from(ip);
            let port = stream.read_u16().await?;
            Ok(DestAddr::Ip(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))))
        }
        _ => Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported address type")),
    }
}

fn write_addr(addr: &DestAddr, mut addr_buf: &mut [u8]) -> io::Result<usize> {
    let initial_len = addr_buf.len();

    match addr {
        DestAddr::Ip(SocketAddr::V4(addr)) => {
            addr_buf.write_all(&[1])?;
            addr_buf.write_all(&u32::from(*addr.ip()).to_be_bytes())?;
            addr_buf.write_all(&addr.port().to_be_bytes())?;
        }
        DestAddr::Ip(SocketAddr::V6(addr)) => {
            addr_buf.write_all(&[4])?;
            addr_buf.write_all(&addr.ip().octets())?;
            addr_buf.write_all(&addr.port().to_be_bytes())?;
        }
        DestAddr::Domain(domain, port) => {
            if let Ok(len) = u8::try_from(domain.len()) {
                addr_buf.write_all(&[3, len])?;
            } else {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "domain name too long"));
            }
            addr_buf.write_all(domain.as_bytes())?;
            addr_buf.write_all(&port.to_be_bytes())?;
        }
    }

    Ok(initial_len - addr_buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Negotiation behaviour against mocked byte exchanges.

    #[tokio::test]
    async fn greeting_selects_username_password() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 2, 0x00, 0x02])
            .write(&[5, 0x02])
            .build();

        Socks5Acceptor::start(stream).await.unwrap();
    }

    #[tokio::test]
    async fn greeting_without_password_method_is_rejected_after_selection() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x00])
            .write(&[5, 0x02])
            .build();

        let err = Socks5Acceptor::start(stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn bad_version_is_rejected() {
        let stream = tokio_test::io::Builder::new().read(&[4, 1, 0x02]).build();

        let err = Socks5Acceptor::start(stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "invalid request version");
    }

    #[tokio::test]
    async fn credentials_roundtrip_and_grant() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .read(&[1, 5, b'a', b'l', b'i', b'c', b'e', 9, b's', b'e', b'c', b'r', b'e', b't', b'1', b'2', b'3'])
            .write(&[1, 0x00])
            .build();

        let mut acceptor = Socks5Acceptor::start(stream).await.unwrap();
        let (username, password) = acceptor.read_credentials().await.unwrap();
        assert_eq!(username, "alice");
        assert_eq!(password, "secret123");
        acceptor.grant_authentication().await.unwrap();
    }

    #[tokio::test]
    async fn denied_authentication_writes_the_failure_status() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .read(&[1, 1, b'x', 1, b'y'])
            .write(&[1, 0x01])
            .build();

        let mut acceptor = Socks5Acceptor::start(stream).await.unwrap();
        acceptor.read_credentials().await.unwrap();
        acceptor.deny_authentication().await.unwrap();
    }

    #[tokio::test]
    async fn connect_request_with_ipv4_destination() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .read(&[5, 1, 0, 1, 192, 168, 0, 39, 0, 80])
            .build();

        let mut acceptor = Socks5Acceptor::start(stream).await.unwrap();
        let request = acceptor.read_request().await.unwrap();
        assert!(request.is_connect());
        assert_eq!(request.dest, DestAddr::Ip("192.168.0.39:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn unsupported_address_type_is_distinguishable() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .read(&[5, 1, 0, 9])
            .build();

        let mut acceptor = Socks5Acceptor::start(stream).await.unwrap();
        let err = acceptor.read_request().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn success_reply_carries_the_bound_address() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .write(&[5, 0, 0, 1, 10, 0, 0, 1, 0x04, 0x38])
            .build();

        let acceptor = Socks5Acceptor::start(stream).await.unwrap();
        acceptor.connected(DestAddr::Ip("10.0.0.1:1080".parse().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn failure_reply_uses_a_zero_bound_address() {
        let stream = tokio_test::io::Builder::new()
            .read(&[5, 1, 0x02])
            .write(&[5, 0x02])
            .write(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();

        let acceptor = Socks5Acceptor::start(stream).await.unwrap();
        acceptor.failed(Socks5FailureCode::ConnectionRefused).await.unwrap();
    }

    // Address encoding round-trips.

    async fn assert_encoding(addr: DestAddr, encoded: &[u8]) {
        let mut buf = [0; ADDR_MAX_LEN];
        let len = write_addr(&addr, &mut buf).unwrap();
        assert_eq!(&buf[..len], encoded);

        let mut reader = tokio_test::io::Builder::new().read(encoded).build();
        let decoded = read_addr(&mut reader).await.unwrap();
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn ipv4_addr() {
        assert_encoding(DestAddr::Ip("192.168.0.39:80".parse().unwrap()), &[1, 192, 168, 0, 39, 0, 80]).await;
    }

    #[tokio::test]
    async fn ipv6_addr() {
        assert_encoding(
            DestAddr::Ip("[2001:db8:85a3:8d3:1319:8a2e:370:7348]:443".parse().unwrap()),
            &[
                4, 32, 1, 13, 184, 133, 163, 8, 211, 19, 25, 138, 46, 3, 112, 115, 72, 1, 187,
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn domain_addr() {
        assert_encoding(
            DestAddr::Domain("example.net".to_owned(), 80),
            &[3, 11, 101, 120, 97, 109, 112, 108, 101, 46, 110, 101, 116, 0, 80],
        )
        .await;
    }
}
