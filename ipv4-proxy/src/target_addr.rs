use core::fmt;
use std::net::IpAddr;

use proxy_socks::DestAddr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BadTargetAddr {
    #[error("host is missing")]
    HostMissing,
    #[error("port is missing")]
    PortMissing,
    #[error("bad port value: {value}")]
    BadPort { value: String },
}

/// `<HOST>:<PORT>` destination of a proxied flow.
///
/// The host keeps its textual form; when it parses as an IP literal the
/// address is kept alongside so the dialer can skip resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    host: String,
    ip: Option<IpAddr>,
    port: u16,
}

impl TargetAddr {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            ip: host.parse().ok(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]:port` or a bare IPv6 literal,
    /// falling back to `default_port` when the port is absent.
    pub fn parse(s: &str, default_port: impl Into<Option<u16>>) -> Result<Self, BadTargetAddr> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or(BadTargetAddr::HostMissing)?;
            let port = match rest.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => default_port.into().ok_or(BadTargetAddr::PortMissing)?,
            };
            if host.is_empty() {
                return Err(BadTargetAddr::HostMissing);
            }
            return Ok(Self::new(host, port));
        }

        // More than one colon without brackets: a bare IPv6 literal.
        if s.matches(':').count() > 1 {
            let port = default_port.into().ok_or(BadTargetAddr::PortMissing)?;
            return Ok(Self::new(s, port));
        }

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (s, default_port.into().ok_or(BadTargetAddr::PortMissing)?),
        };

        if host.is_empty() {
            return Err(BadTargetAddr::HostMissing);
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn host_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self.ip, Some(IpAddr::V6(_))) {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<&DestAddr> for TargetAddr {
    fn from(dest: &DestAddr) -> Self {
        match dest {
            DestAddr::Ip(addr) => Self {
                host: addr.ip().to_string(),
                ip: Some(addr.ip()),
                port: addr.port(),
            },
            DestAddr::Domain(domain, port) => Self::new(domain, *port),
        }
    }
}

fn parse_port(value: &str) -> Result<u16, BadTargetAddr> {
    value.parse().map_err(|_| BadTargetAddr::BadPort {
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_with_port() {
        let addr = TargetAddr::parse("updates.example.com:8443", None).unwrap();
        assert_eq!(addr.host(), "updates.example.com");
        assert_eq!(addr.port(), 8443);
        assert_eq!(addr.host_ip(), None);
        assert_eq!(addr.to_string(), "updates.example.com:8443");
    }

    #[test]
    fn domain_without_port_takes_the_default() {
        let addr = TargetAddr::parse("updates.example.com", 80).unwrap();
        assert_eq!(addr.port(), 80);

        assert_eq!(TargetAddr::parse("updates.example.com", None), Err(BadTargetAddr::PortMissing));
    }

    #[test]
    fn ipv4_literal() {
        let addr = TargetAddr::parse("1.2.3.4:443", None).unwrap();
        assert_eq!(addr.host_ip(), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(addr.to_string(), "1.2.3.4:443");
    }

    #[test]
    fn bracketed_and_bare_ipv6() {
        let addr = TargetAddr::parse("[2001:db8::1]:443", None).unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");

        let addr = TargetAddr::parse("2001:db8::1", 443).unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert!(addr.host_ip().is_some());
    }

    #[test]
    fn bad_inputs() {
        assert_eq!(
            TargetAddr::parse("example.com:http", None),
            Err(BadTargetAddr::BadPort {
                value: "http".to_owned()
            })
        );
        assert_eq!(TargetAddr::parse(":443", None), Err(BadTargetAddr::HostMissing));
    }

    #[test]
    fn from_socks_destinations() {
        let addr = TargetAddr::from(&DestAddr::Ip("192.168.0.39:80".parse().unwrap()));
        assert_eq!(addr.to_string(), "192.168.0.39:80");

        let addr = TargetAddr::from(&DestAddr::Domain("example.net".to_owned(), 8080));
        assert_eq!(addr.to_string(), "example.net:8080");
        assert_eq!(addr.host_ip(), None);
    }
}
