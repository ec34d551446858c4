use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use proxy_socks::Socks5FailureCode;
use tokio::net::{TcpSocket, TcpStream, lookup_host};

use crate::target_addr::TargetAddr;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials the target over TCP, binding the outbound socket to the
/// server-local IP so the connection leaves through the same interface the
/// client reached.
pub async fn dial_upstream(target: &TargetAddr, local_ip: IpAddr) -> io::Result<TcpStream> {
    let addr = resolve_target(target, local_ip).await?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(local_ip, 0))?;

    match tokio::time::timeout(DIAL_TIMEOUT, socket.connect(addr)).await {
        Ok(connected) => connected,
        Err(_elapsed) => Err(io::Error::new(io::ErrorKind::TimedOut, "upstream dial timed out")),
    }
}

async fn resolve_target(target: &TargetAddr, local_ip: IpAddr) -> io::Result<SocketAddr> {
    if let Some(ip) = target.host_ip() {
        return Ok(SocketAddr::new(ip, target.port()));
    }

    let mut fallback = None;
    for addr in lookup_host((target.host(), target.port())).await? {
        if addr.is_ipv4() == local_ip.is_ipv4() {
            return Ok(addr);
        }
        fallback.get_or_insert(addr);
    }

    fallback.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host lookup yielded no result"))
}

/// Maps an upstream dial failure onto the SOCKS5 reply code by the OS error
/// text.
pub fn socks_code_for_dial_error(error: &io::Error) -> Socks5FailureCode {
    let message = error.to_string();

    if message.contains("refused") {
        Socks5FailureCode::ConnectionRefused
    } else if message.contains("network is unreachable") {
        Socks5FailureCode::NetworkUnreachable
    } else {
        Socks5FailureCode::HostUnreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_error_mapping_follows_the_os_error_text() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert_eq!(socks_code_for_dial_error(&refused), Socks5FailureCode::ConnectionRefused);

        let unreachable = io::Error::new(io::ErrorKind::Other, "network is unreachable");
        assert_eq!(socks_code_for_dial_error(&unreachable), Socks5FailureCode::NetworkUnreachable);

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "upstream dial timed out");
        assert_eq!(socks_code_for_dial_error(&timeout), Socks5FailureCode::HostUnreachable);
    }

    #[tokio::test]
    async fn dialing_a_listening_socket_binds_the_local_ip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = TargetAddr::parse(&listener.local_addr().unwrap().to_string(), None).unwrap();

        let stream = dial_upstream(&target, "127.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn refused_dial_reports_refused() {
        // Bind then drop to find a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = TargetAddr::parse(&addr.to_string(), None).unwrap();
        let error = dial_upstream(&target, "127.0.0.1".parse().unwrap()).await.unwrap_err();
        assert_eq!(socks_code_for_dial_error(&error), Socks5FailureCode::ConnectionRefused);
    }
}
