//! First-payload inspection for proxied flows.
//!
//! The relay captures the first client payload of a flow and asks this crate
//! for the target hostname: a TLS ClientHello yields its SNI, an HTTP request
//! its `Host` header, and anything else falls back to a best-effort domain
//! scan over the raw bytes.

pub mod client_hello;

pub use client_hello::{ClientHello, HelloParseError};

use std::sync::OnceLock;

use regex::Regex;

/// TLS handshake record content type.
const TLS_HANDSHAKE: u8 = 0x16;

/// Tries, in order: TLS ClientHello SNI (when the payload looks like a
/// handshake record), HTTP `Host`, then the domain regex. A failed
/// ClientHello parse is treated as "no SNI found" and falls through to the
/// generic heuristics.
pub fn detect_host(payload: &[u8]) -> Option<String> {
    if payload.first() == Some(&TLS_HANDSHAKE) {
        if let Ok(hello) = ClientHello::parse(payload) {
            if let Some(server_name) = hello.server_name {
                return Some(server_name);
            }
        }
    }

    if let Some(host) = http_host(payload) {
        return Some(host);
    }

    extract_domain(&String::from_utf8_lossy(payload))
}

/// Extracts the `Host` header from a complete HTTP/1.x request head.
pub fn http_host(payload: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(payload) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) | Err(_) => return None,
    }

    request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("host"))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Returns the first domain-looking token of the text, if any.
pub fn extract_domain(text: &str) -> Option<String> {
    static DOMAIN_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = DOMAIN_REGEX.get_or_init(|| Regex::new(r"[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("domain regex"));

    regex.find(text).map(|found| found.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_yields_its_host_header() {
        let payload = b"GET / HTTP/1.1\r\nHost: intranet.example.org\r\nAccept: */*\r\n\r\n";
        assert_eq!(detect_host(payload).as_deref(), Some("intranet.example.org"));
    }

    #[test]
    fn incomplete_http_head_is_not_trusted() {
        let payload = b"GET / HTTP/1.1\r\nHost: intranet.example.org\r\n";
        assert_eq!(http_host(payload), None);
        // The regex fallback still finds the domain in the raw bytes.
        assert_eq!(detect_host(payload).as_deref(), Some("intranet.example.org"));
    }

    #[test]
    fn raw_bytes_fall_back_to_the_domain_regex() {
        let payload = b"\x00\x01 some noise mentioning files.backup-host.net here";
        assert_eq!(detect_host(payload).as_deref(), Some("files.backup-host.net"));
    }

    #[test]
    fn hostless_payload_yields_nothing() {
        assert_eq!(detect_host(b"\x00\x01\x02 nothing to see"), None);
        assert_eq!(extract_domain("localhost"), None);
    }

    #[test]
    fn broken_client_hello_falls_through_to_the_regex() {
        let mut payload = vec![0x16, 0x03, 0x01, 0x00, 0x02, 0xde, 0xad];
        payload.extend_from_slice(b" padding cdn.fallback.example more padding");
        assert_eq!(detect_host(&payload).as_deref(), Some("cdn.fallback.example"));
    }
}
