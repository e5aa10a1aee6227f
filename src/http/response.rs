//! Status lines written by the proxy itself.
//!
//! Everything else the client receives comes from the origin untouched.

/// Tunnel established. No headers follow the status line.
pub fn connection_established(version: &str) -> String {
    format!("{version} 200 Connection established\r\n\r\n")
}

/// Origin unreachable on the plain HTTP path.
pub fn bad_gateway(version: &str) -> String {
    format!("{version} 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn established_line_echoes_version() {
        assert_eq!(
            connection_established("HTTP/1.1"),
            "HTTP/1.1 200 Connection established\r\n\r\n"
        );
        assert_eq!(
            connection_established("HTTP/1.0"),
            "HTTP/1.0 200 Connection established\r\n\r\n"
        );
    }

    #[test]
    fn bad_gateway_is_a_complete_empty_response() {
        let response = bad_gateway("HTTP/1.1");
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert!(response.contains("Content-Length: 0"));
    }
}
