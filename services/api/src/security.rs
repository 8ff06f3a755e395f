use axum::{extract::ConnectInfo, http::HeaderMap};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time secret comparison. Both sides are hashed first so the
/// comparison length never depends on either input.
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.ct_eq(&b).into()
}

/// Client IP for rate limiting: proxy headers first, then the socket.
pub fn extract_client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<std::net::SocketAddr>>,
) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(ip) = forwarded_for.split(',').next() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    if let Some(conn_info) = connect_info {
        return conn_info.0.ip().to_string();
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "other"));
        assert!(!constant_time_eq("", "other"));
        // An unset expected key can never be matched.
        assert!(!constant_time_eq("", ""));
    }

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 10.0.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, None), "9.9.9.9");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "8.8.8.8".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, None), "8.8.8.8");

        assert_eq!(extract_client_ip(&HeaderMap::new(), None), "unknown");
    }
}
