//! Public URLs for hosted paths.
//!
//! `scheme://address[:port]/{session_id}{virtual_path}`, with the port left
//! out when it is the scheme's default and every path segment
//! percent-encoded.

use url::{ParseError, Url};

pub fn scheme(secure: bool) -> &'static str {
    if secure {
        "https"
    } else {
        "http"
    }
}

/// `""` for the scheme's default port (80 plain, 443 secure), `":port"` otherwise.
pub fn port_suffix(port: u16, secure: bool) -> String {
    match (port, secure) {
        (80, false) | (443, true) => String::new(),
        _ => format!(":{}", port),
    }
}

/// Path under which the relay exposes `virtual_path` for a session.
pub fn hosted_path(session_id: &str, virtual_path: &str) -> String {
    format!("/{}{}", session_id, virtual_path)
}

/// Full URL for a hosted path.
pub fn hosted_url(
    address: &str,
    port: u16,
    secure: bool,
    session_id: &str,
    virtual_path: &str,
) -> Result<Url, ParseError> {
    let host = if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    };

    let mut url = Url::parse(&format!(
        "{}://{}{}/",
        scheme(secure),
        host,
        port_suffix(port, secure)
    ))?;

    url.path_segments_mut()
        .map_err(|_| ParseError::RelativeUrlWithCannotBeABaseBase)?
        .clear()
        .push(session_id)
        .extend(virtual_path.split('/').filter(|s| !s.is_empty()));

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_suffix() {
        assert_eq!(port_suffix(80, false), "");
        assert_eq!(port_suffix(443, true), "");
        assert_eq!(port_suffix(443, false), ":443");
        assert_eq!(port_suffix(80, true), ":80");
        assert_eq!(port_suffix(9001, false), ":9001");
    }

    #[test]
    fn test_hosted_url_default_port_omitted() {
        let url = hosted_url("bridge.example.org", 443, true, "k3x9-ab2c", "/genome.bam").unwrap();
        assert_eq!(url.as_str(), "https://bridge.example.org/k3x9-ab2c/genome.bam");
    }

    #[test]
    fn test_hosted_url_custom_port_and_encoding() {
        let url = hosted_url("127.0.0.1", 9001, false, "abcd-efgh", "/my reads/sample 1.fq").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9001/abcd-efgh/my%20reads/sample%201.fq"
        );
    }

    #[test]
    fn test_hosted_url_ipv6() {
        let url = hosted_url("::1", 8080, false, "s", "/a").unwrap();
        assert_eq!(url.as_str(), "http://[::1]:8080/s/a");
    }

    #[test]
    fn test_hosted_path() {
        assert_eq!(hosted_path("abcd-efgh", "/genome.bam"), "/abcd-efgh/genome.bam");
    }
}
