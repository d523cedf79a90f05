use std::net::IpAddr;

const SCHEMES: [&str; 4] = ["ws://", "wss://", "http://", "https://"];

/// First whitespace-separated token in `line` that looks like an endpoint URI.
pub fn extract_endpoint(line: &str) -> Option<&str> {
    line.split_whitespace()
        .map(|token| token.trim_matches(|c: char| c == '"' || c == '\'' || c == ','))
        .find(|token| {
            SCHEMES
                .iter()
                .any(|scheme| token.starts_with(scheme) && token.len() > scheme.len())
        })
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| ip.is_loopback() || ip.is_unspecified())
        .unwrap_or(false)
}

/// Replace a loopback (or wildcard) host in `endpoint` with `hostname`.
///
/// Non-local hosts and strings that are not `scheme://authority` URIs are
/// returned unchanged. Port, path and query are preserved.
pub fn rewrite_loopback_host(endpoint: &str, hostname: &str) -> String {
    let Some(scheme_end) = endpoint.find("://") else {
        return endpoint.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &endpoint[authority_start..];
    let authority_len = rest
        .find(|c: char| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let authority = &rest[..authority_len];

    let (userinfo, host_port) = match authority.rfind('@') {
        Some(at) => (&authority[..=at], &authority[at + 1..]),
        None => ("", authority),
    };

    let (host, port) = if host_port.starts_with('[') {
        match host_port.find(']') {
            Some(close) => (&host_port[..=close], &host_port[close + 1..]),
            None => return endpoint.to_string(),
        }
    } else {
        match host_port.rfind(':') {
            Some(colon) => (&host_port[..colon], &host_port[colon..]),
            None => (host_port, ""),
        }
    };

    if !is_local_host(host) {
        return endpoint.to_string();
    }

    format!(
        "{}{}{}{}{}",
        &endpoint[..authority_start],
        userinfo,
        hostname,
        port,
        &rest[authority_len..]
    )
}
