use std::net::IpAddr;

/// Errors that can occur when parsing a peer address string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address `{0}` must look like host:port")]
    MissingPort(String),
    #[error("address `{0}` has an empty host")]
    EmptyHost(String),
    #[error("address `{0}` has an invalid port")]
    InvalidPort(String),
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_address(address: &str) -> Result<(String, u16), AddressError> {
    let address = address.trim();
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        (&rest[..end], port)
    } else {
        address
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?
    };

    if host.is_empty() {
        return Err(AddressError::EmptyHost(address.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))?;
    Ok((host.to_string(), port))
}

/// Build a peer address, bracketing IPv6 hosts.
pub fn create_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

pub fn is_valid_address(address: &str) -> bool {
    split_address(address).is_ok()
}

pub fn is_valid_ip(value: &str) -> bool {
    value.trim().parse::<IpAddr>().is_ok()
}

/// Collapse IPv4-mapped IPv6 addresses to plain IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

pub fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse::<IpAddr>().ok().map(normalize_ip)
}

/// Compare two textual IPs, treating `::ffff:a.b.c.d` and `a.b.c.d` as equal.
pub fn ips_equal(left: &str, right: &str) -> bool {
    match (parse_ip(left), parse_ip(right)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// The literal IP of an address host, if the host is an IP.
pub fn address_ip(address: &str) -> Option<IpAddr> {
    let (host, _) = split_address(address).ok()?;
    if host.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::from([127, 0, 0, 1]));
    }
    parse_ip(&host)
}
