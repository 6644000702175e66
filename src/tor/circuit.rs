//! Circuit listing
//!
//! Parses `GETINFO circuit-status` output and the router status entries
//! returned by `GETINFO ns/id/<fingerprint>`.

use std::net::IpAddr;

/// One relay on a circuit path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitNode {
    /// Hex identity fingerprint without the leading `$`
    pub fingerprint: String,
    pub nickname: Option<String>,
    /// Filled in from the relay's router status entry, when known
    pub ip: Option<IpAddr>,
}

/// A circuit as reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: String,
    /// LAUNCHED, BUILT, EXTENDED, FAILED or CLOSED
    pub status: String,
    pub purpose: Option<String>,
    pub build_flags: Vec<String>,
    pub nodes: Vec<CircuitNode>,
}

impl Circuit {
    pub fn is_built(&self) -> bool {
        self.status == "BUILT"
    }

    /// Parse one line of `circuit-status`
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let id = words.next()?.to_string();
        let status = words.next()?.to_string();

        let mut nodes = Vec::new();
        let mut purpose = None;
        let mut build_flags = Vec::new();

        for word in words {
            if let Some(value) = word.strip_prefix("PURPOSE=") {
                purpose = Some(value.to_string());
            } else if let Some(value) = word.strip_prefix("BUILD_FLAGS=") {
                build_flags = value.split(',').map(|s| s.to_string()).collect();
            } else if word.starts_with('$') && nodes.is_empty() {
                nodes = word.split(',').filter_map(parse_path_entry).collect();
            }
        }

        Some(Self {
            id,
            status,
            purpose,
            build_flags,
            nodes,
        })
    }
}

/// Parse the whole `circuit-status` value, one circuit per line
pub fn parse_circuit_status(value: &str) -> Vec<Circuit> {
    value
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(Circuit::parse_line)
        .collect()
}

/// `$FINGERPRINT~nickname`, `$FINGERPRINT=nickname` or `$FINGERPRINT`
fn parse_path_entry(entry: &str) -> Option<CircuitNode> {
    let entry = entry.strip_prefix('$')?;
    let (fingerprint, nickname) = match entry.find(['~', '=']) {
        Some(idx) => (&entry[..idx], Some(entry[idx + 1..].to_string())),
        None => (entry, None),
    };
    if fingerprint.is_empty() {
        return None;
    }
    Some(CircuitNode {
        fingerprint: fingerprint.to_string(),
        nickname,
        ip: None,
    })
}

/// Address of a relay from its router status entry.
///
/// Uses the IPv4 address on the `r` line, falling back to the first `a`
/// line (`a [2001:db8::1]:9001`).
pub fn parse_router_status_ip(entry: &str) -> Option<IpAddr> {
    let mut fallback = None;
    for line in entry.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("r") => {
                // r nickname identity digest date time IP ORPort DirPort
                if let Some(ip) = words.nth(5).and_then(|w| w.parse().ok()) {
                    return Some(ip);
                }
            },
            Some("a") if fallback.is_none() => {
                fallback = words.next().and_then(|addr| {
                    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
                });
            },
            _ => {},
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
1 BUILT $AAAA1111~alpha,$BBBB2222~beta,$CCCC3333=gamma BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-01-01T00:00:00.000000
2 LAUNCHED BUILD_FLAGS=NEED_CAPACITY,NEED_UPTIME PURPOSE=GENERAL
3 EXTENDED $DDDD4444 PURPOSE=HS_CLIENT_REND
";

    #[test]
    fn test_parse_circuit_status() {
        let circuits = parse_circuit_status(STATUS);
        assert_eq!(circuits.len(), 3);

        let first = &circuits[0];
        assert_eq!(first.id, "1");
        assert!(first.is_built());
        assert_eq!(first.purpose.as_deref(), Some("GENERAL"));
        assert_eq!(first.nodes.len(), 3);
        assert_eq!(first.nodes[0].fingerprint, "AAAA1111");
        assert_eq!(first.nodes[0].nickname.as_deref(), Some("alpha"));
        assert_eq!(first.nodes[2].nickname.as_deref(), Some("gamma"));

        assert!(circuits[1].nodes.is_empty());
        assert_eq!(circuits[1].build_flags, vec!["NEED_CAPACITY", "NEED_UPTIME"]);

        assert_eq!(circuits[2].nodes[0].nickname, None);
    }

    #[test]
    fn test_router_status_ipv4() {
        let entry = "r alpha AAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 198.51.100.7 9001 0\ns Fast Guard Running Stable Valid";
        assert_eq!(parse_router_status_ip(entry), "198.51.100.7".parse().ok());
    }

    #[test]
    fn test_router_status_ipv6_fallback() {
        let entry = "r alpha AAAA BBBB 2024-01-01 00:00:00 not-an-ip 9001 0\na [2001:db8::1]:9001";
        assert_eq!(parse_router_status_ip(entry), "2001:db8::1".parse().ok());
    }

    #[test]
    fn test_garbage_line_skipped() {
        assert!(Circuit::parse_line("").is_none());
        assert!(Circuit::parse_line("7").is_none());
    }
}
