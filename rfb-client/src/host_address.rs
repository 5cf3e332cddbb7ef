//! Parses a user-entered host string into a host component and an optional port,
//! handling the handful of address shapes a VNC "Connection..." dialog has to live with:
//! bracketed IPv6, IPv4-mapped IPv6, and plain `host:port`.

/// Result of parsing a raw address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: Option<u16>,
}

impl HostAddress {
    /// Parses `input`, in priority order: bracketed IPv6 (with or without a trailing
    /// port), IPv4-mapped IPv6 (`::ffff:A.B.C.D`, with or without a trailing port),
    /// an irregular bare `ipv6:port`, then plain `host:port`. A string that matches
    /// none of these is returned verbatim as the host with no port.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let input = input.trim();

        if let Some(after_bracket) = input.strip_prefix('[') {
            if let Some(end) = after_bracket.find(']') {
                let host = after_bracket[..end].to_string();
                let port = after_bracket[end + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok());
                return Self { host, port };
            }
        }

        let lower = input.to_ascii_lowercase();
        if let Some(idx) = lower.find("::ffff:") {
            let remainder = &input[idx + "::ffff:".len()..];
            if let Some((addr, port_str)) = remainder.rsplit_once(':') {
                if is_ipv4(addr) {
                    if let Ok(port) = port_str.parse::<u16>() {
                        return Self {
                            host: addr.to_string(),
                            port: Some(port),
                        };
                    }
                }
            }
            if is_ipv4(remainder) {
                return Self {
                    host: remainder.to_string(),
                    port: None,
                };
            }
            return Self {
                host: input.to_string(),
                port: None,
            };
        }

        let colon_count = input.matches(':').count();
        if colon_count >= 2 {
            // Bare (unbracketed) IPv6, possibly with an irregular trailing ":port".
            // A hex group is at most 4 digits, so only a >=5-digit trailing number can
            // be unambiguously a port rather than the address's own last segment.
            if let Some((addr, port_str)) = input.rsplit_once(':') {
                if addr.matches(':').count() >= 1 && port_str.len() >= 5 {
                    if let Ok(port) = port_str.parse::<u16>() {
                        return Self {
                            host: addr.to_string(),
                            port: Some(port),
                        };
                    }
                }
            }
            return Self {
                host: input.to_string(),
                port: None,
            };
        }

        if colon_count == 1 {
            let (host, port_str) = input.split_once(':').expect("colon_count == 1");
            if let Ok(port) = port_str.parse::<u16>() {
                return Self {
                    host: host.to_string(),
                    port: Some(port),
                };
            }
            return Self {
                host: input.to_string(),
                port: None,
            };
        }

        Self {
            host: input.to_string(),
            port: None,
        }
    }
}

fn is_ipv4(s: &str) -> bool {
    let mut octets = s.split('.');
    let valid = (&mut octets).take(4).all(|o| !o.is_empty() && o.parse::<u8>().is_ok());
    valid && octets.next().is_none() && s.split('.').count() == 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_ipv6_with_port() {
        let addr = HostAddress::parse("[2001:db8::1]:5901");
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, Some(5901));
    }

    #[test]
    fn bracketed_ipv6_without_port() {
        let addr = HostAddress::parse("[2001:db8::1]");
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn ipv4_mapped_ipv6_with_trailing_port() {
        let addr = HostAddress::parse("::ffff:10.0.0.5:5900");
        assert_eq!(addr.host, "10.0.0.5");
        assert_eq!(addr.port, Some(5900));
    }

    #[test]
    fn ipv4_mapped_ipv6_without_port() {
        let addr = HostAddress::parse("::ffff:10.0.0.5");
        assert_eq!(addr.host, "10.0.0.5");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn plain_hostname_unchanged() {
        let addr = HostAddress::parse("example.local");
        assert_eq!(addr.host, "example.local");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn host_and_port() {
        let addr = HostAddress::parse("vnc.example.com:5901");
        assert_eq!(addr.host, "vnc.example.com");
        assert_eq!(addr.port, Some(5901));
    }

    #[test]
    fn bare_ipv6_no_port() {
        let addr = HostAddress::parse("2001:db8::1");
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, None);
    }

    #[test]
    fn irregular_bare_ipv6_with_trailing_port() {
        // Five digits disambiguates a port from a (max 4-digit) hex group.
        let addr = HostAddress::parse("2001:db8::1:59012");
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, Some(59012));
    }

    #[test]
    fn bare_ipv6_with_four_digit_trailing_group_is_not_mistaken_for_a_port() {
        let addr = HostAddress::parse("2001:db8::1234");
        assert_eq!(addr.host, "2001:db8::1234");
        assert_eq!(addr.port, None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn bracketed_ipv6_always_recovers_port(
            segs in proptest::collection::vec("[0-9a-f]{1,4}", 2..6),
            port in 1u16..=65535,
        ) {
            let host = segs.join(":");
            let input = format!("[{host}]:{port}");
            let parsed = HostAddress::parse(&input);
            prop_assert_eq!(parsed.host, host);
            prop_assert_eq!(parsed.port, Some(port));
        }

        #[test]
        fn ipv4_mapped_always_recovers_dotted_quad(
            a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255,
            port in 1u16..=65535,
        ) {
            let input = format!("::ffff:{a}.{b}.{c}.{d}:{port}");
            let parsed = HostAddress::parse(&input);
            prop_assert_eq!(parsed.host, format!("{a}.{b}.{c}.{d}"));
            prop_assert_eq!(parsed.port, Some(port));
        }
    }
}
