//! Bootstrap datacenter table and DNS-fallback config parsing (§6).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use crate::datacenter::DcAddress;

/// Production bootstrap datacenter list (§6). IPv6 endpoints share
/// port 443 with their IPv4 counterparts.
pub fn production_datacenters() -> Vec<DcAddress> {
    vec![
        dc(1, 149, 154, 175, 50),
        dc(2, 149, 154, 167, 51),
        dc(3, 149, 154, 175, 100),
        dc(4, 149, 154, 167, 91),
        dc(5, 149, 154, 171, 5),
    ]
}

/// Test-backend bootstrap list — distinct addresses per §6
/// "A separate test set is defined for test-backend mode."
pub fn test_datacenters() -> Vec<DcAddress> {
    vec![
        dc(1, 149, 154, 175, 10),
        dc(2, 149, 154, 167, 40),
        dc(3, 149, 154, 175, 117),
    ]
}

fn dc(id: i32, a: u8, b: u8, c: u8, d: u8) -> DcAddress {
    DcAddress {
        dc_id: id,
        ipv4: SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), 443),
        ipv6: Some(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 443, 0, 0)),
        is_cdn: false,
    }
}

/// One record recovered from the opaque DNS-fallback blob (§6
/// "DNS-fallback input").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsFallbackRecord {
    pub dc_id: i32,
    pub ip: String,
    pub port: u16,
    pub secret: Option<Vec<u8>>,
    pub phone_prefix_rules: String,
}

/// Evaluate a comma-separated list of phone-prefix rules against
/// `phone` (§6, §8 round-trip law):
///
/// - `""` matches any phone.
/// - `"+NNN"` requires `phone.starts_with("NNN")`.
/// - `"-NNN"` negates: rejects phones starting with `NNN`.
/// - Rules apply left-to-right, with `-` taking precedence meaning a
///   later `-` rule can veto an earlier `+` match.
pub fn phone_matches_rules(rules: &str, phone: &str) -> bool {
    let mut matched = false;
    for rule in rules.split(',') {
        let rule = rule.trim();
        if rule.is_empty() {
            matched = true;
        } else if let Some(prefix) = rule.strip_prefix('+') {
            if phone.starts_with(prefix) {
                matched = true;
            }
        } else if let Some(prefix) = rule.strip_prefix('-') {
            if phone.starts_with(prefix) {
                return false;
            }
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rule_matches_any_phone() {
        assert!(phone_matches_rules("", "15551234567"));
    }

    #[test]
    fn plus_rule_requires_prefix() {
        assert!(phone_matches_rules("+123", "1234567"));
        assert!(!phone_matches_rules("+123", "4567890"));
    }

    #[test]
    fn minus_rule_rejects_prefix_even_after_match() {
        assert!(!phone_matches_rules("+123,-123", "1234567"));
    }

    #[test]
    fn production_table_has_five_dcs() {
        let dcs = production_datacenters();
        assert_eq!(dcs.len(), 5);
        assert_eq!(dcs[0].dc_id, 1);
        assert_eq!(dcs[0].ipv4.port(), 443);
    }
}
