//! Client identity, IP access lists and credential checks.

use crate::config::AccessConfig;
use crate::error::{ConfigError, SecurityError, SecurityResult};
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use subtle::{Choice, ConstantTimeEq};
use tracing::warn;

const UNKNOWN: &str = "unknown";

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// The identity admission and access decisions are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    key: String,
    ip: Option<IpAddr>,
}

impl ClientIdentity {
    /// Resolve the client address.
    ///
    /// Proxy headers are only believed when the socket peer matches one of
    /// `trusted_proxies`. Then the first `x-forwarded-for` hop wins over
    /// `x-real-ip`, which wins over the peer. Values that are not IP
    /// addresses are skipped.
    pub fn resolve(
        headers: &HashMap<String, String>,
        peer: Option<SocketAddr>,
        trusted_proxies: &[AccessRule],
    ) -> Self {
        let Some(peer) = peer.map(|addr| Self::from_ip(addr.ip())) else {
            return Self::unknown();
        };
        if !trusted_proxies.iter().any(|rule| rule.matches(&peer)) {
            return peer;
        }

        let forwarded = header(headers, "x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(parse_ip);
        forwarded
            .or_else(|| header(headers, "x-real-ip").and_then(parse_ip))
            .map(Self::from_ip)
            .unwrap_or(peer)
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        let ip = normalize(ip);
        Self {
            key: ip.to_string(),
            ip: Some(ip),
        }
    }

    pub fn unknown() -> Self {
        Self {
            key: UNKNOWN.to_string(),
            ip: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// One allow or block rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRule {
    Any,
    Exact(IpAddr),
    Network(IpNet),
    /// IPv4 octets where `None` matches anything. Trailing octets not
    /// written in the rule are wildcards.
    Wildcard([Option<u8>; 4]),
}

impl AccessRule {
    pub fn parse(rule: &str) -> Result<Self, ConfigError> {
        let rule = rule.trim();
        if rule == "*" {
            return Ok(Self::Any);
        }
        if rule.contains('*') {
            return parse_wildcard(rule);
        }
        if rule.contains('/') {
            return rule
                .parse::<IpNet>()
                .map(|net| Self::Network(net.trunc()))
                .map_err(|e| ConfigError::InvalidAccessRule(format!("{rule}: {e}")));
        }
        rule.parse::<IpAddr>()
            .map(|ip| Self::Exact(normalize(ip)))
            .map_err(|e| ConfigError::InvalidAccessRule(format!("{rule}: {e}")))
    }

    pub fn matches(&self, identity: &ClientIdentity) -> bool {
        let ip = match (self, identity.ip()) {
            (Self::Any, _) => return true,
            (_, None) => return false,
            (_, Some(ip)) => ip,
        };
        match self {
            Self::Any => true,
            Self::Exact(exact) => *exact == ip,
            Self::Network(net) => net.contains(&ip),
            Self::Wildcard(pattern) => match ip {
                IpAddr::V4(v4) => pattern
                    .iter()
                    .zip(v4.octets())
                    .all(|(want, got)| want.is_none_or(|w| w == got)),
                IpAddr::V6(_) => false,
            },
        }
    }
}

fn parse_wildcard(rule: &str) -> Result<AccessRule, ConfigError> {
    let invalid = || ConfigError::InvalidAccessRule(format!("{rule}: invalid wildcard pattern"));
    let parts: Vec<&str> = rule.split('.').collect();
    if parts.len() > 4 {
        return Err(invalid());
    }
    if parts.len() < 4 && parts.last() != Some(&"*") {
        return Err(invalid());
    }

    let mut pattern = [None; 4];
    for (slot, part) in pattern.iter_mut().zip(&parts) {
        *slot = match *part {
            "*" => None,
            octet => Some(octet.parse::<u8>().map_err(|_| invalid())?),
        };
    }
    Ok(AccessRule::Wildcard(pattern))
}

/// Block list plus optional allow list. The block list always wins.
#[derive(Debug, Clone, Default)]
pub struct IpAccessList {
    allow: Vec<AccessRule>,
    block: Vec<AccessRule>,
}

impl IpAccessList {
    pub fn new<S: AsRef<str>>(allow: &[S], block: &[S]) -> Result<Self, ConfigError> {
        let parse = |rules: &[S]| {
            rules
                .iter()
                .map(|rule| AccessRule::parse(rule.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: parse(allow)?,
            block: parse(block)?,
        })
    }

    pub fn check(&self, identity: &ClientIdentity) -> SecurityResult<()> {
        if self.block.iter().any(|rule| rule.matches(identity)) {
            return Err(SecurityError::IpBlocked);
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|rule| rule.matches(identity)) {
            return Err(SecurityError::IpNotAllowed);
        }
        Ok(())
    }
}

/// Constant-time API key check.
#[derive(Clone, Default)]
pub struct CredentialVerifier {
    keys: Vec<Vec<u8>>,
    header: String,
}

impl fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("keys", &self.keys.len())
            .field("header", &self.header)
            .finish()
    }
}

impl CredentialVerifier {
    pub fn new<S: AsRef<str>>(keys: &[S], header: impl Into<String>) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|key| key.as_ref().trim())
                .filter(|key| !key.is_empty())
                .map(|key| key.as_bytes().to_vec())
                .collect(),
            header: header.into(),
        }
    }

    /// No keys configured means no credential is required.
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn verify(&self, headers: &HashMap<String, String>) -> SecurityResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let presented = header(headers, &self.header)
            .or_else(|| header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SecurityError::MissingCredential)?;

        // Every key is compared so timing does not reveal which one matched.
        let matched = self
            .keys
            .iter()
            .fold(Choice::from(0), |acc, key| acc | key.as_slice().ct_eq(presented.as_bytes()));

        if bool::from(matched) {
            Ok(())
        } else {
            Err(SecurityError::InvalidCredential)
        }
    }
}

/// Address and credential gate applied before admission.
#[derive(Debug, Clone)]
pub struct AccessControl {
    ips: IpAccessList,
    credentials: CredentialVerifier,
    trusted_proxies: Vec<AccessRule>,
}

impl AccessControl {
    pub fn from_config(config: &AccessConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            ips: IpAccessList::new(&config.ip_allow_list, &config.ip_block_list)?,
            credentials: CredentialVerifier::new(&config.api_keys, config.credential_header.clone()),
            trusted_proxies: config
                .trusted_proxies
                .iter()
                .map(|rule| AccessRule::parse(rule))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn identify(
        &self,
        headers: &HashMap<String, String>,
        peer: Option<SocketAddr>,
    ) -> ClientIdentity {
        ClientIdentity::resolve(headers, peer, &self.trusted_proxies)
    }

    pub fn authorize(
        &self,
        identity: &ClientIdentity,
        headers: &HashMap<String, String>,
    ) -> SecurityResult<()> {
        if let Err(e) = self.ips.check(identity) {
            warn!(identity = %identity, code = e.code(), "Client address rejected");
            return Err(e);
        }
        if let Err(e) = self.credentials.verify(headers) {
            warn!(identity = %identity, code = e.code(), "Credential rejected");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn identity(ip: &str) -> ClientIdentity {
        ClientIdentity::from_ip(ip.parse().unwrap())
    }

    fn loopback_proxy() -> Vec<AccessRule> {
        vec![AccessRule::parse("127.0.0.1").unwrap()]
    }

    #[test]
    fn test_identity_precedence() {
        let proxy: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let trusted = loopback_proxy();
        let h = headers(&[
            ("X-Forwarded-For", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(ClientIdentity::resolve(&h, Some(proxy), &trusted).as_str(), "203.0.113.7");

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(ClientIdentity::resolve(&h, Some(proxy), &trusted).as_str(), "198.51.100.2");

        let h = headers(&[]);
        assert_eq!(ClientIdentity::resolve(&h, Some(proxy), &trusted).as_str(), "127.0.0.1");
        assert_eq!(ClientIdentity::resolve(&h, None, &trusted).as_str(), "unknown");
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let peer: SocketAddr = "192.0.2.9:5000".parse().unwrap();
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(ClientIdentity::resolve(&h, Some(peer), &loopback_proxy()).as_str(), "192.0.2.9");
        assert_eq!(ClientIdentity::resolve(&h, Some(peer), &[]).as_str(), "192.0.2.9");

        // Without a peer there is nobody to trust.
        assert_eq!(ClientIdentity::resolve(&h, None, &[AccessRule::Any]).as_str(), "unknown");
    }

    #[test]
    fn test_non_ip_forwarded_values_skipped() {
        let proxy: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let trusted = loopback_proxy();

        let h = headers(&[("x-forwarded-for", "not-an-ip"), ("x-real-ip", "198.51.100.2")]);
        let id = ClientIdentity::resolve(&h, Some(proxy), &trusted);
        assert_eq!(id.as_str(), "198.51.100.2");

        let h = headers(&[("x-forwarded-for", "garbage, 10.0.0.1"), ("x-real-ip", "nope")]);
        let id = ClientIdentity::resolve(&h, Some(proxy), &trusted);
        assert_eq!(id.as_str(), "127.0.0.1");
        assert!(id.ip().is_some());

        let h = headers(&[("x-forwarded-for", "203.0.113.7:4431")]);
        assert_eq!(ClientIdentity::resolve(&h, Some(proxy), &trusted).as_str(), "203.0.113.7");
    }

    #[test]
    fn test_rule_forms() {
        assert!(AccessRule::parse("*").unwrap().matches(&ClientIdentity::unknown()));
        assert!(AccessRule::parse("10.0.0.5").unwrap().matches(&identity("10.0.0.5")));
        assert!(!AccessRule::parse("10.0.0.5").unwrap().matches(&identity("10.0.0.6")));

        let cidr = AccessRule::parse("10.0.0.0/8").unwrap();
        assert!(cidr.matches(&identity("10.200.1.1")));
        assert!(!cidr.matches(&identity("11.0.0.1")));

        let v6 = AccessRule::parse("2001:db8::/32").unwrap();
        assert!(v6.matches(&identity("2001:db8::1")));

        let wildcard = AccessRule::parse("192.168.*.*").unwrap();
        assert!(wildcard.matches(&identity("192.168.4.20")));
        assert!(!wildcard.matches(&identity("192.169.4.20")));

        let short = AccessRule::parse("10.*").unwrap();
        assert!(short.matches(&identity("10.9.8.7")));
        assert!(!short.matches(&identity("2001:db8::1")));
    }

    #[test]
    fn test_invalid_rules() {
        for rule in ["10.0.0.0/99", "300.*", "10.*.1", "not-an-ip", "1.2.3.4.*"] {
            assert!(
                matches!(AccessRule::parse(rule), Err(ConfigError::InvalidAccessRule(_))),
                "{rule} should be rejected"
            );
        }
    }

    #[test]
    fn test_block_list_wins() {
        let list = IpAccessList::new(&["10.0.0.0/8"], &["10.0.0.66"]).unwrap();
        assert!(list.check(&identity("10.1.1.1")).is_ok());
        assert!(matches!(
            list.check(&identity("10.0.0.66")),
            Err(SecurityError::IpBlocked)
        ));
        assert!(matches!(
            list.check(&identity("172.16.0.1")),
            Err(SecurityError::IpNotAllowed)
        ));
    }

    #[test]
    fn test_empty_allow_list_admits_everyone() {
        let list = IpAccessList::new::<&str>(&[], &[]).unwrap();
        assert!(list.check(&identity("8.8.8.8")).is_ok());
        assert!(list.check(&ClientIdentity::unknown()).is_ok());
    }

    #[test]
    fn test_credentials() {
        let verifier = CredentialVerifier::new(&["alpha", "beta"], "x-api-key");

        assert!(verifier.verify(&headers(&[("X-Api-Key", "beta")])).is_ok());
        assert!(verifier
            .verify(&headers(&[("Authorization", "Bearer alpha")]))
            .is_ok());
        assert!(matches!(
            verifier.verify(&headers(&[("x-api-key", "gamma")])),
            Err(SecurityError::InvalidCredential)
        ));
        assert!(matches!(
            verifier.verify(&headers(&[("x-api-key", "alph")])),
            Err(SecurityError::InvalidCredential)
        ));
        assert!(matches!(
            verifier.verify(&headers(&[])),
            Err(SecurityError::MissingCredential)
        ));
    }

    #[test]
    fn test_credentials_disabled_without_keys() {
        let verifier = CredentialVerifier::new::<&str>(&[], "x-api-key");
        assert!(!verifier.is_enabled());
        assert!(verifier.verify(&headers(&[])).is_ok());
    }

    #[test]
    fn test_access_control_from_config() {
        let config = AccessConfig {
            ip_block_list: vec!["203.0.113.0/24".into()],
            api_keys: vec!["secret".into()],
            ..Default::default()
        };
        let access = AccessControl::from_config(&config).unwrap();
        let proxy: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let h = headers(&[("x-forwarded-for", "203.0.113.5"), ("x-api-key", "secret")]);
        let id = access.identify(&h, Some(proxy));
        assert!(matches!(access.authorize(&id, &h), Err(SecurityError::IpBlocked)));

        let h = headers(&[("x-forwarded-for", "198.51.100.1"), ("x-api-key", "secret")]);
        let id = access.identify(&h, Some(proxy));
        assert!(access.authorize(&id, &h).is_ok());
    }

    #[test]
    fn test_blocked_peer_cannot_escape_with_headers() {
        let config = AccessConfig {
            ip_block_list: vec!["203.0.113.0/24".into()],
            ..Default::default()
        };
        let access = AccessControl::from_config(&config).unwrap();
        let peer: SocketAddr = "203.0.113.5:40000".parse().unwrap();

        for forwarded in ["not-an-ip", "198.51.100.1", ""] {
            let h = headers(&[("x-forwarded-for", forwarded)]);
            let id = access.identify(&h, Some(peer));
            assert_eq!(id.as_str(), "203.0.113.5");
            assert!(matches!(access.authorize(&id, &h), Err(SecurityError::IpBlocked)));
        }
    }

    #[test]
    fn test_invalid_trusted_proxy_rejected() {
        let config = AccessConfig {
            trusted_proxies: vec!["10.0.0.0/33".into()],
            ..Default::default()
        };
        assert!(AccessControl::from_config(&config).is_err());
    }
}
