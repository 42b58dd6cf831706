// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Destination filtering for outgoing connections.
//!
//! Every hostname is resolved through the [`DnsCache`] and every resolved
//! address is checked against the [`DialPolicy`] before a connection is made.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use super::dns::DnsCache;

/// Hostname containers use to reach their host.
pub const HOST_DOCKER_INTERNAL: &str = "host.docker.internal";

/// A destination refused by the [`DialPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeniedAddress {
    reason: String,
}

impl DeniedAddress {
    /// A denial with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why the destination was refused.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for DeniedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for DeniedAddress {}

/// Which otherwise refused destinations may be dialed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialPolicy {
    /// Loopback, private, link-local, unique-local, multicast and unspecified
    /// addresses.
    pub allow_private_networks: bool,
    /// [`HOST_DOCKER_INTERNAL`].
    pub allow_host_docker: bool,
    /// The NAT64 prefixes `64:ff9b::/96` and `64:ff9b:1::/48`.
    pub allow_nat64: bool,
}

impl DialPolicy {
    /// Policy allowing everything. For tests against local servers.
    pub fn permissive() -> Self {
        Self {
            allow_private_networks: true,
            allow_host_docker: true,
            allow_nat64: true,
        }
    }

    /// Check a hostname before resolving it. Returns whether its addresses
    /// must still be checked.
    pub fn check_host(&self, host: &str) -> Result<bool, DeniedAddress> {
        if host.trim_end_matches('.').eq_ignore_ascii_case(HOST_DOCKER_INTERNAL) {
            if !self.allow_host_docker {
                return Err(DeniedAddress::new("accessing docker host is not allowed"));
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Check a resolved or literal address.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), DeniedAddress> {
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };

        match ip {
            IpAddr::V4(v4) => {
                if !self.allow_private_networks && is_private_v4(v4) {
                    return Err(DeniedAddress::new(format!(
                        "private address {} is not allowed",
                        v4
                    )));
                }
            }
            IpAddr::V6(v6) => {
                if is_nat64(v6) {
                    if !self.allow_nat64 {
                        return Err(DeniedAddress::new(format!(
                            "NAT64 address {} is not allowed",
                            v6
                        )));
                    }
                    return Ok(());
                }
                if !self.allow_private_networks && is_private_v6(v6) {
                    return Err(DeniedAddress::new(format!(
                        "private address {} is not allowed",
                        v6
                    )));
                }
            }
        }
        Ok(())
    }

    /// Addresses of `host` that may be dialed. Fails when none may.
    pub fn filter(&self, host: &str, addrs: &[IpAddr]) -> Result<Vec<IpAddr>, DeniedAddress> {
        let mut allowed = Vec::with_capacity(addrs.len());
        let mut last_denial = None;
        for ip in addrs {
            match self.check_ip(*ip) {
                Ok(()) => allowed.push(*ip),
                Err(denied) => last_denial = Some(denied),
            }
        }
        if allowed.is_empty() {
            return Err(last_denial
                .unwrap_or_else(|| DeniedAddress::new(format!("no addresses for {}", host))));
        }
        Ok(allowed)
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10, shared address space
        || (a == 100 && (b & 0xc0) == 64)
        // 0.0.0.0/8
        || a == 0
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
}

fn is_nat64(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    // 64:ff9b::/96
    let well_known = s[0] == 0x64 && s[1] == 0xff9b && s[2..6].iter().all(|x| *x == 0);
    // 64:ff9b:1::/48
    let local = s[0] == 0x64 && s[1] == 0xff9b && s[2] == 1;
    well_known || local
}

/// reqwest resolver that resolves through the cache and applies the policy.
#[derive(Debug, Clone)]
pub struct SecureResolver {
    cache: Arc<DnsCache>,
    policy: DialPolicy,
}

impl SecureResolver {
    /// Resolver over `cache` enforcing `policy`.
    pub fn new(cache: Arc<DnsCache>, policy: DialPolicy) -> Self {
        Self { cache, policy }
    }
}

impl Resolve for SecureResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.cache.clone();
        let policy = self.policy;
        let host = name.as_str().to_string();

        Box::pin(async move {
            let check_addrs = policy.check_host(&host)?;
            let addrs = cache.resolve(&host).await?;
            let addrs = if check_addrs {
                policy.filter(&host, &addrs)?
            } else {
                addrs.to_vec()
            };
            let addrs: Addrs = Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_denies_private_ranges_by_default() {
        let policy = DialPolicy::default();
        for addr in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "224.0.0.1",
            "0.0.0.0",
            "100.64.0.1",
            "::1",
            "::",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "ff02::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(policy.check_ip(ip(addr)).is_err(), "{} should be denied", addr);
        }
    }

    #[test]
    fn test_allows_public_addresses() {
        let policy = DialPolicy::default();
        for addr in ["93.184.216.34", "8.8.8.8", "2606:4700:4700::1111"] {
            assert!(policy.check_ip(ip(addr)).is_ok(), "{} should be allowed", addr);
        }
    }

    #[test]
    fn test_private_flag() {
        let policy = DialPolicy {
            allow_private_networks: true,
            ..Default::default()
        };
        assert!(policy.check_ip(ip("127.0.0.1")).is_ok());
        assert!(policy.check_ip(ip("fd00::1")).is_ok());
        assert!(policy.check_ip(ip("64:ff9b::7f00:1")).is_err());
    }

    #[test]
    fn test_nat64() {
        let denied = DialPolicy::default();
        let err = denied.check_ip(ip("64:ff9b::5db8:d822")).unwrap_err();
        assert!(err.reason().contains("NAT64"));
        assert!(denied.check_ip(ip("64:ff9b:1::1")).is_err());

        let allowed = DialPolicy {
            allow_nat64: true,
            ..Default::default()
        };
        assert!(allowed.check_ip(ip("64:ff9b::5db8:d822")).is_ok());
    }

    #[test]
    fn test_docker_host() {
        let err = DialPolicy::default()
            .check_host("host.docker.internal")
            .unwrap_err();
        assert!(err.reason().contains("accessing docker host"));
        assert!(
            DialPolicy::default()
                .check_host("HOST.DOCKER.INTERNAL.")
                .is_err()
        );

        let allowed = DialPolicy {
            allow_host_docker: true,
            ..Default::default()
        };
        assert_eq!(allowed.check_host("host.docker.internal"), Ok(false));
        assert_eq!(allowed.check_host("example.com"), Ok(true));
    }

    #[test]
    fn test_filter_keeps_allowed_addresses() {
        let policy = DialPolicy::default();
        let allowed = policy
            .filter("mixed.test", &[ip("10.0.0.1"), ip("93.184.216.34")])
            .unwrap();
        assert_eq!(allowed, vec![ip("93.184.216.34")]);

        assert!(policy.filter("private.test", &[ip("10.0.0.1")]).is_err());
    }
}
