// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secure HTTP client used to call SDK endpoints.
//!
//! Requests go through a cached, filtering DNS resolver so that user supplied
//! URLs cannot reach private networks, the container host or NAT64 gateways
//! unless explicitly allowed. Transport failures surface as [`ExecHttpError`].

mod dialer;
mod dns;
mod error;

pub use dialer::{DeniedAddress, DialPolicy, HOST_DOCKER_INTERNAL, SecureResolver};
pub use dns::{DNS_CACHE_TTL, DNS_REFRESH_INTERVAL, DnsCache, Lookup, SystemLookup};
pub use error::ExecHttpError;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, redirect};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::config::Config;
use error::classify;

/// Redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 60;

/// Longest a TCP connect plus TLS handshake may take.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long idle connections are kept.
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle connections kept per host.
pub const MAX_IDLE_CONNS: usize = 5;

/// A request to send, in a form that can be stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl SerializableRequest {
    /// A bodiless request.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers. Repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

/// Sends requests to SDK endpoints.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Send `req` and read the whole response.
    async fn do_request(&self, req: SerializableRequest) -> Result<HttpResponse, ExecHttpError>;
}

/// Options of a [`SecureClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Overall request timeout.
    pub max_function_timeout: Duration,
    /// Largest response body accepted.
    pub max_response_body_bytes: usize,
    /// Destination filtering.
    pub policy: DialPolicy,
    /// TTL of cached lookups.
    pub dns_ttl: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_function_timeout: Duration::from_secs(2 * 60 * 60),
            max_response_body_bytes: 4 * 1024 * 1024,
            policy: DialPolicy::default(),
            dns_ttl: DNS_CACHE_TTL,
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_function_timeout: config.max_function_timeout,
            max_response_body_bytes: config.max_response_body_bytes,
            policy: DialPolicy {
                allow_private_networks: config.allow_private_networks,
                allow_host_docker: config.allow_host_docker,
                allow_nat64: config.allow_nat64,
            },
            dns_ttl: DNS_CACHE_TTL,
        }
    }
}

/// [`RequestExecutor`] backed by reqwest with a filtering resolver.
#[derive(Debug, Clone)]
pub struct SecureClient {
    client: reqwest::Client,
    cache: Arc<DnsCache>,
    policy: DialPolicy,
    max_body: usize,
}

impl SecureClient {
    /// Client resolving through the operating system.
    pub fn new(opts: ClientOptions) -> Result<Self, ExecHttpError> {
        Self::with_lookup(opts, Arc::new(SystemLookup))
    }

    /// Client resolving through `lookup`.
    pub fn with_lookup(opts: ClientOptions, lookup: Arc<dyn Lookup>) -> Result<Self, ExecHttpError> {
        let cache = Arc::new(DnsCache::with_ttl(lookup, opts.dns_ttl));
        let resolver = Arc::new(SecureResolver::new(cache.clone(), opts.policy));

        let client = reqwest::Client::builder()
            .dns_resolver(resolver)
            .redirect(redirect_policy(opts.policy))
            .connect_timeout(TLS_HANDSHAKE_TIMEOUT)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .timeout(opts.max_function_timeout)
            .build()
            .map_err(|e| ExecHttpError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            cache,
            policy: opts.policy,
            max_body: opts.max_response_body_bytes,
        })
    }

    /// The DNS cache, for scheduling refreshes.
    pub fn dns_cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    fn check_url(&self, url: &Url) -> Result<(), ExecHttpError> {
        match url.host() {
            Some(_) => check_destination(&self.policy, url)
                .map_err(|d| ExecHttpError::Denied(d.reason().to_string())),
            None => Err(ExecHttpError::UnableToReach),
        }
    }

    fn build_headers(req: &SerializableRequest) -> Result<HeaderMap, ExecHttpError> {
        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for (name, value) in &req.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExecHttpError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExecHttpError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

/// Literal IP hosts never reach the resolver, so every URL dialed, including
/// each redirect target, is checked here first.
fn check_destination(policy: &DialPolicy, url: &Url) -> Result<(), DeniedAddress> {
    match url.host() {
        Some(Host::Ipv4(v4)) => policy.check_ip(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => policy.check_ip(IpAddr::V6(v6)),
        Some(Host::Domain(domain)) => policy.check_host(domain).map(|_| ()),
        None => Err(DeniedAddress::new("redirect without a host")),
    }
}

/// Follows up to [`MAX_REDIRECTS`] hops, refusing any hop the policy denies.
fn redirect_policy(policy: DialPolicy) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match check_destination(&policy, attempt.url()) {
            Ok(()) => attempt.follow(),
            Err(denied) => attempt.error(denied),
        }
    })
}

#[async_trait]
impl RequestExecutor for SecureClient {
    async fn do_request(&self, req: SerializableRequest) -> Result<HttpResponse, ExecHttpError> {
        let url = Url::parse(&req.url).map_err(|_| ExecHttpError::UnableToReach)?;
        self.check_url(&url)?;
        let https = url.scheme() == "https";

        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| ExecHttpError::InvalidRequest(e.to_string()))?;
        let headers = Self::build_headers(&req)?;

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let mut resp = builder.send().await.map_err(|e| classify(&e, https))?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|v: &mut String| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert_with(|| value.clone());
        }

        if let Some(len) = resp.content_length()
            && len as usize > self.max_body
        {
            return Err(ExecHttpError::BodyTooLarge {
                limit: self.max_body,
            });
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| classify(&e, https))? {
            if body.len() + chunk.len() > self.max_body {
                return Err(ExecHttpError::BodyTooLarge {
                    limit: self.max_body,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}
