//! Catalog endpoint discovery.
//!
//! A service type resolves to a primary endpoint plus its associated
//! replicas. The coordinator asks again on every call; nothing is cached.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

use crate::error::{EdsError, Result};

/// What a discovery backend knows about one service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub primary: String,
    pub associated: Vec<String>,
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover(&self, service_type: &str) -> Result<DiscoveredService>;
}

/// Ordered endpoint list for one operation: primary first, then replicas in
/// the order the backend reported them, repeats dropped.
pub async fn discover_endpoints(discovery: &dyn ServiceDiscovery, service_type: &str) -> Result<Vec<String>> {
    let service = discovery
        .discover(service_type)
        .await
        .map_err(|e| match e {
            EdsError::Discovery(msg) => EdsError::Discovery(format!("{service_type}: {msg}")),
            other => EdsError::Discovery(format!("{service_type}: {other}")),
        })?;

    let mut endpoints = Vec::with_capacity(1 + service.associated.len());
    endpoints.push(service.primary);
    for endpoint in service.associated {
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}

/// Discovery table held in memory, filled from configuration.
///
/// Entries can be replaced at runtime, which is how a topology change
/// between registration and retrieval shows up.
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, DiscoveredService>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        StaticDiscovery {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Table with a single service whose first endpoint is the primary.
    pub fn with_endpoints(service_type: &str, endpoints: &[String]) -> Result<Self> {
        let discovery = Self::new();
        discovery.set_endpoints(service_type, endpoints)?;
        Ok(discovery)
    }

    pub fn set_service(&self, service_type: &str, service: DiscoveredService) -> Result<()> {
        let mut services = self
            .services
            .write()
            .map_err(|_| EdsError::Discovery("discovery table lock poisoned".into()))?;
        services.insert(service_type.to_string(), service);
        Ok(())
    }

    pub fn set_endpoints(&self, service_type: &str, endpoints: &[String]) -> Result<()> {
        let (primary, associated) = endpoints
            .split_first()
            .ok_or_else(|| EdsError::Discovery(format!("no endpoints configured for {service_type}")))?;
        self.set_service(
            service_type,
            DiscoveredService {
                primary: primary.clone(),
                associated: associated.to_vec(),
            },
        )
    }

    pub fn remove_service(&self, service_type: &str) -> Result<()> {
        let mut services = self
            .services
            .write()
            .map_err(|_| EdsError::Discovery("discovery table lock poisoned".into()))?;
        services.remove(service_type);
        Ok(())
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service_type: &str) -> Result<DiscoveredService> {
        let services = self
            .services
            .read()
            .map_err(|_| EdsError::Discovery("discovery table lock poisoned".into()))?;
        services
            .get(service_type)
            .cloned()
            .ok_or_else(|| EdsError::Discovery("service type not registered".into()))
    }
}

/// Resolves the service type as a DNS name (e.g. a headless service).
/// Addresses are sorted so every caller sees the same primary.
pub struct DnsDiscovery {
    resolver: TokioAsyncResolver,
    port: u16,
}

impl DnsDiscovery {
    pub fn new(port: u16) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        DnsDiscovery { resolver, port }
    }
}

#[async_trait]
impl ServiceDiscovery for DnsDiscovery {
    async fn discover(&self, service_type: &str) -> Result<DiscoveredService> {
        let response = self
            .resolver
            .lookup_ip(service_type)
            .await
            .map_err(|e| EdsError::Discovery(format!("DNS lookup failed: {e}")))?;

        let mut addrs: Vec<_> = response.iter().collect();
        addrs.sort();
        addrs.dedup();

        let mut nodes = addrs.into_iter().map(|ip| match ip {
            std::net::IpAddr::V4(v4) => format!("{v4}:{}", self.port),
            std::net::IpAddr::V6(v6) => format!("[{v6}]:{}", self.port),
        });

        let primary = nodes
            .next()
            .ok_or_else(|| EdsError::Discovery("DNS lookup returned no addresses".into()))?;
        Ok(DiscoveredService {
            primary,
            associated: nodes.collect(),
        })
    }
}
