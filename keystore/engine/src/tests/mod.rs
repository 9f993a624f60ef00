mod coordinator_test;

use std::sync::Arc;

use crate::catalog::CatalogAdapter;
use crate::catalog::simulated::SimulatedCatalog;
use crate::coordinator::KeyCoordinator;
use crate::discover::StaticDiscovery;

pub(crate) const SERVICE: &str = "org.glite.Metadata";

/// `n` endpoint names: `catalog-0`, `catalog-1`, ...
pub(crate) fn endpoints(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("catalog-{i}")).collect()
}

/// Simulated fleet of `n` catalog endpoints and a coordinator pointed at it.
pub(crate) struct Fleet {
    pub endpoints: Vec<String>,
    pub discovery: Arc<StaticDiscovery>,
    pub catalog: Arc<SimulatedCatalog>,
}

impl Fleet {
    pub fn new(n: usize) -> Self {
        let endpoints = endpoints(n);
        let discovery = Arc::new(StaticDiscovery::with_endpoints(SERVICE, &endpoints).expect("discovery"));
        Fleet {
            endpoints,
            discovery,
            catalog: Arc::new(SimulatedCatalog::new()),
        }
    }

    pub fn adapter(&self) -> CatalogAdapter {
        CatalogAdapter::new(self.catalog.clone())
    }

    /// A fresh coordinator over the same discovery table and catalog.
    pub fn coordinator(&self) -> KeyCoordinator {
        KeyCoordinator::new(self.discovery.clone(), self.adapter()).with_service_type(SERVICE)
    }
}
