//! In-memory multi-endpoint catalog.
//!
//! Behaves like a fleet of catalog replicas: every endpoint has its own
//! entry table, entries are sealed at rest with AES-256-GCM under an
//! ephemeral key, and individual endpoints or operations can be made to fail.
//! Call counters let tests observe exactly which endpoints were contacted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::catalog::{Attribute, CatalogBinding, CatalogOp, CatalogReply, CatalogRequest, ServiceFault};
use crate::error::FaultKind;

/// Plaintext form of one catalog entry.
#[derive(Serialize, Deserialize, Default)]
struct StoredEntry {
    schema: String,
    attributes: BTreeMap<String, String>,
}

/// Entry encrypted at rest.
struct SealedBlob {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
}

pub struct SimulatedCatalog {
    endpoints: RwLock<HashMap<String, HashMap<String, SealedBlob>>>,
    faults: RwLock<HashSet<(String, Option<CatalogOp>)>>, // None = every operation
    rejected: RwLock<HashSet<(String, String)>>, // (endpoint, attribute name)
    calls: Mutex<HashMap<(String, CatalogOp), usize>>,
    cipher: Aes256Gcm,
}

impl SimulatedCatalog {
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));

        SimulatedCatalog {
            endpoints: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashSet::new()),
            rejected: RwLock::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            cipher,
        }
    }

    /// Make every operation against `endpoint` fail.
    pub fn fail_endpoint(&self, endpoint: &str) {
        self.faults.write().unwrap().insert((endpoint.to_string(), None));
    }

    /// Make one operation against `endpoint` fail.
    pub fn fail_operation(&self, endpoint: &str, op: CatalogOp) {
        self.faults.write().unwrap().insert((endpoint.to_string(), Some(op)));
    }

    /// Refuse any attribute write at `endpoint` that names `attribute`, as a
    /// catalog whose schema lacks it would.
    pub fn reject_attribute(&self, endpoint: &str, attribute: &str) {
        self.rejected
            .write()
            .unwrap()
            .insert((endpoint.to_string(), attribute.to_string()));
    }

    /// Clear every injected fault for `endpoint`.
    pub fn heal(&self, endpoint: &str) {
        self.faults.write().unwrap().retain(|(ep, _)| ep != endpoint);
        self.rejected.write().unwrap().retain(|(ep, _)| ep != endpoint);
    }

    pub fn call_count(&self, endpoint: &str, op: CatalogOp) -> usize {
        let calls = self.calls.lock().unwrap();
        calls.get(&(endpoint.to_string(), op)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self, endpoint: &str) -> usize {
        let calls = self.calls.lock().unwrap();
        calls
            .iter()
            .filter(|((ep, _), _)| ep == endpoint)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn reset_counters(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn contains(&self, endpoint: &str, item: &str) -> bool {
        let endpoints = self.endpoints.read().unwrap();
        endpoints.get(endpoint).is_some_and(|entries| entries.contains_key(item))
    }

    /// Number of entries an endpoint currently holds.
    pub fn entry_count(&self, endpoint: &str) -> usize {
        let endpoints = self.endpoints.read().unwrap();
        endpoints.get(endpoint).map_or(0, |entries| entries.len())
    }

    /// Read one attribute directly, bypassing fault injection and counters.
    pub fn peek_attribute(&self, endpoint: &str, item: &str, name: &str) -> Option<String> {
        let endpoints = self.endpoints.read().unwrap();
        let blob = endpoints.get(endpoint)?.get(item)?;
        let entry = self.unseal(blob).ok()?;
        entry.attributes.get(name).cloned()
    }

    /// Overwrite one attribute directly, as a misbehaving replica would.
    pub fn tamper_attribute(&self, endpoint: &str, item: &str, name: &str, value: &str) -> bool {
        let mut endpoints = self.endpoints.write().unwrap();
        let Some(blob) = endpoints.get_mut(endpoint).and_then(|entries| entries.get_mut(item)) else {
            return false;
        };
        let Ok(mut entry) = self.unseal(blob) else {
            return false;
        };
        entry.attributes.insert(name.to_string(), value.to_string());
        match self.seal(&entry) {
            Ok(sealed) => {
                *blob = sealed;
                true
            }
            Err(_) => false,
        }
    }

    fn record_call(&self, endpoint: &str, op: CatalogOp) {
        let mut calls = self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *calls.entry((endpoint.to_string(), op)).or_insert(0) += 1;
    }

    fn is_failing(&self, endpoint: &str, op: CatalogOp) -> bool {
        let faults = self.faults.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        faults.contains(&(endpoint.to_string(), None)) || faults.contains(&(endpoint.to_string(), Some(op)))
    }

    fn seal(&self, entry: &StoredEntry) -> Result<SealedBlob, ServiceFault> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(entry)
                .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("serialization failed: {e}")))?,
        );

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("sealing failed: {e:?}")))?;

        Ok(SealedBlob {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    fn unseal(&self, blob: &SealedBlob) -> Result<StoredEntry, ServiceFault> {
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_ref())
                .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("unsealing failed: {e:?}")))?,
        );
        serde_json::from_slice(&plaintext)
            .map_err(|e| ServiceFault::new(FaultKind::Internal, format!("deserialization failed: {e}")))
    }

    fn handle(&self, endpoint: &str, request: CatalogRequest) -> Result<CatalogReply, ServiceFault> {
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|_| ServiceFault::new(FaultKind::Internal, "catalog lock poisoned"))?;
        let entries = endpoints.entry(endpoint.to_string()).or_default();

        match request {
            CatalogRequest::CreateEntry { item, schema } => {
                if entries.contains_key(&item) {
                    return Err(ServiceFault::new(FaultKind::Exists, format!("entry {item} already exists")));
                }
                let sealed = self.seal(&StoredEntry {
                    schema,
                    attributes: BTreeMap::new(),
                })?;
                entries.insert(item, sealed);
                Ok(CatalogReply::Done)
            }
            CatalogRequest::SetAttributes { item, attributes } => {
                {
                    let rejected = self.rejected.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(attr) = attributes
                        .iter()
                        .find(|a| rejected.contains(&(endpoint.to_string(), a.name.clone())))
                    {
                        return Err(ServiceFault::new(
                            FaultKind::InvalidArgument,
                            format!("attribute {} is not defined for schema", attr.name),
                        ));
                    }
                }
                let blob = entries
                    .get_mut(&item)
                    .ok_or_else(|| ServiceFault::new(FaultKind::NotExists, format!("entry {item} does not exist")))?;
                let mut entry = self.unseal(blob)?;
                for attr in attributes {
                    match attr.value {
                        Some(value) => entry.attributes.insert(attr.name, value),
                        None => entry.attributes.remove(&attr.name),
                    };
                }
                *blob = self.seal(&entry)?;
                Ok(CatalogReply::Done)
            }
            CatalogRequest::GetAttributes { item, names } => {
                let blob = entries
                    .get(&item)
                    .ok_or_else(|| ServiceFault::new(FaultKind::NotExists, format!("entry {item} does not exist")))?;
                let entry = self.unseal(blob)?;
                let attributes = names
                    .into_iter()
                    .map(|name| {
                        let value = entry.attributes.get(&name).cloned();
                        Attribute { name, value }
                    })
                    .collect();
                Ok(CatalogReply::Attributes(attributes))
            }
            CatalogRequest::RemoveEntry { item } => {
                entries
                    .remove(&item)
                    .ok_or_else(|| ServiceFault::new(FaultKind::NotExists, format!("entry {item} does not exist")))?;
                Ok(CatalogReply::Done)
            }
        }
    }
}

impl Default for SimulatedCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogBinding for SimulatedCatalog {
    async fn invoke(&self, endpoint: &str, request: CatalogRequest) -> Result<CatalogReply, ServiceFault> {
        let op = request.op();
        self.record_call(endpoint, op);

        if self.is_failing(endpoint, op) {
            return Err(ServiceFault::new(
                FaultKind::Transport,
                format!("simulated outage at {endpoint}"),
            ));
        }

        self.handle(endpoint, request)
    }
}
