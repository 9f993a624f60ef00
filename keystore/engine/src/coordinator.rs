//! Key distribution across catalog endpoints.
//!
//! Registration splits a fresh key into one share per discovered endpoint and
//! writes them in discovery order, undoing earlier writes if any one fails.
//! Retrieval walks the endpoints until enough mutually consistent shares are
//! in hand. Unregistration deletes everywhere it can.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::catalog::{
    ATTR_CIPHER, ATTR_GUID, ATTR_IV, ATTR_KEY, ATTR_KEY_INDEX, ATTR_KEYINFO, ATTR_KEYS_NEEDED, ATTR_SURL, Attribute,
    CatalogAdapter, SCHEMA, SHARE_ATTRIBUTES,
};
use crate::codec::{from_hex, to_hex};
use crate::config::EdsConfig;
use crate::crypto::{CipherKind, CipherSession, DEFAULT_CIPHER, Direction, KeyMaterial};
use crate::discover::{ServiceDiscovery, discover_endpoints};
use crate::error::{EdsError, FaultKind, Result};
use crate::replica::ReplicaId;
use crate::sharing::{self, HEADER_LEN, MAX_SHARES, ShareBytes};

/// Metadata every share of one key must agree on, kept exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ShareMeta {
    keys_needed: String,
    iv: String,
    key_info: String,
    cipher: String,
}

/// One share record as read back from an endpoint.
struct FetchedShare {
    index: usize,
    keys_needed: usize,
    share: ShareBytes,
    meta: ShareMeta,
}

/// A failed share write, and whether the entry had already been created.
struct WriteFailure {
    error: EdsError,
    created: bool,
}

pub struct KeyCoordinator {
    discovery: Arc<dyn ServiceDiscovery>,
    catalog: CatalogAdapter,
    service_type: String,
    default_cipher: String,
    audit: Option<Arc<AuditTracker>>,
}

impl KeyCoordinator {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, catalog: CatalogAdapter) -> Self {
        let defaults = EdsConfig::default();
        KeyCoordinator {
            discovery,
            catalog,
            service_type: defaults.service_type,
            default_cipher: DEFAULT_CIPHER.to_string(),
            audit: None,
        }
    }

    pub fn from_config(config: &EdsConfig, discovery: Arc<dyn ServiceDiscovery>, catalog: CatalogAdapter) -> Self {
        Self::new(discovery, catalog)
            .with_service_type(&config.service_type)
            .with_default_cipher(&config.default_cipher)
    }

    pub fn with_service_type(mut self, service_type: &str) -> Self {
        self.service_type = service_type.to_string();
        self
    }

    pub fn with_default_cipher(mut self, cipher: &str) -> Self {
        self.default_cipher = cipher.to_string();
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTracker>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Current endpoint set for the configured service type, primary first.
    pub async fn catalog_endpoints(&self) -> Result<Vec<String>> {
        discover_endpoints(self.discovery.as_ref(), &self.service_type).await
    }

    /// Generate a key for `item_id` and distribute its shares.
    ///
    /// `cipher` falls back to the configured default; `key_size_bits == 0`
    /// selects the cipher's default key length.
    pub async fn register(&self, item_id: &str, cipher: Option<&str>, key_size_bits: usize) -> Result<()> {
        self.register_key(item_id, None, cipher, key_size_bits).await.map(|_| ())
    }

    /// Like [`register`](Self::register), and also record the item's GUID or
    /// SURL at the primary endpoint. A failed replica write undoes the shares.
    pub async fn register_replica(
        &self,
        item_id: &str,
        replica: &ReplicaId,
        cipher: Option<&str>,
        key_size_bits: usize,
    ) -> Result<()> {
        self.register_key(item_id, Some(replica), cipher, key_size_bits).await.map(|_| ())
    }

    /// Register a key and open an encryption stream with it straight away.
    pub async fn register_and_init_encrypt(
        &self,
        item_id: &str,
        cipher: Option<&str>,
        key_size_bits: usize,
    ) -> Result<CipherSession> {
        let material = self.register_key(item_id, None, cipher, key_size_bits).await?;
        CipherSession::new(material, Direction::Encrypt)
    }

    pub async fn register_replica_and_init_encrypt(
        &self,
        item_id: &str,
        replica: &ReplicaId,
        cipher: Option<&str>,
        key_size_bits: usize,
    ) -> Result<CipherSession> {
        let material = self.register_key(item_id, Some(replica), cipher, key_size_bits).await?;
        CipherSession::new(material, Direction::Encrypt)
    }

    /// GUID or SURL recorded for `item_id` at the primary endpoint, if any.
    pub async fn replica(&self, item_id: &str) -> Result<Option<ReplicaId>> {
        let endpoints = self.catalog_endpoints().await?;
        let Some(primary) = endpoints.first() else {
            return Err(EdsError::Discovery(format!("no endpoints for {}", self.service_type)));
        };

        let values = self.catalog.get_attributes(primary, item_id, &[ATTR_GUID, ATTR_SURL]).await?;
        let mut values = values.into_iter();
        match (values.next().flatten(), values.next().flatten()) {
            (Some(guid), None) => Ok(Some(ReplicaId::Guid(guid))),
            (None, Some(surl)) => Ok(Some(ReplicaId::Surl(surl))),
            (None, None) => Ok(None),
            (Some(_), Some(_)) => Err(EdsError::Corruption(format!(
                "{item_id} carries both {ATTR_GUID} and {ATTR_SURL} at {primary}"
            ))),
        }
    }

    /// Open an encryption stream with the key registered for `item_id`.
    pub async fn init_encrypt(&self, item_id: &str) -> Result<CipherSession> {
        let material = self.retrieve(item_id).await?;
        CipherSession::new(material, Direction::Encrypt)
    }

    /// Open a decryption stream with the key registered for `item_id`.
    pub async fn init_decrypt(&self, item_id: &str) -> Result<CipherSession> {
        let material = self.retrieve(item_id).await?;
        CipherSession::new(material, Direction::Decrypt)
    }

    /// Rebuild the key for `item_id` from a quorum of consistent shares.
    pub async fn retrieve(&self, item_id: &str) -> Result<KeyMaterial> {
        let span = info_span!("retrieve", item_id = %item_id, op_id = %Uuid::new_v4());
        let outcome = self.retrieve_inner(item_id).instrument(span).await;

        match &outcome {
            Ok(material) => self.audit(AuditRecord::new(
                AuditEventType::Retrieve,
                item_id,
                format!("key {} reconstructed ({})", material.fingerprint(), material.cipher.name()),
            )),
            Err(e) => self.audit(AuditRecord::new(AuditEventType::Error, item_id, format!("retrieve failed: {e}"))),
        }
        outcome
    }

    /// Delete the entry for `item_id` from every endpoint.
    ///
    /// All endpoints are attempted even after a failure; the error reports
    /// how many deletes did not go through.
    pub async fn unregister(&self, item_id: &str) -> Result<()> {
        let span = info_span!("unregister", item_id = %item_id, op_id = %Uuid::new_v4());
        let outcome = self.unregister_inner(item_id).instrument(span).await;

        match &outcome {
            Ok(total) => self.audit(AuditRecord::new(
                AuditEventType::Unregister,
                item_id,
                format!("entry removed from {total} endpoints"),
            )),
            Err(e) => self.audit(AuditRecord::new(AuditEventType::Error, item_id, format!("unregister failed: {e}"))),
        }
        outcome.map(|_| ())
    }

    async fn register_key(
        &self,
        item_id: &str,
        replica: Option<&ReplicaId>,
        cipher: Option<&str>,
        key_size_bits: usize,
    ) -> Result<KeyMaterial> {
        let span = info_span!("register", item_id = %item_id, op_id = %Uuid::new_v4());
        let outcome = self
            .register_inner(item_id, replica, cipher, key_size_bits)
            .instrument(span)
            .await;

        match &outcome {
            Ok(material) => self.audit(AuditRecord::new(
                AuditEventType::Register,
                item_id,
                format!("key {} registered ({})", material.fingerprint(), material.cipher.name()),
            )),
            Err(e) => self.audit(AuditRecord::new(AuditEventType::Error, item_id, format!("register failed: {e}"))),
        }
        outcome
    }

    async fn register_inner(
        &self,
        item_id: &str,
        replica: Option<&ReplicaId>,
        cipher: Option<&str>,
        key_size_bits: usize,
    ) -> Result<KeyMaterial> {
        let cipher = CipherKind::from_name(cipher.unwrap_or(&self.default_cipher))?;
        let material = KeyMaterial::generate(cipher, key_size_bits)?;

        let endpoints = self.catalog_endpoints().await?;
        let total = endpoints.len();
        let threshold = sharing::threshold_for(total);
        let shares = Zeroizing::new(sharing::split(&material.key, total, threshold)?);

        debug!(
            endpoints = total,
            threshold,
            cipher = cipher.name(),
            fingerprint = %material.fingerprint(),
            "distributing key shares"
        );

        let iv = to_hex(&material.iv);
        let key_info = material.key_info();

        for (index, (endpoint, share)) in endpoints.iter().zip(shares.iter()).enumerate() {
            let attributes = [
                Attribute::new(ATTR_IV, iv.as_str()),
                Attribute::new(ATTR_KEY, to_hex(share)),
                Attribute::new(ATTR_CIPHER, cipher.name()),
                Attribute::new(ATTR_KEYINFO, key_info.as_str()),
                Attribute::new(ATTR_KEYS_NEEDED, threshold.to_string()),
                Attribute::new(ATTR_KEY_INDEX, index.to_string()),
            ];

            if let Err(failure) = self.write_share(endpoint, item_id, &attributes).await {
                warn!(endpoint = %endpoint, index, error = %failure.error, "share write failed, rolling back");

                let mut written: Vec<&str> = endpoints[..index].iter().map(String::as_str).collect();
                if failure.created {
                    written.push(endpoint.as_str());
                }
                self.rollback(item_id, &written).await;
                return Err(failure.error);
            }
        }

        if let (Some(replica), Some(primary)) = (replica, endpoints.first()) {
            if let Err(e) = self.catalog.set_attributes(primary, item_id, &[replica.attribute()]).await {
                warn!(endpoint = %primary, replica = %replica, error = %e, "replica write failed, rolling back");
                let written: Vec<&str> = endpoints.iter().map(String::as_str).collect();
                self.rollback(item_id, &written).await;
                return Err(e);
            }
            debug!(endpoint = %primary, replica = %replica, "replica recorded");
        }

        info!(endpoints = total, threshold, "key registered");
        Ok(material)
    }

    async fn write_share(
        &self,
        endpoint: &str,
        item_id: &str,
        attributes: &[Attribute],
    ) -> std::result::Result<(), WriteFailure> {
        self.catalog
            .create_entry(endpoint, item_id, SCHEMA)
            .await
            .map_err(|error| WriteFailure { error, created: false })?;

        self.catalog
            .set_attributes(endpoint, item_id, attributes)
            .await
            .map_err(|error| WriteFailure { error, created: true })
    }

    /// Best-effort removal of entries written by a failed registration.
    /// Delete failures are logged and dropped.
    async fn rollback(&self, item_id: &str, endpoints: &[&str]) {
        let deletes = endpoints.iter().map(|endpoint| self.catalog.remove_entry(endpoint, item_id));
        let results = join_all(deletes).await;

        let mut failed = 0;
        for (endpoint, result) in endpoints.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                warn!(endpoint = %endpoint, error = %e, "rollback delete failed");
                self.audit(
                    AuditRecord::new(AuditEventType::Error, item_id, format!("rollback delete failed: {e}"))
                        .at_endpoint(endpoint),
                );
            }
        }

        self.audit(AuditRecord::new(
            AuditEventType::Rollback,
            item_id,
            format!("rolled back {} of {} written shares", endpoints.len() - failed, endpoints.len()),
        ));
    }

    async fn retrieve_inner(&self, item_id: &str) -> Result<KeyMaterial> {
        let endpoints = self.catalog_endpoints().await?;

        let mut shares: Vec<Option<ShareBytes>> = vec![None; endpoints.len()];
        let mut reference: Option<(ShareMeta, usize)> = None;
        let mut collected = 0usize;
        let mut first_error: Option<EdsError> = None;

        for endpoint in &endpoints {
            let fetched = match self.fetch_share(endpoint, item_id).await {
                Ok(fetched) => fetched,
                Err(e @ EdsError::Corruption(_)) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "share unavailable");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            // the first record read sets what every later one must match
            match &reference {
                Some((expected, _)) if *expected != fetched.meta => {
                    return Err(EdsError::Corruption(format!(
                        "share at {endpoint} disagrees with earlier shares of {item_id}: {}",
                        describe_mismatch(expected, &fetched.meta)
                    )));
                }
                Some(_) => {}
                None => reference = Some((fetched.meta.clone(), fetched.keys_needed)),
            }

            if fetched.index >= shares.len() {
                shares.resize(fetched.index + 1, None);
            }
            let slot = &mut shares[fetched.index];
            if slot.is_none() {
                *slot = Some(fetched.share);
                collected += 1;
            } else {
                debug!(endpoint = %endpoint, index = fetched.index, "duplicate share index ignored");
            }

            if collected >= fetched.keys_needed {
                break;
            }
        }

        let Some((meta, keys_needed)) = reference else {
            return Err(EdsError::InsufficientShares {
                detail: format!("no endpoint returned a share for {item_id}"),
                cause: first_error.map(Box::new),
            });
        };
        if collected < keys_needed {
            return Err(EdsError::InsufficientShares {
                detail: format!("{collected} of {keys_needed} shares available for {item_id}"),
                cause: first_error.map(Box::new),
            });
        }

        let slots = shares.len();
        let key = sharing::join(&shares, slots)?;
        let cipher = CipherKind::from_name(&meta.cipher)?;
        let iv = from_hex(&meta.iv)?;

        if iv.len() != cipher.iv_len() {
            return Err(EdsError::CipherInit(format!(
                "{} needs a {}-byte IV, catalog holds {} bytes",
                cipher.name(),
                cipher.iv_len(),
                iv.len()
            )));
        }
        if !cipher.accepts_key_len(key.len()) {
            return Err(EdsError::CipherInit(format!(
                "{} does not support {}-bit keys",
                cipher.name(),
                key.len() * 8
            )));
        }

        let material = KeyMaterial { cipher, key, iv };
        if meta.key_info != material.key_info() {
            return Err(EdsError::Corruption(format!(
                "{item_id}: key info says {} bits, reconstructed key has {}",
                meta.key_info,
                material.key_len_bits()
            )));
        }

        info!(
            shares = collected,
            keys_needed,
            fingerprint = %material.fingerprint(),
            "key reconstructed"
        );
        Ok(material)
    }

    /// Read and parse one share record. Any malformed field makes the whole
    /// record count as unavailable at that endpoint.
    async fn fetch_share(&self, endpoint: &str, item_id: &str) -> Result<FetchedShare> {
        let values = self.catalog.get_attributes(endpoint, item_id, &SHARE_ATTRIBUTES).await?;

        let malformed = |message: String| EdsError::Catalog {
            endpoint: endpoint.to_string(),
            kind: FaultKind::Protocol,
            message,
        };

        let mut fields = SHARE_ATTRIBUTES.iter().zip(values).map(|(name, value)| {
            value.ok_or_else(|| malformed(format!("getAttributes: attribute {name} missing for {item_id}")))
        });
        let mut next = || fields.next().unwrap_or_else(|| Err(malformed("getAttributes: short reply".into())));

        let iv = next()?;
        let key = next()?;
        let cipher = next()?;
        let key_info = next()?;
        let keys_needed_text = next()?;
        let index_text = next()?;

        let keys_needed: usize = keys_needed_text
            .parse()
            .ok()
            .filter(|k| (1..=MAX_SHARES).contains(k))
            .ok_or_else(|| malformed(format!("{ATTR_KEYS_NEEDED} '{keys_needed_text}' is not a valid threshold")))?;
        let index: usize = index_text
            .parse()
            .ok()
            .filter(|i| *i < MAX_SHARES)
            .ok_or_else(|| malformed(format!("{ATTR_KEY_INDEX} '{index_text}' is not a valid share index")))?;
        let share = from_hex(&key).map_err(|e| malformed(format!("{ATTR_KEY}: {e}")))?;

        if share.len() <= HEADER_LEN {
            return Err(malformed(format!("{ATTR_KEY}: share for {item_id} is truncated")));
        }
        if share[0] as usize != index + 1 {
            return Err(malformed(format!(
                "{ATTR_KEY_INDEX}={index} does not match the share's x-coordinate {}",
                share[0]
            )));
        }
        if share[1] as usize != keys_needed {
            return Err(EdsError::Corruption(format!(
                "share at {endpoint} was split for a different threshold than {ATTR_KEYS_NEEDED}={keys_needed}"
            )));
        }

        Ok(FetchedShare {
            index,
            keys_needed,
            share,
            meta: ShareMeta {
                keys_needed: keys_needed_text,
                iv,
                key_info,
                cipher,
            },
        })
    }

    async fn unregister_inner(&self, item_id: &str) -> Result<usize> {
        let endpoints = self.catalog_endpoints().await?;
        let total = endpoints.len();

        let results = join_all(endpoints.iter().map(|endpoint| self.catalog.remove_entry(endpoint, item_id))).await;

        let mut failed = 0;
        let mut first: Option<EdsError> = None;
        for (endpoint, result) in endpoints.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                warn!(endpoint = %endpoint, error = %e, "delete failed");
                first.get_or_insert(e);
            }
        }

        match first {
            Some(first) => Err(EdsError::UnregisterIncomplete {
                failed,
                total,
                first: Box::new(first),
            }),
            None => {
                info!(endpoints = total, "entry unregistered");
                Ok(total)
            }
        }
    }

    fn audit(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.log(record);
        }
    }
}

fn describe_mismatch(expected: &ShareMeta, found: &ShareMeta) -> String {
    let fields = [
        (ATTR_KEYS_NEEDED, &expected.keys_needed, &found.keys_needed),
        (ATTR_IV, &expected.iv, &found.iv),
        (ATTR_KEYINFO, &expected.key_info, &found.key_info),
        (ATTR_CIPHER, &expected.cipher, &found.cipher),
    ];
    fields
        .iter()
        .filter(|(_, a, b)| a != b)
        .map(|(name, a, b)| format!("{name} '{b}' != '{a}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
