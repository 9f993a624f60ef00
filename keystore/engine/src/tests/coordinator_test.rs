use std::sync::Arc;

use crate::audit::{AuditEventType, AuditTracker};
use crate::catalog::{
    ATTR_CIPHER, ATTR_GUID, ATTR_IV, ATTR_KEY, ATTR_KEY_INDEX, ATTR_KEYINFO, ATTR_KEYS_NEEDED, ATTR_SURL, Attribute,
    CatalogOp, SCHEMA,
};
use crate::codec::to_hex;
use crate::crypto::{CipherKind, KeyMaterial};
use crate::error::{EdsError, FaultKind};
use crate::replica::ReplicaId;
use crate::sharing::split;

use super::{Fleet, SERVICE};

const ITEM: &str = "guid:5f1e2c7a-0d7b-4c51-9a52-3b7f0c6de001";

/// Write a key split `total`/`threshold` ways straight into the catalog.
async fn seed(fleet: &Fleet, item: &str, material: &KeyMaterial, threshold: usize) {
    let adapter = fleet.adapter();
    let shares = split(&material.key, fleet.endpoints.len(), threshold).unwrap();

    for (index, (endpoint, share)) in fleet.endpoints.iter().zip(&shares).enumerate() {
        adapter.create_entry(endpoint, item, SCHEMA).await.unwrap();
        adapter
            .set_attributes(
                endpoint,
                item,
                &[
                    Attribute::new(ATTR_IV, to_hex(&material.iv)),
                    Attribute::new(ATTR_KEY, to_hex(share)),
                    Attribute::new(ATTR_CIPHER, material.cipher.name()),
                    Attribute::new(ATTR_KEYINFO, material.key_info()),
                    Attribute::new(ATTR_KEYS_NEEDED, threshold.to_string()),
                    Attribute::new(ATTR_KEY_INDEX, index.to_string()),
                ],
            )
            .await
            .unwrap();
    }
    fleet.catalog.reset_counters();
}

#[tokio::test]
async fn test_register_writes_one_share_per_endpoint() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();

    coordinator.register(ITEM, None, 0).await.unwrap();

    for (i, endpoint) in fleet.endpoints.iter().enumerate() {
        assert!(fleet.catalog.contains(endpoint, ITEM));
        assert_eq!(fleet.catalog.peek_attribute(endpoint, ITEM, ATTR_KEY_INDEX), Some(i.to_string()));
        assert_eq!(fleet.catalog.peek_attribute(endpoint, ITEM, ATTR_KEYS_NEEDED).as_deref(), Some("4"));
        assert_eq!(fleet.catalog.peek_attribute(endpoint, ITEM, ATTR_CIPHER).as_deref(), Some("bf-cbc"));
        assert_eq!(fleet.catalog.peek_attribute(endpoint, ITEM, ATTR_KEYINFO).as_deref(), Some("128"));
    }

    let iv = fleet.catalog.peek_attribute("catalog-0", ITEM, ATTR_IV).unwrap();
    assert_eq!(iv.len(), 16); // 8-byte Blowfish IV, hex encoded
    assert!(fleet.endpoints.iter().all(|e| fleet.catalog.peek_attribute(e, ITEM, ATTR_IV).as_deref() == Some(iv.as_str())));
}

#[tokio::test]
async fn test_failed_create_rolls_back_earlier_endpoints() {
    let fleet = Fleet::new(5);
    fleet.catalog.fail_operation("catalog-3", CatalogOp::CreateEntry);

    let err = fleet.coordinator().register(ITEM, Some("aes-256-cbc"), 256).await.unwrap_err();

    assert_eq!(err.endpoint(), Some("catalog-3"));
    for endpoint in &fleet.endpoints {
        assert!(!fleet.catalog.contains(endpoint, ITEM), "{endpoint} still holds a share");
    }
    for endpoint in ["catalog-0", "catalog-1", "catalog-2"] {
        assert_eq!(fleet.catalog.call_count(endpoint, CatalogOp::RemoveEntry), 1);
    }
    // nothing was created at the failing endpoint, so nothing is deleted there
    assert_eq!(fleet.catalog.call_count("catalog-3", CatalogOp::RemoveEntry), 0);
    assert_eq!(fleet.catalog.total_calls("catalog-4"), 0);
}

#[tokio::test]
async fn test_failed_attribute_write_also_removes_the_new_entry() {
    let fleet = Fleet::new(4);
    fleet.catalog.fail_operation("catalog-2", CatalogOp::SetAttributes);

    let err = fleet.coordinator().register(ITEM, None, 0).await.unwrap_err();

    assert!(matches!(err, EdsError::Catalog { ref endpoint, .. } if endpoint == "catalog-2"));
    for endpoint in &fleet.endpoints {
        assert!(!fleet.catalog.contains(endpoint, ITEM));
    }
    assert_eq!(fleet.catalog.call_count("catalog-2", CatalogOp::RemoveEntry), 1);
}

#[tokio::test]
async fn test_rollback_failures_do_not_mask_the_write_error() {
    let fleet = Fleet::new(5);
    fleet.catalog.fail_operation("catalog-3", CatalogOp::SetAttributes);
    fleet.catalog.fail_operation("catalog-1", CatalogOp::RemoveEntry);

    let audit = Arc::new(AuditTracker::new(16));
    let err = fleet
        .coordinator()
        .with_audit(audit.clone())
        .register(ITEM, None, 0)
        .await
        .unwrap_err();

    assert_eq!(err.endpoint(), Some("catalog-3"));
    assert!(fleet.catalog.contains("catalog-1", ITEM));
    assert!(!fleet.catalog.contains("catalog-0", ITEM));
    assert!(!fleet.catalog.contains("catalog-2", ITEM));
    assert!(!fleet.catalog.contains("catalog-3", ITEM));

    let events: Vec<_> = audit.recent(16).into_iter().map(|r| r.event_type).collect();
    assert!(events.contains(&AuditEventType::Rollback));
    assert_eq!(events[0], AuditEventType::Error);
}

#[tokio::test]
async fn test_existing_entries_are_never_rolled_back() {
    let fleet = Fleet::new(3);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    let before = coordinator.retrieve(ITEM).await.unwrap();

    let err = coordinator.register(ITEM, None, 0).await.unwrap_err();
    assert!(matches!(err, EdsError::Catalog { kind: FaultKind::Exists, .. }));

    let after = coordinator.retrieve(ITEM).await.unwrap();
    assert_eq!(before.key, after.key);
}

#[tokio::test]
async fn test_register_records_surl_at_the_primary_only() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();
    let surl = ReplicaId::parse("srm://se01.example.org/eds/run42.dat").unwrap();

    coordinator.register_replica("lfn:/grid/run42.dat", &surl, None, 0).await.unwrap();

    assert_eq!(
        fleet.catalog.peek_attribute("catalog-0", "lfn:/grid/run42.dat", ATTR_SURL).as_deref(),
        Some("srm://se01.example.org/eds/run42.dat")
    );
    for endpoint in &fleet.endpoints[1..] {
        assert_eq!(fleet.catalog.peek_attribute(endpoint, "lfn:/grid/run42.dat", ATTR_SURL), None);
    }
    assert_eq!(fleet.catalog.peek_attribute("catalog-0", "lfn:/grid/run42.dat", ATTR_GUID), None);

    assert_eq!(coordinator.replica("lfn:/grid/run42.dat").await.unwrap(), Some(surl));
    assert!(coordinator.retrieve("lfn:/grid/run42.dat").await.is_ok());
}

#[tokio::test]
async fn test_register_and_encrypt_records_guid() {
    let fleet = Fleet::new(3);
    let coordinator = fleet.coordinator();
    let guid: ReplicaId = "5f1e2c7a-0d7b-4c51-9a52-3b7f0c6de001".parse().unwrap();

    let session = coordinator
        .register_replica_and_init_encrypt("lfn:/grid/a", &guid, Some("aes-128-cbc"), 0)
        .await
        .unwrap();
    session.finalize().unwrap();

    assert_eq!(coordinator.replica("lfn:/grid/a").await.unwrap(), Some(guid));
    // plain registration records nothing
    coordinator.register("lfn:/grid/b", None, 0).await.unwrap();
    assert_eq!(coordinator.replica("lfn:/grid/b").await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_replica_write_rolls_back_every_share() {
    let fleet = Fleet::new(5);
    fleet.catalog.reject_attribute("catalog-0", ATTR_GUID);
    let guid = ReplicaId::parse("5f1e2c7a-0d7b-4c51-9a52-3b7f0c6de001").unwrap();

    let err = fleet.coordinator().register_replica(ITEM, &guid, None, 0).await.unwrap_err();

    assert!(matches!(err, EdsError::Catalog { kind: FaultKind::InvalidArgument, .. }), "got {err:?}");
    assert_eq!(err.endpoint(), Some("catalog-0"));
    for endpoint in &fleet.endpoints {
        assert!(!fleet.catalog.contains(endpoint, ITEM), "{endpoint} still holds a share");
        assert_eq!(fleet.catalog.call_count(endpoint, CatalogOp::RemoveEntry), 1);
    }
}

#[tokio::test]
async fn test_retrieve_reconstructs_the_registered_key() {
    let fleet = Fleet::new(7);
    let coordinator = fleet.coordinator();

    let session = coordinator
        .register_and_init_encrypt(ITEM, Some("aes-192-cbc"), 192)
        .await
        .unwrap();
    assert_eq!(session.cipher(), CipherKind::Aes192Cbc);
    session.finalize().unwrap();

    let material = fleet.coordinator().retrieve(ITEM).await.unwrap();
    assert_eq!(material.cipher, CipherKind::Aes192Cbc);
    assert_eq!(material.key.len(), 24);
    assert_eq!(to_hex(&material.iv), fleet.catalog.peek_attribute("catalog-0", ITEM, ATTR_IV).unwrap());
}

#[tokio::test]
async fn test_conflicting_cipher_is_corruption_even_with_quorum() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, Some("aes-128-cbc"), 128).await.unwrap();

    assert!(fleet.catalog.tamper_attribute("catalog-1", ITEM, ATTR_CIPHER, "bf-cbc"));

    let err = coordinator.retrieve(ITEM).await.unwrap_err();
    assert!(matches!(err, EdsError::Corruption(_)), "got {err:?}");
}

#[tokio::test]
async fn test_corruption_takes_precedence_over_earlier_outage() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();

    fleet.catalog.fail_endpoint("catalog-0");
    assert!(fleet.catalog.tamper_attribute("catalog-2", ITEM, ATTR_IV, "00000000000000FF"));

    let err = coordinator.retrieve(ITEM).await.unwrap_err();
    assert!(matches!(err, EdsError::Corruption(_)), "got {err:?}");
}

#[tokio::test]
async fn test_case_difference_counts_as_disagreement() {
    let fleet = Fleet::new(4);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, Some("aes-256-cbc"), 0).await.unwrap();

    assert!(fleet.catalog.tamper_attribute("catalog-2", ITEM, ATTR_CIPHER, "AES-256-CBC"));
    assert!(matches!(coordinator.retrieve(ITEM).await, Err(EdsError::Corruption(_))));
}

#[tokio::test]
async fn test_retrieval_stops_once_quorum_is_reached() {
    let fleet = Fleet::new(10);
    let material = KeyMaterial::generate(CipherKind::Aes128Cbc, 128).unwrap();
    seed(&fleet, ITEM, &material, 4).await;

    let retrieved = fleet.coordinator().retrieve(ITEM).await.unwrap();
    assert_eq!(retrieved.key, material.key);
    assert_eq!(retrieved.iv, material.iv);

    for (i, endpoint) in fleet.endpoints.iter().enumerate() {
        let expected = usize::from(i < 4);
        assert_eq!(fleet.catalog.call_count(endpoint, CatalogOp::GetAttributes), expected, "{endpoint}");
    }
}

#[tokio::test]
async fn test_failed_endpoints_are_skipped_on_the_way_to_quorum() {
    let fleet = Fleet::new(10);
    let material = KeyMaterial::generate(CipherKind::BlowfishCbc, 0).unwrap();
    seed(&fleet, ITEM, &material, 4).await;
    fleet.catalog.fail_endpoint("catalog-1");
    fleet.catalog.fail_endpoint("catalog-2");

    let retrieved = fleet.coordinator().retrieve(ITEM).await.unwrap();
    assert_eq!(retrieved.key, material.key);

    let queried: Vec<usize> = (0..10)
        .filter(|i| fleet.catalog.call_count(&format!("catalog-{i}"), CatalogOp::GetAttributes) > 0)
        .collect();
    assert_eq!(queried, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_too_few_shares_reports_first_endpoint_error() {
    let fleet = Fleet::new(5); // threshold 4
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();

    fleet.catalog.fail_endpoint("catalog-1");
    fleet.catalog.fail_endpoint("catalog-3");

    match coordinator.retrieve(ITEM).await.unwrap_err() {
        EdsError::InsufficientShares { cause: Some(cause), .. } => {
            assert_eq!(cause.endpoint(), Some("catalog-1"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_item_is_insufficient_shares() {
    let fleet = Fleet::new(3);

    match fleet.coordinator().retrieve("lfn:/nowhere").await.unwrap_err() {
        EdsError::InsufficientShares { cause: Some(cause), .. } => assert!(cause.is_not_exists()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_attribute_counts_as_unavailable() {
    let fleet = Fleet::new(4); // threshold 3
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();

    fleet
        .adapter()
        .set_attributes(
            "catalog-0",
            ITEM,
            &[Attribute {
                name: ATTR_KEY.into(),
                value: None,
            }],
        )
        .await
        .unwrap();

    assert!(coordinator.retrieve(ITEM).await.is_ok());
    assert_eq!(fleet.catalog.call_count("catalog-3", CatalogOp::GetAttributes), 1);
}

#[tokio::test]
async fn test_empty_share_counts_as_unavailable() {
    let fleet = Fleet::new(5); // threshold 4
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    let original = coordinator.retrieve(ITEM).await.unwrap();

    assert!(fleet.catalog.tamper_attribute("catalog-0", ITEM, ATTR_KEY, ""));
    assert_eq!(coordinator.retrieve(ITEM).await.unwrap().key, original.key);

    // a lone x-coordinate byte is no better
    assert!(fleet.catalog.tamper_attribute("catalog-0", ITEM, ATTR_KEY, "01"));
    assert_eq!(coordinator.retrieve(ITEM).await.unwrap().key, original.key);
}

#[tokio::test]
async fn test_index_disagreeing_with_share_counts_as_unavailable() {
    let fleet = Fleet::new(5); // threshold 4
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    let original = coordinator.retrieve(ITEM).await.unwrap();

    assert!(fleet.catalog.tamper_attribute("catalog-0", ITEM, ATTR_KEY_INDEX, "4"));

    fleet.catalog.reset_counters();
    assert_eq!(coordinator.retrieve(ITEM).await.unwrap().key, original.key);
    assert_eq!(fleet.catalog.call_count("catalog-4", CatalogOp::GetAttributes), 1);
}

#[tokio::test]
async fn test_bad_share_with_no_quorum_left_is_insufficient_shares() {
    let fleet = Fleet::new(4); // threshold 3
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();

    assert!(fleet.catalog.tamper_attribute("catalog-0", ITEM, ATTR_KEY, ""));
    fleet.catalog.fail_endpoint("catalog-2");

    match coordinator.retrieve(ITEM).await.unwrap_err() {
        EdsError::InsufficientShares { cause: Some(cause), .. } => {
            assert_eq!(cause.endpoint(), Some("catalog-0"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_reordered_endpoints_still_reconstruct() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    let original = coordinator.retrieve(ITEM).await.unwrap();

    let mut reversed = fleet.endpoints.clone();
    reversed.reverse();
    fleet.discovery.set_endpoints(SERVICE, &reversed).unwrap();

    assert_eq!(coordinator.retrieve(ITEM).await.unwrap().key, original.key);
}

#[tokio::test]
async fn test_share_index_beyond_current_endpoint_count_grows_the_array() {
    let fleet = Fleet::new(5); // threshold 4
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    let original = coordinator.retrieve(ITEM).await.unwrap();

    // catalog-2 left the fleet; catalog-4 now reports index 4 out of 4 endpoints
    let shrunk: Vec<String> = ["catalog-4", "catalog-0", "catalog-1", "catalog-3"]
        .iter()
        .map(|e| e.to_string())
        .collect();
    fleet.discovery.set_endpoints(SERVICE, &shrunk).unwrap();

    assert_eq!(coordinator.retrieve(ITEM).await.unwrap().key, original.key);
}

#[tokio::test]
async fn test_unregister_attempts_every_endpoint() {
    let fleet = Fleet::new(5);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();

    fleet.catalog.fail_endpoint("catalog-0");

    match coordinator.unregister(ITEM).await.unwrap_err() {
        EdsError::UnregisterIncomplete { failed, total, first } => {
            assert_eq!((failed, total), (1, 5));
            assert_eq!(first.endpoint(), Some("catalog-0"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    for endpoint in &fleet.endpoints {
        assert_eq!(fleet.catalog.call_count(endpoint, CatalogOp::RemoveEntry), 1, "{endpoint}");
    }
    for endpoint in &fleet.endpoints[1..] {
        assert!(!fleet.catalog.contains(endpoint, ITEM));
    }
}

#[tokio::test]
async fn test_unregister_then_retrieve_fails() {
    let fleet = Fleet::new(3);
    let coordinator = fleet.coordinator();
    coordinator.register(ITEM, None, 0).await.unwrap();
    coordinator.unregister(ITEM).await.unwrap();

    assert!(fleet.endpoints.iter().all(|e| fleet.catalog.entry_count(e) == 0));
    assert!(matches!(coordinator.retrieve(ITEM).await, Err(EdsError::InsufficientShares { .. })));
}

#[tokio::test]
async fn test_audit_trail_is_newest_first() {
    let fleet = Fleet::new(3);
    let audit = Arc::new(AuditTracker::new(8));
    let coordinator = fleet.coordinator().with_audit(audit.clone());

    coordinator.register(ITEM, None, 0).await.unwrap();
    coordinator.retrieve(ITEM).await.unwrap();
    coordinator.unregister(ITEM).await.unwrap();

    let events: Vec<_> = audit.recent(3).into_iter().map(|r| r.event_type).collect();
    assert_eq!(
        events,
        vec![AuditEventType::Unregister, AuditEventType::Retrieve, AuditEventType::Register]
    );
    assert!(audit.recent(3).iter().all(|r| r.item_id == ITEM));
}

#[tokio::test]
async fn test_discovery_failure_surfaces_from_every_operation() {
    let fleet = Fleet::new(3);
    let coordinator = fleet.coordinator().with_service_type("org.example.Unknown");

    assert!(matches!(coordinator.register(ITEM, None, 0).await, Err(EdsError::Discovery(_))));
    assert!(matches!(coordinator.retrieve(ITEM).await, Err(EdsError::Discovery(_))));
    assert!(matches!(coordinator.unregister(ITEM).await, Err(EdsError::Discovery(_))));
    assert!(matches!(coordinator.catalog_endpoints().await, Err(EdsError::Discovery(_))));
}

#[tokio::test]
async fn test_unknown_cipher_fails_before_any_write() {
    let fleet = Fleet::new(3);
    let err = fleet.coordinator().register(ITEM, Some("rc4"), 0).await.unwrap_err();

    assert!(matches!(err, EdsError::CipherInit(_)));
    assert!(fleet.endpoints.iter().all(|e| fleet.catalog.total_calls(e) == 0));
}
