use std::sync::Arc;
use std::time::Duration;

use genvault::{
    EnvelopeCodec, EnvelopeError, EnvelopeKeyManager, KeyState, KeyVersion, ManagerConfig,
    PaillierScheme, Value,
};

fn manager() -> EnvelopeKeyManager {
    let config = ManagerConfig::new(Duration::from_secs(3600), Duration::from_secs(86_400));
    EnvelopeKeyManager::new(config, Arc::new(PaillierScheme::with_modulus_bits(256))).unwrap()
}

#[test]
fn test_packages_survive_many_rotations() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    manager.rotate().unwrap();

    let sealed: Vec<_> = (0..4)
        .map(|i| {
            let package = codec
                .seal(&Value::Text(format!("record-{i}")), &manager)
                .unwrap();
            manager.rotate().unwrap();
            package
        })
        .collect();

    assert_eq!(manager.active_version(), Some(KeyVersion::new(5)));
    assert_eq!(manager.active_count(), 1);

    for (i, package) in sealed.iter().enumerate() {
        assert_eq!(package.kek_version(), KeyVersion::new(i as u32 + 1));
        assert_eq!(
            manager.record(package.kek_version()).unwrap().state(),
            KeyState::Archived
        );
        assert_eq!(
            codec.open(package, &manager).unwrap(),
            Value::Text(format!("record-{i}"))
        );
    }
}

#[test]
fn test_evicted_version_cannot_open() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    let v1 = manager.rotate().unwrap();
    let package = codec.seal(&Value::from("short-lived"), &manager).unwrap();

    assert!(matches!(
        manager.evict(v1),
        Err(EnvelopeError::CannotEvictActive(_))
    ));
    // Still readable after a failed eviction.
    assert!(codec.open(&package, &manager).is_ok());

    manager.rotate().unwrap();
    manager.evict(v1).unwrap();
    assert!(matches!(
        codec.open(&package, &manager),
        Err(EnvelopeError::UnknownKeyVersion(v)) if v == v1
    ));
    assert!(matches!(
        manager.evict(KeyVersion::new(99)),
        Err(EnvelopeError::UnknownKeyVersion(_))
    ));
}

#[test]
fn test_rewrap_migration_allows_eviction() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    let v1 = manager.rotate().unwrap();
    let package = codec.seal(&Value::from("migrate me"), &manager).unwrap();
    let v2 = manager.rotate().unwrap();

    let rewrapped = manager.reencrypt_dek(package.wrapped_dek()).unwrap();
    assert_eq!(rewrapped.kek_version(), v2);

    let migrated = manager.migrate_package(&package).unwrap();
    assert_eq!(migrated.kek_version(), v2);
    assert_eq!(migrated.body(), package.body());

    manager.evict(v1).unwrap();
    assert!(codec.open(&package, &manager).is_err());
    assert_eq!(
        codec.open(&migrated, &manager).unwrap(),
        Value::from("migrate me")
    );
}

#[test]
fn test_migrated_float_sums_with_fresh_packages() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    let v1 = manager.rotate().unwrap();
    let old = codec.seal(&Value::Float(1.5), &manager).unwrap();
    let v2 = manager.rotate().unwrap();
    let fresh = codec.seal(&Value::Float(2.0), &manager).unwrap();

    let migrated = manager.migrate_package(&old).unwrap();
    assert_eq!(migrated.kek_version(), v2);
    assert_eq!(codec.homomorphic_sum(&[migrated.clone()], &manager).unwrap(), 1.5);
    assert_eq!(
        codec.homomorphic_sum(&[migrated.clone(), fresh.clone()], &manager).unwrap(),
        3.5
    );

    // The migrated package no longer depends on v1 at all.
    manager.evict(v1).unwrap();
    assert_eq!(codec.open(&migrated, &manager).unwrap(), Value::Float(1.5));
    assert_eq!(codec.homomorphic_sum(&[migrated, fresh], &manager).unwrap(), 3.5);
    assert!(matches!(
        manager.migrate_package(&old),
        Err(EnvelopeError::UnknownKeyVersion(v)) if v == v1
    ));
}
