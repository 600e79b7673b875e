use std::sync::Arc;
use std::time::Duration;

use genvault::{
    EnvelopeCodec, EnvelopeError, EnvelopeKeyManager, EnvelopePackage, ManagerConfig,
    PaillierScheme, Value,
};

fn manager() -> EnvelopeKeyManager {
    let config = ManagerConfig::new(Duration::from_secs(3600), Duration::from_secs(86_400));
    EnvelopeKeyManager::new(config, Arc::new(PaillierScheme::with_modulus_bits(512))).unwrap()
}

#[test]
fn test_sum_matches_plaintext_sum() {
    let manager = manager();
    manager.rotate().unwrap();
    let codec = EnvelopeCodec::default();

    let values = [3.14, 2.71, -1.5, 100.001];
    let packages: Vec<_> = values
        .iter()
        .map(|v| codec.seal(&Value::Float(*v), &manager).unwrap())
        .collect();

    let sum = codec.homomorphic_sum(&packages, &manager).unwrap();
    let expected: f64 = values.iter().sum();
    // One rounding step per input.
    assert!((sum - expected).abs() <= values.len() as f64 / 1000.0);

    let pair = codec.homomorphic_sum(&packages[..2], &manager).unwrap();
    assert!((pair - 5.85).abs() < 1e-9);
}

#[test]
fn test_empty_and_single_sums() {
    let manager = manager();
    manager.rotate().unwrap();
    let codec = EnvelopeCodec::default();

    assert_eq!(codec.homomorphic_sum(&[], &manager).unwrap(), 0.0);

    let one = codec.seal(&Value::Float(-7.25), &manager).unwrap();
    assert_eq!(codec.homomorphic_sum(&[one], &manager).unwrap(), -7.25);
}

#[test]
fn test_cross_version_batch_aborts() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    manager.rotate().unwrap();
    let a = codec.seal(&Value::Float(1.0), &manager).unwrap();
    let b = codec.seal(&Value::Float(2.0), &manager).unwrap();
    manager.rotate().unwrap();
    let stale_free = codec.seal(&Value::Float(3.0), &manager).unwrap();

    // One stale item poisons the whole batch; nothing is skipped.
    assert!(matches!(
        codec.homomorphic_sum(&[a.clone(), b.clone(), stale_free], &manager),
        Err(EnvelopeError::IncompatibleCapability(_))
    ));
    // The archived version still sums on its own.
    assert_eq!(codec.homomorphic_sum(&[a, b], &manager).unwrap(), 3.0);
}

#[test]
fn test_mismatched_scale_factors_are_incompatible() {
    let manager = manager();
    manager.rotate().unwrap();
    let milli = EnvelopeCodec::default();
    let centi = EnvelopeCodec::default().with_scale_factor(100);

    let a = milli.seal(&Value::Float(1.0), &manager).unwrap();
    let b = centi.seal(&Value::Float(1.0), &manager).unwrap();
    assert!(matches!(
        milli.homomorphic_sum(&[a, b], &manager),
        Err(EnvelopeError::IncompatibleCapability(_))
    ));
}

#[test]
fn test_packages_without_numeric_tokens_cannot_be_summed() {
    let manager = manager();
    manager.rotate().unwrap();
    let codec = EnvelopeCodec::default();

    let number = codec.seal(&Value::Float(1.0), &manager).unwrap();
    let text = codec.seal(&Value::from("1.0"), &manager).unwrap();
    assert!(matches!(
        codec.homomorphic_sum(&[number, text], &manager),
        Err(EnvelopeError::MalformedPayload(_))
    ));
}

#[test]
fn test_capability_scalar_mul_on_sealed_token() {
    let manager = manager();
    let version = manager.rotate().unwrap();
    let codec = EnvelopeCodec::default();

    let package = codec.seal(&Value::Float(1.5), &manager).unwrap();
    let capability = manager.capability(version).unwrap();
    let token = package.body().numeric_token().unwrap();

    let tripled = capability.scalar_mul(token, 3).unwrap();
    assert_eq!(capability.decode_numeric(&tripled).unwrap(), 4500);
}

#[test]
fn test_token_from_another_capability_under_same_version_is_rejected() {
    let manager = manager();
    let codec = EnvelopeCodec::default();
    manager.rotate().unwrap();
    let old = codec.seal(&Value::Float(1.0), &manager).unwrap();
    manager.rotate().unwrap();
    let fresh = codec.seal(&Value::Float(2.0), &manager).unwrap();

    // Stamped with the active version but carrying the archived version's token.
    let mut persisted = fresh.to_persisted();
    persisted.numeric_token = old.to_persisted().numeric_token;
    let mismatched = EnvelopePackage::try_from(persisted).unwrap();
    assert_eq!(mismatched.kek_version(), fresh.kek_version());

    assert!(matches!(
        codec.homomorphic_sum(&[mismatched.clone()], &manager),
        Err(EnvelopeError::IncompatibleCapability(_))
    ));
    assert!(matches!(
        codec.homomorphic_sum(&[fresh, mismatched], &manager),
        Err(EnvelopeError::IncompatibleCapability(_))
    ));
}
