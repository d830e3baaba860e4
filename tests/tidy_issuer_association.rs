use pretty_assertions::assert_eq;
use rustpki::api::{CrlHandlers, IssuerHandlers};
use rustpki::config::EngineConfig;
use rustpki::pki::crl::{inspect_crl, CrlKind};
use rustpki::pki::{GenerateRootRequest, IssueRequest, TidyRequest};
use rustpki::storage::{LocalStorage, Storage};
use rustpki::PkiBackend;
use std::sync::Arc;

fn association_tidy() -> TidyRequest {
    TidyRequest {
        tidy_cert_store: false,
        tidy_revoked_certs: false,
        tidy_revoked_cert_issuer_associations: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn tidy_repairs_and_restores_issuer_association() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path().to_path_buf()).unwrap());
    let backend = PkiBackend::setup(storage, EngineConfig::default())
        .await
        .unwrap();
    let issuers = IssuerHandlers::new(backend.clone());
    let crl = CrlHandlers::new(backend.clone());

    let root = issuers
        .generate_root(GenerateRootRequest {
            common_name: "Tidy Root".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let leaf = issuers
        .issue(IssueRequest {
            common_name: "tidy.example.com".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let revoked = backend.revoke_serial(&leaf.serial_number).await.unwrap();
    crl.rotate().await.unwrap();

    let root_crl = backend
        .issuer_crl(&root.issuer_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    let summary = inspect_crl(&root_crl).unwrap();
    let (_, revoked_at) = summary
        .revoked
        .iter()
        .find(|(serial, _)| serial == &leaf.serial_number)
        .unwrap();
    assert_eq!(
        revoked_at.timestamp(),
        revoked.revocation_time.unwrap().timestamp()
    );

    let other = issuers
        .generate_root(GenerateRootRequest {
            common_name: "Other Root".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Keep what is needed to re-import the root after deleting it.
    let key_id = root.key_id.clone().unwrap();
    let key = backend.issuers().fetch_key(&key_id).await.unwrap().unwrap();
    let bundle = format!("{}{}", root.certificate, key.private_key);

    issuers.delete_issuer(&root.issuer_id).await.unwrap();
    crl.rotate().await.unwrap();

    let other_crl = backend
        .issuer_crl(&other.issuer_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    assert!(!inspect_crl(&other_crl)
        .unwrap()
        .contains(&leaf.serial_number));

    let status = issuers.tidy(association_tidy()).await.unwrap();
    assert_eq!(status.missing_issuer_cert_count, 1);
    assert_eq!(status.revoked_cert_reassociated, 0);
    let record = backend
        .revocations()
        .fetch(&leaf.serial_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.certificate_issuer, None);

    let imported = issuers.import(&bundle).await.unwrap();
    assert_eq!(imported.imported_issuers.len(), 1);
    assert_eq!(imported.existing_keys, vec![key_id]);
    let reimported_id = imported.imported_issuers[0].clone();

    let status = issuers.tidy(association_tidy()).await.unwrap();
    assert_eq!(status.missing_issuer_cert_count, 0);
    assert_eq!(status.revoked_cert_reassociated, 1);
    assert!(status.crl_rebuild_requested);
    let record = backend
        .revocations()
        .fetch(&leaf.serial_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.certificate_issuer, Some(reimported_id.clone()));

    let reimported_crl = backend
        .issuer_crl(&reimported_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    assert!(inspect_crl(&reimported_crl)
        .unwrap()
        .contains(&leaf.serial_number));

    let other_crl = backend
        .issuer_crl(&other.issuer_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    assert!(!inspect_crl(&other_crl)
        .unwrap()
        .contains(&leaf.serial_number));
}
