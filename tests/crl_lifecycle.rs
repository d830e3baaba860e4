use pretty_assertions::assert_eq;
use rustpki::api::{CrlBody, CrlFormat, CrlHandlers, IssuerHandlers};
use rustpki::config::{CrlConfigUpdate, EngineConfig};
use rustpki::pki::crl::{inspect_crl, CrlKind};
use rustpki::pki::{GenerateRootRequest, IntermediateCsrRequest, IssueRequest};
use rustpki::storage::{MemoryStorage, Storage};
use rustpki::PkiBackend;
use std::sync::Arc;
use std::time::Duration;

struct Mount {
    backend: Arc<PkiBackend>,
    crl: CrlHandlers,
    issuers: IssuerHandlers,
}

async fn mount() -> Mount {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let backend = PkiBackend::setup(storage, EngineConfig::default())
        .await
        .unwrap();
    let issuers = IssuerHandlers::new(backend.clone());
    issuers
        .generate_root(GenerateRootRequest {
            common_name: "Lifecycle Root".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    Mount {
        crl: CrlHandlers::new(backend.clone()),
        issuers,
        backend,
    }
}

async fn default_crl_der(mount: &Mount) -> Vec<u8> {
    match mount.crl.read_crl(CrlFormat::Der).await.unwrap() {
        CrlBody::Der(der) => der,
        CrlBody::Pem(_) => panic!("asked for DER"),
    }
}

#[tokio::test]
async fn rotate_produces_strictly_newer_this_update() {
    let mount = mount().await;

    mount.crl.rotate().await.unwrap();
    let first = inspect_crl(&default_crl_der(&mount).await).unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    mount.crl.rotate().await.unwrap();
    let second = inspect_crl(&default_crl_der(&mount).await).unwrap();

    assert!(second.this_update > first.this_update);
    assert!(second.number > first.number);
}

#[tokio::test]
async fn delta_empties_after_full_rebuild() {
    let mount = mount().await;
    mount
        .crl
        .write_config(CrlConfigUpdate {
            auto_rebuild: Some(true),
            enable_delta: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    mount.crl.rotate().await.unwrap();

    let leaf = mount
        .issuers
        .issue(IssueRequest {
            common_name: "delta.example.com".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    mount
        .backend
        .revoke_serial(&leaf.serial_number)
        .await
        .unwrap();

    mount.crl.rotate_delta().await.unwrap();
    let delta = match mount.crl.read_delta_crl(CrlFormat::Der).await.unwrap() {
        CrlBody::Der(der) => inspect_crl(&der).unwrap(),
        CrlBody::Pem(_) => unreachable!(),
    };
    assert!(delta.contains(&leaf.serial_number));
    let complete = inspect_crl(&default_crl_der(&mount).await).unwrap();
    assert!(!complete.contains(&leaf.serial_number));

    mount.crl.rotate().await.unwrap();
    let complete = inspect_crl(&default_crl_der(&mount).await).unwrap();
    let delta = match mount.crl.read_delta_crl(CrlFormat::Der).await.unwrap() {
        CrlBody::Der(der) => inspect_crl(&der).unwrap(),
        CrlBody::Pem(_) => unreachable!(),
    };

    assert!(complete.contains(&leaf.serial_number));
    assert!(delta.revoked.is_empty());
    assert_eq!(delta.extension_count, complete.extension_count + 1);
    assert_eq!(delta.base_number, complete.number);
}

#[tokio::test]
async fn revoked_issuer_is_excluded_from_its_own_crl() {
    let mount = mount().await;

    let csr = mount
        .issuers
        .generate_intermediate(IntermediateCsrRequest {
            common_name: "Lifecycle Intermediate".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let signed = mount
        .issuers
        .sign_intermediate("default", &csr.csr, None)
        .await
        .unwrap();
    let imported = mount.issuers.import(&signed.certificate).await.unwrap();
    let intermediate_id = imported.imported_issuers[0].clone();
    let root_id = mount
        .backend
        .issuers()
        .issuer_defaults()
        .await
        .unwrap()
        .default_issuer_id
        .unwrap();

    mount
        .backend
        .revoke_serial(&signed.serial_number)
        .await
        .unwrap();
    mount.crl.rotate().await.unwrap();

    let root_crl = mount
        .backend
        .issuer_crl(&root_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    let intermediate_crl = mount
        .backend
        .issuer_crl(&intermediate_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();

    assert!(inspect_crl(&root_crl).unwrap().contains(&signed.serial_number));
    assert!(!inspect_crl(&intermediate_crl)
        .unwrap()
        .contains(&signed.serial_number));

    let root = mount
        .backend
        .issuers()
        .fetch_issuer(&root_id)
        .await
        .unwrap()
        .unwrap();
    mount.backend.revoke_serial(&root.serial_number).await.unwrap();
    mount.crl.rotate().await.unwrap();

    let root_crl = mount
        .backend
        .issuer_crl(&root_id, CrlKind::Complete)
        .await
        .unwrap()
        .unwrap();
    let summary = inspect_crl(&root_crl).unwrap();
    assert!(!summary.contains(&root.serial_number));
    assert!(summary.contains(&signed.serial_number));
}

#[tokio::test]
async fn disabled_crl_is_signed_but_empty() {
    let mount = mount().await;
    let leaf = mount
        .issuers
        .issue(IssueRequest {
            common_name: "disabled.example.com".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    mount
        .backend
        .revoke_serial(&leaf.serial_number)
        .await
        .unwrap();
    let before = inspect_crl(&default_crl_der(&mount).await).unwrap();
    assert!(before.contains(&leaf.serial_number));

    mount
        .crl
        .write_config(CrlConfigUpdate {
            disable: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    let after = inspect_crl(&default_crl_der(&mount).await).unwrap();
    assert!(after.revoked.is_empty());
    assert!(after.number > before.number);
}
