use crate::error::{PkiError, Result};
use crate::pki::cert_store::CertStore;
use crate::pki::certutil::{pem_to_der, CertDetails, CERTIFICATE_PEM_TAG};
use crate::pki::issuer::{IssuerId, IssuerStore};
use crate::pki::serial::normalize_serial;
use crate::storage::{get_json, put_json, Storage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const REVOKED_PREFIX: &str = "revoked/";
const DELTA_WAL_PREFIX: &str = "delta-wal/";
const DELTA_LAST_REVOKED: &str = "delta-wal/last-revoked-serial";
const DELTA_LAST_BUILD: &str = "delta-wal/last-build-serial";
const MARKER_PREFIX: &str = "last-";

/// One revoked certificate. Written once; only tidy's issuer association
/// repair rewrites `certificate_issuer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationInfo {
    pub serial_number: String,
    #[serde(with = "der_base64")]
    pub certificate_der: Vec<u8>,
    pub revocation_time: DateTime<Utc>,
    pub certificate_expiry: DateTime<Utc>,
    pub certificate_issuer: Option<IssuerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationOutcome {
    pub serial_number: String,
    pub revocation_time: Option<DateTime<Utc>>,
    /// False when the serial was already revoked or had expired.
    pub newly_revoked: bool,
    pub expired: bool,
    pub issuer_id: Option<IssuerId>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaMarker {
    pub serial: String,
}

enum CertSource {
    Stored,
    Supplied(Vec<u8>),
}

/// Revocation records plus the delta write-ahead log.
pub struct RevocationStore {
    storage: Arc<dyn Storage>,
    issuers: IssuerStore,
    certs: CertStore,
    serial_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RevocationStore {
    pub fn new(storage: Arc<dyn Storage>, issuers: IssuerStore, certs: CertStore) -> Self {
        Self {
            storage,
            issuers,
            certs,
            serial_locks: DashMap::new(),
        }
    }

    fn key(serial: &str) -> Result<String> {
        Ok(format!("{}{}", REVOKED_PREFIX, normalize_serial(serial)?))
    }

    pub async fn fetch(&self, serial: &str) -> Result<Option<RevocationInfo>> {
        get_json(self.storage.as_ref(), &Self::key(serial)?).await
    }

    pub async fn write(&self, info: &RevocationInfo) -> Result<()> {
        put_json(self.storage.as_ref(), &Self::key(&info.serial_number)?, info).await
    }

    pub async fn delete(&self, serial: &str) -> Result<()> {
        self.storage.delete(&Self::key(serial)?).await
    }

    pub async fn list_revoked_serials(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(REVOKED_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect())
    }

    /// Snapshot of all records. Records that land while this runs may or may
    /// not be included.
    pub async fn list_records(&self) -> Result<Vec<RevocationInfo>> {
        let mut records = Vec::new();
        for serial in self.list_revoked_serials().await? {
            match self.fetch(&serial).await {
                Ok(Some(info)) => records.push(info),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable revocation record {}: {}", serial, e),
            }
        }
        Ok(records)
    }

    /// Revokes a certificate held in the certificate store.
    pub async fn revoke_serial(&self, serial: &str, delta_wal: bool) -> Result<RevocationOutcome> {
        let serial = normalize_serial(serial)?;
        self.with_serial_lock(&serial, CertSource::Stored, delta_wal).await
    }

    /// Revokes a caller-supplied certificate. It must be signed by a known
    /// issuer.
    pub async fn revoke_certificate(&self, pem: &str, delta_wal: bool) -> Result<RevocationOutcome> {
        let der = pem_to_der(pem, CERTIFICATE_PEM_TAG)
            .map_err(|e| PkiError::InvalidRequest(e.to_string()))?;
        let details = CertDetails::from_der(&der)
            .map_err(|e| PkiError::InvalidRequest(e.to_string()))?;
        self.with_serial_lock(&details.serial, CertSource::Supplied(der), delta_wal)
            .await
    }

    async fn with_serial_lock(
        &self,
        serial: &str,
        source: CertSource,
        delta_wal: bool,
    ) -> Result<RevocationOutcome> {
        let lock = self
            .serial_locks
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock().await;
        let result = self.revoke_locked(serial, source, delta_wal).await;
        drop(guard);
        drop(lock);

        self.serial_locks
            .remove_if(serial, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn revoke_locked(
        &self,
        serial: &str,
        source: CertSource,
        delta_wal: bool,
    ) -> Result<RevocationOutcome> {
        if let Some(existing) = self.fetch(serial).await? {
            return Ok(RevocationOutcome {
                serial_number: serial.to_string(),
                revocation_time: Some(existing.revocation_time),
                newly_revoked: false,
                expired: false,
                issuer_id: existing.certificate_issuer,
                warnings: vec![],
            });
        }

        let stored = self.certs.fetch_cert(serial).await?;
        let (der, supplied) = match source {
            CertSource::Stored => {
                let der = stored.ok_or_else(|| {
                    PkiError::NotFound(format!("certificate with serial {}", serial))
                })?;
                (der, false)
            }
            CertSource::Supplied(der) => {
                if let Some(stored) = stored {
                    if stored != der {
                        return Err(PkiError::InvalidRequest(format!(
                            "supplied certificate does not match stored certificate {}",
                            serial
                        )));
                    }
                }
                (der, true)
            }
        };

        let details = CertDetails::from_der(&der)?;
        let now = Utc::now();
        if details.is_expired_at(now) {
            let warning = format!(
                "certificate {} expired at {}; revocation skipped",
                serial, details.not_after
            );
            warn!("{}", warning);
            return Ok(RevocationOutcome {
                serial_number: serial.to_string(),
                revocation_time: None,
                newly_revoked: false,
                expired: true,
                issuer_id: None,
                warnings: vec![warning],
            });
        }

        let issuer_id = self.issuers.find_signing_issuer(&der).await?;
        let mut warnings = Vec::new();
        if issuer_id.is_none() {
            if supplied {
                return Err(PkiError::InvalidRequest(format!(
                    "certificate {} was not issued by any issuer on this mount",
                    serial
                )));
            }
            let warning = format!("no issuer found for certificate {}", serial);
            warn!("{}", warning);
            warnings.push(warning);
        }

        let info = RevocationInfo {
            serial_number: serial.to_string(),
            certificate_der: der,
            revocation_time: now,
            certificate_expiry: details.not_after,
            certificate_issuer: issuer_id.clone(),
        };
        self.write(&info).await?;

        self.mark_issuer_revoked(serial, now).await?;

        if delta_wal {
            self.append_delta_wal(serial).await?;
        }

        info!(
            "Revoked certificate {} (issuer: {})",
            serial,
            issuer_id.as_deref().unwrap_or("none")
        );

        Ok(RevocationOutcome {
            serial_number: serial.to_string(),
            revocation_time: Some(now),
            newly_revoked: true,
            expired: false,
            issuer_id,
            warnings,
        })
    }

    async fn mark_issuer_revoked(&self, serial: &str, at: DateTime<Utc>) -> Result<()> {
        for mut issuer in self.issuers.list_issuers().await? {
            if issuer.serial_number == serial && !issuer.revoked {
                issuer.revoked = true;
                issuer.revocation_time = Some(at);
                self.issuers.write_issuer(&issuer).await?;
                info!("Issuer {} marked revoked", issuer.id);
            }
        }
        Ok(())
    }

    async fn append_delta_wal(&self, serial: &str) -> Result<()> {
        let marker = DeltaMarker {
            serial: serial.to_string(),
        };
        put_json(
            self.storage.as_ref(),
            &format!("{}{}", DELTA_WAL_PREFIX, serial),
            &marker,
        )
        .await?;
        put_json(self.storage.as_ref(), DELTA_LAST_REVOKED, &marker).await
    }

    /// Serials revoked since the last complete CRL build.
    pub async fn delta_wal_serials(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(DELTA_WAL_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/') && !name.starts_with(MARKER_PREFIX))
            .collect())
    }

    pub async fn last_revoked_marker(&self) -> Result<Option<DeltaMarker>> {
        get_json(self.storage.as_ref(), DELTA_LAST_REVOKED).await
    }

    pub async fn last_build_marker(&self) -> Result<Option<DeltaMarker>> {
        get_json(self.storage.as_ref(), DELTA_LAST_BUILD).await
    }

    /// Whether revocations landed since the last delta build.
    pub async fn delta_pending(&self) -> Result<bool> {
        let revoked = self.last_revoked_marker().await?;
        let built = self.last_build_marker().await?;
        Ok(revoked.is_some() && revoked != built)
    }

    pub async fn record_delta_build(&self, marker: &DeltaMarker) -> Result<()> {
        put_json(self.storage.as_ref(), DELTA_LAST_BUILD, marker).await
    }

    /// Drops the given WAL entries once a complete CRL has absorbed them.
    pub async fn clear_delta_wal(&self, serials: &[String]) -> Result<()> {
        for serial in serials {
            self.storage
                .delete(&format!("{}{}", DELTA_WAL_PREFIX, serial))
                .await?;
        }
        Ok(())
    }
}

mod der_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
