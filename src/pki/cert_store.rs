use crate::error::Result;
use crate::pki::certutil::CertDetails;
use crate::pki::serial::normalize_serial;
use crate::storage::Storage;
use bytes::Bytes;
use std::sync::Arc;

const CERT_PREFIX: &str = "certs/";

/// Issued certificates keyed by hyphenated serial, stored as raw DER.
#[derive(Clone)]
pub struct CertStore {
    storage: Arc<dyn Storage>,
}

impl CertStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(serial: &str) -> Result<String> {
        Ok(format!("{}{}", CERT_PREFIX, normalize_serial(serial)?))
    }

    pub async fn store_cert(&self, der: &[u8]) -> Result<CertDetails> {
        let details = CertDetails::from_der(der)?;
        self.storage
            .put(&Self::key(&details.serial)?, Bytes::copy_from_slice(der))
            .await?;
        Ok(details)
    }

    pub async fn fetch_cert(&self, serial: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.get(&Self::key(serial)?).await?.map(|b| b.to_vec()))
    }

    pub async fn list_cert_serials(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(CERT_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect())
    }

    pub async fn delete_cert(&self, serial: &str) -> Result<()> {
        self.storage.delete(&Self::key(serial)?).await
    }
}
