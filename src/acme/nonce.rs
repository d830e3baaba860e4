use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

const NONCE_BYTES: usize = 21;
/// Watermark value meaning "no live nonces".
const NO_WATERMARK: i64 = 0;

/// Anti-replay nonces. Each nonce maps to its expiry in unix milliseconds.
///
/// `next_expiry` holds the earliest expiry among live nonces so that the
/// sweep only scans the table when at least one nonce can have expired.
pub struct NonceManager {
    nonces: DashMap<String, i64>,
    next_expiry: AtomicI64,
    lifetime: Duration,
}

impl NonceManager {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            nonces: DashMap::new(),
            next_expiry: AtomicI64::new(NO_WATERMARK),
            lifetime,
        }
    }

    pub fn get_nonce(&self) -> (String, DateTime<Utc>) {
        self.get_nonce_at(Utc::now())
    }

    pub fn get_nonce_at(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        self.maybe_tidy_at(now);

        let mut raw = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut raw);
        let nonce = URL_SAFE_NO_PAD.encode(raw);

        let lifetime_ms = i64::try_from(self.lifetime.as_millis()).unwrap_or(i64::MAX);
        let expiry_ms = now.timestamp_millis().saturating_add(lifetime_ms);
        self.nonces.insert(nonce.clone(), expiry_ms);
        self.lower_watermark(expiry_ms, now.timestamp_millis());

        (nonce, millis_to_utc(expiry_ms))
    }

    fn lower_watermark(&self, expiry_ms: i64, now_ms: i64) {
        let _ = self
            .next_expiry
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == NO_WATERMARK || current < now_ms || expiry_ms < current {
                    Some(expiry_ms)
                } else {
                    None
                }
            });
    }

    /// One-shot: the entry is removed whether or not it was still valid.
    pub fn redeem(&self, nonce: &str) -> bool {
        self.redeem_at(nonce, Utc::now())
    }

    pub fn redeem_at(&self, nonce: &str, now: DateTime<Utc>) -> bool {
        match self.nonces.remove(nonce) {
            Some((_, expiry_ms)) => now.timestamp_millis() <= expiry_ms,
            None => false,
        }
    }

    /// Sweeps when the watermark says something may have expired.
    pub fn maybe_tidy_at(&self, now: DateTime<Utc>) -> Option<usize> {
        let watermark = self.next_expiry.load(Ordering::Acquire);
        if watermark == NO_WATERMARK || now.timestamp_millis() <= watermark {
            return None;
        }
        Some(self.tidy_at(now))
    }

    pub fn tidy(&self) -> usize {
        self.tidy_at(Utc::now())
    }

    /// Removes every expired nonce and recomputes the watermark.
    pub fn tidy_at(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis();
        let before = self.nonces.len();
        self.nonces.retain(|_, expiry_ms| *expiry_ms >= now_ms);
        let removed = before.saturating_sub(self.nonces.len());

        let earliest = self
            .nonces
            .iter()
            .map(|entry| *entry.value())
            .min()
            .unwrap_or(NO_WATERMARK);
        self.next_expiry.store(earliest, Ordering::Release);

        if removed > 0 {
            debug!("Swept {} expired ACME nonces", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn manager() -> NonceManager {
        NonceManager::new(Duration::from_secs(15 * 60))
    }

    #[test]
    fn test_nonce_shape() {
        let (nonce, expiry) = manager().get_nonce();
        assert_eq!(nonce.len(), 28);
        assert!(URL_SAFE_NO_PAD.decode(&nonce).is_ok());
        assert!(expiry > Utc::now() + chrono::Duration::minutes(14));
    }

    #[test]
    fn test_redeem_is_one_shot() {
        let nonces = manager();
        let (nonce, _) = nonces.get_nonce();
        assert!(nonces.redeem(&nonce));
        assert!(!nonces.redeem(&nonce));
        assert!(!nonces.redeem("never-issued"));
    }

    #[test]
    fn test_expired_nonce_is_rejected_before_sweep() {
        let nonces = manager();
        let now = Utc::now();
        let (nonce, _) = nonces.get_nonce_at(now);
        assert!(!nonces.redeem_at(&nonce, now + chrono::Duration::minutes(16)));
        assert!(nonces.is_empty());
    }

    #[test]
    fn test_watermark_gates_sweep() {
        let nonces = manager();
        let now = Utc::now();
        nonces.get_nonce_at(now);
        nonces.get_nonce_at(now + chrono::Duration::minutes(10));

        assert_eq!(nonces.maybe_tidy_at(now + chrono::Duration::minutes(5)), None);
        assert_eq!(nonces.maybe_tidy_at(now + chrono::Duration::minutes(16)), Some(1));
        assert_eq!(nonces.len(), 1);
        assert_eq!(nonces.maybe_tidy_at(now + chrono::Duration::minutes(20)), None);
        assert_eq!(nonces.maybe_tidy_at(now + chrono::Duration::minutes(26)), Some(1));
        assert!(nonces.is_empty());
        assert_eq!(nonces.next_expiry.load(Ordering::Acquire), NO_WATERMARK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_succeeds_once() {
        let nonces = Arc::new(manager());
        let (nonce, _) = nonces.get_nonce();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let nonces = nonces.clone();
            let nonce = nonce.clone();
            handles.push(tokio::spawn(async move { nonces.redeem(&nonce) }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_nonces_are_unique() {
        let nonces = manager();
        let issued: HashSet<String> = (0..500).map(|_| nonces.get_nonce().0).collect();
        assert_eq!(issued.len(), 500);
    }
}
