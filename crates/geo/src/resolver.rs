use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use deskrail_core::{Address, GeoPoint};

use crate::cache::QueryCache;
use crate::provider::{GeocodeHit, GeocodeProvider};
use crate::GeoError;

/// Whether an address resolved through a provider or fell through the
/// whole cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Resolved,
    Unknown,
}

/// Outcome of the cascade for one address.
///
/// `point` always holds coordinates (the configured last resort when the
/// cascade exhausted), but `Unknown` locations are not routable: the geo
/// filter must treat the ticket as coordinate-less.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub point: GeoPoint,
    pub status: AddressStatus,
    pub provider: Option<String>,
    pub matched_query: Option<String>,
}

impl ResolvedLocation {
    /// Coordinates usable for routing decisions, if any.
    pub fn routable_point(&self) -> Option<GeoPoint> {
        match self.status {
            AddressStatus::Resolved => Some(self.point),
            AddressStatus::Unknown => None,
        }
    }
}

/// Runs the provider cascade over an address:
/// full address → city → country capital → country → last resort.
/// The first non-null provider answer wins and is cached.
pub struct GeocodeResolver {
    provider: Arc<dyn GeocodeProvider>,
    cache: QueryCache,
    last_resort: GeoPoint,
}

impl GeocodeResolver {
    pub fn new(provider: Arc<dyn GeocodeProvider>, last_resort: GeoPoint) -> Self {
        Self {
            provider,
            cache: QueryCache::new(),
            last_resort,
        }
    }

    /// Build the cascade queries for an address. Steps whose fragments are
    /// missing are skipped; consecutive duplicates are folded.
    fn cascade_queries(address: &Address) -> Vec<String> {
        let mut queries: Vec<String> = Vec::new();

        let full: Vec<&str> = [
            address.country.as_deref(),
            address.region.as_deref(),
            address.city.as_deref(),
            address.street.as_deref(),
            address.house.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if full.len() > 1 {
            queries.push(full.join(", "));
        }

        if let Some(city) = &address.city {
            match &address.country {
                Some(country) => queries.push(format!("{city}, {country}")),
                None => queries.push(city.clone()),
            }
        }

        if let Some(country) = &address.country {
            queries.push(format!("capital of {country}"));
            queries.push(country.clone());
        }

        queries.dedup_by(|a, b| QueryCache::normalize(a) == QueryCache::normalize(b));
        queries
    }

    /// Resolve an address to coordinates via the cascade.
    ///
    /// Provider errors propagate (the stage runner owns retries); a cascade
    /// where every step answers "no match" resolves as `Unknown`.
    pub async fn resolve(&self, address: &Address) -> Result<ResolvedLocation, GeoError> {
        for query in Self::cascade_queries(address) {
            let hit = match self.cache.get(&query) {
                Some(cached) => cached,
                None => {
                    let fresh = self.provider.geocode(&query).await?;
                    self.cache.put(&query, fresh.clone());
                    fresh
                }
            };

            if let Some(hit) = hit {
                debug!(query = %query, provider = %hit.provider, "address resolved");
                return Ok(ResolvedLocation {
                    point: hit.point,
                    status: AddressStatus::Resolved,
                    provider: Some(hit.provider),
                    matched_query: Some(query),
                });
            }
        }

        info!(?address, "geocode cascade exhausted, using last resort");
        Ok(ResolvedLocation {
            point: self.last_resort,
            status: AddressStatus::Unknown,
            provider: None,
            matched_query: None,
        })
    }

    /// Direct lookup used outside the cascade (memoized like cascade steps).
    pub async fn lookup(&self, query: &str) -> Result<Option<GeocodeHit>, GeoError> {
        if let Some(cached) = self.cache.get(query) {
            return Ok(cached);
        }
        let fresh = self.provider.geocode(query).await?;
        self.cache.put(query, fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    const LAST_RESORT: GeoPoint = GeoPoint {
        lat: 51.1605,
        lon: 71.4704,
    };

    /// Provider answering from a fixed table, counting calls.
    struct TableProvider {
        answers: HashMap<String, GeoPoint>,
        calls: AtomicU32,
    }

    impl TableProvider {
        fn new(answers: &[(&str, GeoPoint)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(q, p)| (q.to_string(), *p))
                    .collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GeocodeProvider for TableProvider {
        async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.get(query).map(|p| GeocodeHit {
                point: *p,
                provider: "table".into(),
            }))
        }

        fn name(&self) -> &str {
            "table"
        }
    }

    fn address(country: Option<&str>, city: Option<&str>, street: Option<&str>) -> Address {
        Address {
            country: country.map(String::from),
            region: None,
            city: city.map(String::from),
            street: street.map(String::from),
            house: None,
        }
    }

    #[tokio::test]
    async fn full_address_wins_first() {
        let point = GeoPoint { lat: 43.0, lon: 76.0 };
        let provider = Arc::new(TableProvider::new(&[(
            "Kazakhstan, Almaty, Abay Ave",
            point,
        )]));
        let resolver = GeocodeResolver::new(provider.clone(), LAST_RESORT);

        let resolved = resolver
            .resolve(&address(Some("Kazakhstan"), Some("Almaty"), Some("Abay Ave")))
            .await
            .unwrap();

        assert_eq!(resolved.status, AddressStatus::Resolved);
        assert_eq!(resolved.point, point);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_through_to_city() {
        let point = GeoPoint { lat: 43.2, lon: 76.9 };
        let provider = Arc::new(TableProvider::new(&[("Almaty, Kazakhstan", point)]));
        let resolver = GeocodeResolver::new(provider.clone(), LAST_RESORT);

        let resolved = resolver
            .resolve(&address(Some("Kazakhstan"), Some("Almaty"), Some("no such street")))
            .await
            .unwrap();

        assert_eq!(resolved.status, AddressStatus::Resolved);
        assert_eq!(resolved.point, point);
        assert_eq!(resolved.matched_query.as_deref(), Some("Almaty, Kazakhstan"));
        // full address missed, city hit
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_cascade_is_unknown_with_last_resort_point() {
        let provider = Arc::new(TableProvider::new(&[]));
        let resolver = GeocodeResolver::new(provider, LAST_RESORT);

        let resolved = resolver
            .resolve(&address(Some("Atlantis"), Some("Deep City"), None))
            .await
            .unwrap();

        assert_eq!(resolved.status, AddressStatus::Unknown);
        assert_eq!(resolved.point, LAST_RESORT);
        assert_eq!(resolved.routable_point(), None);
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let point = GeoPoint { lat: 43.2, lon: 76.9 };
        let provider = Arc::new(TableProvider::new(&[("Almaty", point)]));
        let resolver = GeocodeResolver::new(provider.clone(), LAST_RESORT);

        let addr = address(None, Some("Almaty"), None);
        resolver.resolve(&addr).await.unwrap();
        resolver.resolve(&addr).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_steps_are_cached_within_batch() {
        let provider = Arc::new(TableProvider::new(&[]));
        let resolver = GeocodeResolver::new(provider.clone(), LAST_RESORT);

        let addr = address(Some("Atlantis"), None, None);
        resolver.resolve(&addr).await.unwrap();
        let first_round = provider.calls.load(Ordering::SeqCst);
        resolver.resolve(&addr).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), first_round);
    }

    #[test]
    fn cascade_skips_missing_fragments() {
        let queries = GeocodeResolver::cascade_queries(&address(None, Some("Almaty"), None));
        assert_eq!(queries, vec!["Almaty".to_string()]);

        let queries =
            GeocodeResolver::cascade_queries(&address(Some("Kazakhstan"), None, None));
        assert_eq!(
            queries,
            vec!["capital of Kazakhstan".to_string(), "Kazakhstan".to_string()]
        );
    }
}
