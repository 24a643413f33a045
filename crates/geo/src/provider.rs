use async_trait::async_trait;
use tracing::debug;

use deskrail_core::GeoPoint;

use crate::GeoError;

/// A successful geocode lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub point: GeoPoint,
    /// Which provider produced the hit (for audit/debug payloads).
    pub provider: String,
}

/// Port for geocoding vendors. `Ok(None)` means the vendor answered but has
/// no match for the query; errors are vendor/transport failures.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>, GeoError>;

    /// Provider name used in hits and logs.
    fn name(&self) -> &str;
}

/// HTTP geocoding client.
///
/// Expects a JSON body of the shape `{"results": [{"lat": .., "lon": ..}]}`;
/// an empty `results` array is a miss, not an error.
pub struct HttpGeocodeProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGeocodeProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl GeocodeProvider for HttpGeocodeProvider {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>, GeoError> {
        let url = format!("{}/v1/geocode", self.base_url);

        debug!(query = %query, "geocode request");

        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(GeoError::Api { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        let results = resp["results"]
            .as_array()
            .ok_or_else(|| GeoError::Parse("missing results array".into()))?;

        let Some(first) = results.first() else {
            return Ok(None);
        };

        let lat = first["lat"]
            .as_f64()
            .ok_or_else(|| GeoError::Parse("missing results[0].lat".into()))?;
        let lon = first["lon"]
            .as_f64()
            .ok_or_else(|| GeoError::Parse("missing results[0].lon".into()))?;

        Ok(Some(GeocodeHit {
            point: GeoPoint { lat, lon },
            provider: self.name().to_string(),
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}
