//! Address resolution: geocoder port, provider cascade, query cache, and
//! great-circle distance.

pub mod cache;
pub mod distance;
pub mod provider;
pub mod resolver;

pub use cache::QueryCache;
pub use distance::haversine_km;
pub use provider::{GeocodeHit, GeocodeProvider, HttpGeocodeProvider};
pub use resolver::{AddressStatus, GeocodeResolver, ResolvedLocation};

use deskrail_core::StageError;

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl From<GeoError> for StageError {
    fn from(err: GeoError) -> Self {
        match err {
            GeoError::Http(e) => StageError::transient(format!("geocoder: {e}")),
            GeoError::Api { status, body } => StageError::from_http_status(status, body),
            // A malformed provider payload usually clears up on retry; the
            // runner's budget turns persistent ones into failed outcomes.
            GeoError::Parse(msg) => StageError::transient(format!("geocoder: {msg}")),
        }
    }
}
