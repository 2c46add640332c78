//! Map/search provider boundary.
//!
//! The shell wraps its map SDK (callback based on the web) behind these
//! traits: every geocode or search call is one pending operation that
//! resolves to exactly one result or failure. The core never touches the
//! SDK objects directly, so tests can substitute an in-memory provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, MapError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(MapError::InvalidCoordinate {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A raw hit from the provider's keyword search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceDocument {
    pub place_name: String,
    pub address_name: String,
    #[serde(default)]
    pub road_address_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current: u32,
    pub last: u32,
}

impl Pagination {
    pub fn has_next(&self) -> bool {
        self.current < self.last
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacesPage {
    pub items: Vec<PlaceDocument>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MapError {
    #[error("map provider is not loaded")]
    NotLoaded,

    #[error("failed to load map provider: {0}")]
    LoadFailed(String),

    #[error("no results")]
    NoResults,

    #[error("provider error ({status}): {message}")]
    Provider { status: String, message: String },

    #[error("invalid coordinate: lat={latitude}, lng={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}

pub trait MapHandle: Send + Sync {
    fn set_center(&self, center: Coordinate);
}

pub trait Marker: Send + Sync {
    fn set_position(&self, position: Coordinate);
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn address_to_coordinate(&self, address: &str) -> Result<Coordinate, MapError>;
    async fn coordinate_to_address(&self, coordinate: Coordinate) -> Result<String, MapError>;
}

#[async_trait]
pub trait PlacesSearch: Send + Sync {
    async fn keyword_search(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<PlacesPage, MapError>;
}

/// Handles owned by one location screen once the SDK has loaded.
#[derive(Clone)]
pub struct MapProvider {
    pub map: Arc<dyn MapHandle>,
    pub marker: Arc<dyn Marker>,
    pub geocoder: Arc<dyn Geocoder>,
    pub places: Arc<dyn PlacesSearch>,
}

impl std::fmt::Debug for MapProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapProvider").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProviderLoader: Send + Sync {
    /// Loads the SDK and creates a map centred on `center`.
    async fn load(&self, center: Coordinate) -> Result<MapProvider, MapError>;
}
