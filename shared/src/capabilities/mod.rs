//! Shell-provided side effects.
//!
//! Each capability is a trait object the host application hands to the core:
//! an HTTP transport, a persistent key-value store, the map SDK, the device
//! position, and page navigation. Nothing in the core reaches a platform API
//! except through these seams.

mod http;
mod kv;

pub mod geolocation;
pub mod map;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::sync::Arc;

pub use self::geolocation::{current_position_within, Geolocation, GeolocationError};
pub use self::http::{
    ContentType, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult,
    HttpTransport, ValidatedUrl, AUTHORIZATION, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
pub use self::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, KvResult, MemoryKvStore};
pub use self::map::{
    Coordinate, Geocoder, MapError, MapHandle, MapProvider, Marker, Pagination, PlaceDocument,
    PlacesPage, PlacesSearch, ProviderLoader,
};

#[cfg(feature = "native-http")]
pub use self::http::ReqwestTransport;

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;

/// Moves the user to another screen.
pub trait Navigator: Send + Sync {
    fn redirect(&self, path: &str);
}

/// Everything the host supplies at startup.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub kv: Arc<dyn KeyValueStore>,
    pub navigator: Arc<dyn Navigator>,
    pub map_loader: Arc<dyn ProviderLoader>,
    /// `None` when the platform has no position API.
    pub geolocation: Option<Arc<dyn Geolocation>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("geolocation", &self.geolocation.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeBackend, FakeLoader, FakeMap, RecordingNavigator};
    use super::*;
    use crate::{ApiClient, ClientConfig, LocationController, SearchConfig};

    #[test]
    fn one_bundle_wires_client_and_controller() {
        let caps = Capabilities {
            http: Arc::new(FakeBackend::new()),
            kv: Arc::new(MemoryKvStore::new()),
            navigator: Arc::new(RecordingNavigator::default()),
            map_loader: Arc::new(FakeLoader::new(Arc::new(FakeMap::new()))),
            geolocation: None,
        };
        assert!(format!("{caps:?}").contains("geolocation: false"));

        let client = Arc::new(ApiClient::from_capabilities(ClientConfig::default(), &caps).unwrap());
        let controller =
            LocationController::from_capabilities(client, &caps, SearchConfig::default()).unwrap();
        assert!(!controller.view().map_ready);
    }
}
