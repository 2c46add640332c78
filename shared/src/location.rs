//! Location picker: incremental place search and selection.
//!
//! A committed query starts a search session. Pages are fetched one at a
//! time, the next one when the shell reports that the end of the list is
//! visible. The user picks a point from a result, by tapping or dragging on
//! the map, or from the device position, and may save it to their profile.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::api::SaveLocationRequest;
use crate::capabilities::{
    current_position_within, Capabilities, Coordinate, Geolocation, MapError, MapProvider,
    PlaceDocument, ProviderLoader,
};
use crate::client::ApiClient;
use crate::{
    AppError, AppResult, ErrorKind, Notice, DEFAULT_CENTER, GEOLOCATION_TIMEOUT, SEARCH_PAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub page_size: u32,
    pub default_center: (f64, f64),
    pub geolocation_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: SEARCH_PAGE_SIZE,
            default_center: DEFAULT_CENTER,
            geolocation_timeout: GEOLOCATION_TIMEOUT,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> AppResult<Coordinate> {
        if self.page_size == 0 || self.page_size > 45 {
            return Err(AppError::new(
                ErrorKind::InvalidState,
                "page size must be between 1 and 45",
            ));
        }
        if self.geolocation_timeout.is_zero() {
            return Err(AppError::new(
                ErrorKind::InvalidState,
                "geolocation timeout cannot be zero",
            ));
        }
        let (lat, lng) = self.default_center;
        Ok(Coordinate::new(lat, lng)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchItem {
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<PlaceDocument> for SearchItem {
    fn from(doc: PlaceDocument) -> Self {
        let address = doc
            .road_address_name
            .filter(|road| !road.trim().is_empty())
            .unwrap_or(doc.address_name);
        Self {
            name: doc.place_name,
            address,
            latitude: doc.latitude,
            longitude: doc.longitude,
        }
    }
}

impl SearchItem {
    pub fn coordinate(&self) -> Result<Coordinate, MapError> {
        Coordinate::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub latitude: f64,
    pub longitude: f64,
    /// Empty while the reverse lookup is pending or after it failed.
    pub address: String,
}

impl Selection {
    pub fn is_saveable(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

/// Distance choices offered next to the saved location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "u32")]
pub enum SearchRadius {
    M100,
    M300,
    #[default]
    M500,
    Km1,
    Km2,
    Km3,
}

impl SearchRadius {
    pub const ALL: [Self; 6] = [
        Self::M100,
        Self::M300,
        Self::M500,
        Self::Km1,
        Self::Km2,
        Self::Km3,
    ];

    pub fn meters(self) -> u32 {
        match self {
            Self::M100 => 100,
            Self::M300 => 300,
            Self::M500 => 500,
            Self::Km1 => 1000,
            Self::Km2 => 2000,
            Self::Km3 => 3000,
        }
    }

    pub fn from_meters(meters: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.meters() == meters)
    }

    pub fn label(self) -> String {
        match self.meters() {
            m if m >= 1000 => format!("{}km", m / 1000),
            m => format!("{m}m"),
        }
    }
}

impl From<SearchRadius> for u32 {
    fn from(radius: SearchRadius) -> Self {
        radius.meters()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchPhase {
    #[default]
    Idle,
    Searching,
    Listing,
    FetchingMore,
    Selected,
}

#[derive(Debug, Clone, Default)]
pub struct LocationModel {
    pub query: String,
    pub page: u32,
    pub has_next: bool,
    pub is_loading: bool,
    pub results: Vec<SearchItem>,
    pub selection: Option<Selection>,
    pub saved_location: Option<String>,
    pub radius: SearchRadius,
    pub notice: Option<Notice>,
    pub phase: SearchPhase,
    generation: u64,
    position_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationView {
    pub query: String,
    pub phase: SearchPhase,
    pub results: Vec<SearchItem>,
    pub has_next: bool,
    pub is_loading: bool,
    pub selection: Option<Selection>,
    pub can_save: bool,
    pub saved_location: Option<String>,
    /// Meters.
    pub radius: SearchRadius,
    pub notice: Option<Notice>,
    pub map_ready: bool,
}

struct FetchTicket {
    query: String,
    page: u32,
    generation: u64,
}

pub struct LocationController {
    client: Arc<ApiClient>,
    loader: Arc<dyn ProviderLoader>,
    geolocation: Option<Arc<dyn Geolocation>>,
    config: SearchConfig,
    center: Coordinate,
    provider: OnceCell<MapProvider>,
    model: Mutex<LocationModel>,
}

impl std::fmt::Debug for LocationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationController")
            .field("config", &self.config)
            .field("map_ready", &self.provider.initialized())
            .finish_non_exhaustive()
    }
}

impl LocationController {
    pub fn new(
        client: Arc<ApiClient>,
        loader: Arc<dyn ProviderLoader>,
        geolocation: Option<Arc<dyn Geolocation>>,
        config: SearchConfig,
    ) -> AppResult<Self> {
        let center = config.validate()?;
        Ok(Self {
            client,
            loader,
            geolocation,
            config,
            center,
            provider: OnceCell::new(),
            model: Mutex::new(LocationModel::default()),
        })
    }

    pub fn from_capabilities(
        client: Arc<ApiClient>,
        caps: &Capabilities,
        config: SearchConfig,
    ) -> AppResult<Self> {
        Self::new(
            client,
            caps.map_loader.clone(),
            caps.geolocation.clone(),
            config,
        )
    }

    /// Loads the map provider, centres it on the default position and shows
    /// the previously saved location. Only a provider failure is an error.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AppResult<()> {
        let provider = match self.load_provider().await {
            Ok(provider) => provider,
            Err(e) => {
                warn!(error = %e, "map provider failed to load");
                let err = AppError::from(e);
                self.notify(Notice::error(err.user_facing_message()));
                return Err(err);
            }
        };
        provider.map.set_center(self.center);
        provider.marker.set_position(self.center);

        match self.client.saved_location().await {
            Ok(saved) => self.model().saved_location = saved,
            Err(e) => warn!(error = %e, "could not fetch saved location"),
        }
        Ok(())
    }

    /// Moves map and marker to `coordinate`, makes it the selection and
    /// resolves its address. A failed lookup leaves the address empty.
    pub async fn apply_position(&self, coordinate: Coordinate) -> AppResult<()> {
        let provider = self.ready_provider().ok_or(MapError::NotLoaded)?;
        provider.map.set_center(coordinate);
        provider.marker.set_position(coordinate);

        let seq = {
            let mut model = self.model();
            model.position_seq += 1;
            model.selection = Some(Selection {
                latitude: coordinate.latitude(),
                longitude: coordinate.longitude(),
                address: String::new(),
            });
            model.position_seq
        };

        let address = provider.geocoder.coordinate_to_address(coordinate).await;

        let mut model = self.model();
        if model.position_seq != seq {
            debug!("discarding address for superseded position");
            return Ok(());
        }
        match address {
            Ok(address) => {
                if let Some(selection) = model.selection.as_mut() {
                    selection.address = address;
                }
            }
            Err(e) => debug!(error = %e, "reverse geocoding failed"),
        }
        Ok(())
    }

    /// A tap on the map or the end of a marker drag.
    pub async fn pick_on_map(&self, latitude: f64, longitude: f64) -> AppResult<()> {
        self.apply_position(Coordinate::new(latitude, longitude)?).await
    }

    /// Commits `text` as a new query and fetches its first page. Ignored
    /// when the text is blank or the map has not loaded.
    #[instrument(skip(self))]
    pub async fn search_address(&self, text: &str) -> AppResult<()> {
        let query = text.trim();
        if query.is_empty() || self.ready_provider().is_none() {
            return Ok(());
        }
        {
            let mut model = self.model();
            model.generation += 1;
            model.query = query.to_string();
            model.results.clear();
            model.page = 0;
            model.has_next = false;
            model.is_loading = false;
            model.phase = SearchPhase::Searching;
        }
        self.fetch_page(query, 1).await.map(|_| ())
    }

    /// Fetches page `page` of `query` into the current session. Returns
    /// `false` without fetching when the map is not ready or a fetch is
    /// already running.
    pub async fn fetch_page(&self, query: &str, page: u32) -> AppResult<bool> {
        let Some(provider) = self.ready_provider() else {
            return Ok(false);
        };
        let ticket = {
            let mut model = self.model();
            if model.is_loading {
                return Ok(false);
            }
            model.is_loading = true;
            FetchTicket {
                query: query.to_string(),
                page,
                generation: model.generation,
            }
        };
        self.run_fetch(&provider, ticket).await;
        Ok(true)
    }

    /// Called when the end of the result list scrolls into view.
    pub async fn on_sentinel_visible(&self) -> AppResult<bool> {
        let Some(provider) = self.ready_provider() else {
            return Ok(false);
        };
        let ticket = {
            let mut model = self.model();
            if model.is_loading || !model.has_next || model.query.is_empty() {
                return Ok(false);
            }
            model.is_loading = true;
            model.phase = SearchPhase::FetchingMore;
            FetchTicket {
                query: model.query.clone(),
                page: model.page + 1,
                generation: model.generation,
            }
        };
        self.run_fetch(&provider, ticket).await;
        Ok(true)
    }

    /// Ends the search session and selects `item`.
    pub async fn select_result(&self, item: &SearchItem) -> AppResult<()> {
        let coordinate = item.coordinate()?;
        {
            let mut model = self.model();
            model.generation += 1;
            model.results.clear();
            model.has_next = false;
            model.is_loading = false;
            model.phase = SearchPhase::Selected;
        }
        self.apply_position(coordinate).await
    }

    /// Geocodes a typed address and selects it.
    pub async fn locate_address(&self, text: &str) -> AppResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let provider = self.ready_provider().ok_or(MapError::NotLoaded)?;
        match provider.geocoder.address_to_coordinate(text).await {
            Ok(coordinate) => self.apply_position(coordinate).await,
            Err(e) => {
                debug!(error = %e, "address lookup failed");
                self.notify(Notice::error("주소를 찾을 수 없습니다."));
                Err(AppError::new(ErrorKind::NotFound, "주소를 찾을 수 없습니다."))
            }
        }
    }

    pub async fn find_my_location(&self) -> AppResult<()> {
        let Some(geolocation) = self.geolocation.clone() else {
            let err = AppError::from(crate::capabilities::GeolocationError::Unsupported);
            self.notify(Notice::error(err.user_facing_message()));
            return Err(err);
        };
        match current_position_within(geolocation.as_ref(), self.config.geolocation_timeout).await
        {
            Ok(coordinate) => self.apply_position(coordinate).await,
            Err(e) => {
                warn!(error = %e, "device position unavailable");
                let err = AppError::from(e);
                self.notify(Notice::error(err.user_facing_message()));
                Err(err)
            }
        }
    }

    /// Persists the current selection. Fails without a network call unless
    /// both a coordinate and an address are selected.
    #[instrument(skip(self))]
    pub async fn save_selection(&self) -> AppResult<()> {
        let selection = self.model().selection.clone();
        let Some(selection) = selection.filter(Selection::is_saveable) else {
            let message = "위치를 먼저 선택해주세요.";
            self.notify(Notice::error(message));
            return Err(AppError::new(ErrorKind::Validation, message));
        };

        let body = SaveLocationRequest {
            latitude: selection.latitude,
            longitude: selection.longitude,
            location: selection.address.clone(),
        };
        match self.client.save_location(&body).await {
            Ok(()) => {
                info!("location saved");
                let mut model = self.model();
                model.saved_location = Some(selection.address);
                model.notice = Some(Notice::info("위치가 저장되었습니다."));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "saving location failed");
                self.notify(Notice::error("위치 저장에 실패했습니다."));
                Err(e)
            }
        }
    }

    /// Accepts only the offered distances; anything else leaves the
    /// current choice in place.
    pub fn set_radius(&self, meters: u32) -> AppResult<SearchRadius> {
        let radius = SearchRadius::from_meters(meters).ok_or_else(|| {
            AppError::new(
                ErrorKind::Validation,
                format!("unsupported search radius: {meters}m"),
            )
        })?;
        self.model().radius = radius;
        Ok(radius)
    }

    pub fn take_notice(&self) -> Option<Notice> {
        self.model().notice.take()
    }

    pub fn snapshot(&self) -> LocationModel {
        self.model().clone()
    }

    pub fn view(&self) -> LocationView {
        let model = self.model();
        LocationView {
            query: model.query.clone(),
            phase: model.phase,
            results: model.results.clone(),
            has_next: model.has_next,
            is_loading: model.is_loading,
            selection: model.selection.clone(),
            can_save: model.selection.as_ref().is_some_and(Selection::is_saveable),
            saved_location: model.saved_location.clone(),
            radius: model.radius,
            notice: model.notice.clone(),
            map_ready: self.provider.initialized(),
        }
    }

    async fn run_fetch(&self, provider: &MapProvider, ticket: FetchTicket) {
        let result = provider
            .places
            .keyword_search(&ticket.query, ticket.page, self.config.page_size)
            .await;

        let first_hit = {
            let mut model = self.model();
            if model.generation != ticket.generation {
                debug!(query = %ticket.query, page = ticket.page, "discarding stale page");
                return;
            }
            model.is_loading = false;
            model.phase = SearchPhase::Listing;
            match result {
                Ok(page) if !page.items.is_empty() => {
                    let has_next = page.pagination.has_next();
                    let items: Vec<SearchItem> =
                        page.items.into_iter().map(SearchItem::from).collect();
                    let first = (ticket.page == 1)
                        .then(|| items.first().and_then(|i| i.coordinate().ok()))
                        .flatten();
                    model.results.extend(items);
                    model.page = ticket.page;
                    model.has_next = has_next;
                    first
                }
                Ok(_) | Err(MapError::NoResults) => {
                    model.has_next = false;
                    None
                }
                Err(e) => {
                    warn!(error = %e, query = %ticket.query, "place search failed");
                    model.has_next = false;
                    None
                }
            }
        };

        if let Some(center) = first_hit {
            provider.map.set_center(center);
        }
    }

    async fn load_provider(&self) -> Result<MapProvider, MapError> {
        self.provider
            .get_or_try_init(|| self.loader.load(self.center))
            .await
            .cloned()
    }

    fn ready_provider(&self) -> Option<MapProvider> {
        self.provider.get().cloned()
    }

    fn notify(&self, notice: Notice) {
        self.model().notice = Some(notice);
    }

    fn model(&self) -> MutexGuard<'_, LocationModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
