//! In-memory doubles for the shell capabilities, shared by unit and
//! integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::{
    Coordinate, Geocoder, Geolocation, GeolocationError, HttpRequest, HttpResponse, HttpResult,
    HttpTransport, MapError, MapHandle, MapProvider, Marker, MemoryKvStore, Navigator, Pagination,
    PlaceDocument, PlacesPage, PlacesSearch, ProviderLoader,
};
use crate::api::{SAVED_LOCATION_PATH, SAVE_LOCATION_PATH};
use crate::client::{ApiClient, ClientConfig};
use crate::session::Token;
use crate::LOGIN_PATH;

#[derive(Default)]
pub struct RecordingNavigator {
    redirects: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, path: &str) {
        self.redirects.lock().unwrap().push(path.to_string());
    }
}

/// What a successful refresh hands out.
enum Issuance {
    /// The same pair every time.
    Fixed {
        access: String,
        refresh: Option<String>,
    },
    /// `at-1`, `at-2`, ... and never a new refresh token.
    Rotating { issued: u32 },
}

struct BackendState {
    valid_access: Option<String>,
    valid_refresh: Option<String>,
    reject_all: bool,
    issuance: Issuance,
    login_refresh: Option<String>,
    saved_location: Option<String>,
    routes: HashMap<String, (u16, Value)>,
    requests: Vec<HttpRequest>,
}

impl BackendState {
    fn issue(&mut self) -> (String, Option<String>) {
        match &mut self.issuance {
            Issuance::Fixed { access, refresh } => (access.clone(), refresh.clone()),
            Issuance::Rotating { issued } => {
                *issued += 1;
                (format!("at-{issued}"), None)
            }
        }
    }

    fn authorizes(&self, request: &HttpRequest) -> bool {
        !self.reject_all
            && self.valid_access.is_some()
            && request.bearer_token() == self.valid_access.as_deref()
    }
}

/// Backend double: the login endpoint signs in and renews tokens, every
/// other route answers 401 unless the bearer matches the valid access token.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    refresh_calls: AtomicUsize,
    held: Mutex<HashSet<String>>,
    gate: Semaphore,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub const USER: &'static str = "user@example.com";
    pub const PASSWORD: &'static str = "abcd123!";
    pub const PROTECTED_PATH: &'static str = "/api/users/me";

    /// Accepts `fresh-at`; renewing with `rt-1` yields `fresh-at` and `rt-2`.
    pub fn new() -> Self {
        Self::with_state(
            "fresh-at",
            "rt-1",
            Issuance::Fixed {
                access: "fresh-at".into(),
                refresh: Some("rt-2".into()),
            },
        )
    }

    /// Accepts `access` and `refresh`; every renewal issues the next `at-N`
    /// and leaves the refresh token as it is.
    pub fn rotating(access: &str, refresh: &str) -> Self {
        Self::with_state(access, refresh, Issuance::Rotating { issued: 0 })
    }

    fn with_state(access: &str, refresh: &str, issuance: Issuance) -> Self {
        let mut routes = HashMap::new();
        routes.insert(Self::PROTECTED_PATH.to_string(), (200, json!({"success": true})));
        Self {
            state: Mutex::new(BackendState {
                valid_access: Some(access.into()),
                valid_refresh: Some(refresh.into()),
                reject_all: false,
                issuance,
                login_refresh: Some("rt-1".into()),
                saved_location: None,
                routes,
                requests: Vec::new(),
            }),
            refresh_calls: AtomicUsize::new(0),
            held: Mutex::default(),
            gate: Semaphore::new(0),
        }
    }

    /// `None` makes every protected route answer 401, even after a renewal.
    pub fn accept_access(&self, token: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.reject_all = token.is_none();
        if let Some(token) = token {
            state.valid_access = Some(token.to_string());
        }
    }

    /// The current access token stops working; a renewal fixes it.
    pub fn expire_access(&self) {
        self.state.lock().unwrap().valid_access = None;
    }

    pub fn revoke_refresh(&self) {
        self.state.lock().unwrap().valid_refresh = None;
    }

    /// Refresh token returned by a password sign-in. `None` leaves the field
    /// out of the response.
    pub fn login_refresh(&self, token: Option<&str>) {
        self.state.lock().unwrap().login_refresh = token.map(str::to_string);
    }

    pub fn route(&self, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), (status, body));
    }

    /// Requests to `path` block until [`FakeBackend::release`].
    pub fn hold(&self, path: &str) {
        self.held.lock().unwrap().insert(path.to_string());
    }

    pub fn release(&self) {
        self.held.lock().unwrap().clear();
        self.gate.add_permits(1024);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn saved_location(&self) -> Option<String> {
        self.state.lock().unwrap().saved_location.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.url().path() == path)
            .cloned()
            .collect()
    }

    fn login(&self, request: &HttpRequest) -> HttpResponse {
        let body = json_body(request);
        let identifier = body["identifier"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();

        if body.get("password").is_some() {
            if identifier != Self::USER || body["password"] != Self::PASSWORD {
                return HttpResponse::json_body(401, &json!({"message": "잘못된 로그인 정보"}));
            }
            let (access, _) = state.issue();
            state.valid_access = Some(access.clone());
            let mut data = json!({"accessToken": access});
            if let Some(refresh) = state.login_refresh.clone() {
                state.valid_refresh = Some(refresh.clone());
                data["refreshToken"] = json!(refresh);
            }
            return HttpResponse::json_body(200, &json!({"code": 20000, "data": data}));
        }

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if state.valid_refresh.as_deref() != Some(identifier.as_str()) {
            return HttpResponse::json_body(401, &json!({"message": "invalid refresh token"}));
        }
        let (access, refresh) = state.issue();
        state.valid_access = Some(access.clone());
        let mut data = json!({"accessToken": access});
        if let Some(refresh) = refresh {
            state.valid_refresh = Some(refresh.clone());
            data["refreshToken"] = json!(refresh);
        }
        HttpResponse::json_body(200, &json!({"code": 20000, "data": data}))
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        self.state.lock().unwrap().requests.push(request.clone());
        let path = request.url().path().to_string();
        let held = self.held.lock().unwrap().contains(&path);
        if held {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if path == LOGIN_PATH {
            return Ok(self.login(&request));
        }

        let mut state = self.state.lock().unwrap();
        let public =
            path.contains("/check-") || path.ends_with("/email-code") || path.ends_with("/signup");
        if !public && !state.authorizes(&request) {
            return Ok(HttpResponse::json_body(401, &json!({"message": "unauthorized"})));
        }
        if let Some((status, body)) = state.routes.get(&path) {
            return Ok(HttpResponse::json_body(*status, body));
        }
        let reply = match path.as_str() {
            SAVED_LOCATION_PATH => (200, json!({"location": state.saved_location})),
            SAVE_LOCATION_PATH => {
                state.saved_location = json_body(&request)["location"]
                    .as_str()
                    .map(str::to_string);
                (200, json!({"success": true, "code": 20000}))
            }
            _ => (404, json!({"message": "not found"})),
        };
        Ok(HttpResponse::json_body(reply.0, &reply.1))
    }
}

/// Parsed JSON body of a recorded request, `Null` when it had none.
pub fn json_body(request: &HttpRequest) -> Value {
    request
        .body()
        .map(|b| serde_json::from_slice(b).unwrap())
        .unwrap_or(Value::Null)
}

/// A client over `backend` with the given tokens already stored.
pub async fn signed_in_client(
    backend: &Arc<FakeBackend>,
    access: &str,
    refresh: Option<&str>,
) -> (Arc<ApiClient>, Arc<RecordingNavigator>) {
    let navigator = Arc::new(RecordingNavigator::default());
    let client = ApiClient::new(
        ClientConfig::default(),
        backend.clone(),
        Arc::new(MemoryKvStore::new()),
        navigator.clone(),
    )
    .unwrap();
    let refresh = refresh.and_then(Token::parse);
    client
        .session()
        .save(&Token::parse(access).unwrap(), refresh.as_ref())
        .await
        .unwrap();
    (Arc::new(client), navigator)
}

pub fn place(name: &str, address: &str, latitude: f64, longitude: f64) -> PlaceDocument {
    PlaceDocument {
        place_name: name.to_string(),
        address_name: address.to_string(),
        road_address_name: None,
        latitude,
        longitude,
    }
}

pub fn page(items: Vec<PlaceDocument>, current: u32, last: u32) -> PlacesPage {
    PlacesPage {
        items,
        pagination: Pagination { current, last },
    }
}

/// Map, marker, geocoder and keyword search in one object.
///
/// Keyword search answers from scripted pages first and otherwise pages
/// through the catalogue of places whose name contains the query.
pub struct FakeMap {
    pub centers: Mutex<Vec<Coordinate>>,
    pub markers: Mutex<Vec<Coordinate>>,
    catalogue: Mutex<Vec<PlaceDocument>>,
    pages: Mutex<HashMap<(String, u32), Result<PlacesPage, MapError>>>,
    searches: Mutex<Vec<(String, u32)>>,
    reverse_lookups: Mutex<Vec<Coordinate>>,
    held_queries: Mutex<HashSet<String>>,
    held_points: Mutex<Vec<Coordinate>>,
    gate: Semaphore,
    addresses: Mutex<Vec<(String, Coordinate)>>,
}

impl Default for FakeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMap {
    pub fn new() -> Self {
        Self {
            centers: Mutex::default(),
            markers: Mutex::default(),
            catalogue: Mutex::default(),
            pages: Mutex::default(),
            searches: Mutex::default(),
            reverse_lookups: Mutex::default(),
            held_queries: Mutex::default(),
            held_points: Mutex::default(),
            gate: Semaphore::new(0),
            addresses: Mutex::default(),
        }
    }

    /// Catalogue of searchable places, each also geocodable by its address.
    pub fn with_places(places: impl IntoIterator<Item = PlaceDocument>) -> Self {
        let map = Self::new();
        for place in places {
            map.add_place(place);
        }
        map
    }

    pub fn add_place(&self, place: PlaceDocument) {
        let address = place
            .road_address_name
            .clone()
            .unwrap_or_else(|| place.address_name.clone());
        if let Ok(coordinate) = Coordinate::new(place.latitude, place.longitude) {
            self.address(&address, coordinate);
        }
        self.catalogue.lock().unwrap().push(place);
    }

    pub fn page(&self, query: &str, number: u32, result: Result<PlacesPage, MapError>) {
        self.pages
            .lock()
            .unwrap()
            .insert((query.to_string(), number), result);
    }

    /// Registers a forward and reverse geocoding pair.
    pub fn address(&self, address: &str, coordinate: Coordinate) {
        self.addresses
            .lock()
            .unwrap()
            .push((address.to_string(), coordinate));
    }

    /// Searches for `query` block until [`FakeMap::release`].
    pub fn hold(&self, query: &str) {
        self.held_queries.lock().unwrap().insert(query.to_string());
    }

    /// Reverse lookups of `point` block until [`FakeMap::release`].
    pub fn hold_reverse(&self, point: Coordinate) {
        self.held_points.lock().unwrap().push(point);
    }

    pub fn release(&self) {
        self.held_queries.lock().unwrap().clear();
        self.held_points.lock().unwrap().clear();
        self.gate.add_permits(1024);
    }

    pub fn searches(&self) -> Vec<(String, u32)> {
        self.searches.lock().unwrap().clone()
    }

    pub fn reverse_lookups(&self) -> Vec<Coordinate> {
        self.reverse_lookups.lock().unwrap().clone()
    }

    pub fn provider(self: &Arc<Self>) -> MapProvider {
        MapProvider {
            map: self.clone(),
            marker: self.clone(),
            geocoder: self.clone(),
            places: self.clone(),
        }
    }

    async fn wait_for_release(&self) {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }

    fn catalogue_page(&self, query: &str, page: u32, page_size: u32) -> Result<PlacesPage, MapError> {
        let hits: Vec<PlaceDocument> = self
            .catalogue
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.place_name.contains(query))
            .cloned()
            .collect();
        if hits.is_empty() {
            return Err(MapError::NoResults);
        }
        let size = page_size.max(1) as usize;
        let last = u32::try_from(hits.len().div_ceil(size)).unwrap();
        let skip = page.saturating_sub(1) as usize * size;
        Ok(PlacesPage {
            items: hits.into_iter().skip(skip).take(size).collect(),
            pagination: Pagination {
                current: page,
                last,
            },
        })
    }
}

impl MapHandle for FakeMap {
    fn set_center(&self, center: Coordinate) {
        self.centers.lock().unwrap().push(center);
    }
}

impl Marker for FakeMap {
    fn set_position(&self, position: Coordinate) {
        self.markers.lock().unwrap().push(position);
    }
}

#[async_trait]
impl Geocoder for FakeMap {
    async fn address_to_coordinate(&self, address: &str) -> Result<Coordinate, MapError> {
        self.addresses
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, c)| *c)
            .ok_or(MapError::NoResults)
    }

    async fn coordinate_to_address(&self, coordinate: Coordinate) -> Result<String, MapError> {
        self.reverse_lookups.lock().unwrap().push(coordinate);
        let held = self.held_points.lock().unwrap().contains(&coordinate);
        if held {
            self.wait_for_release().await;
        }
        self.addresses
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| *c == coordinate)
            .map(|(a, _)| a.clone())
            .ok_or(MapError::NoResults)
    }
}

#[async_trait]
impl PlacesSearch for FakeMap {
    async fn keyword_search(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<PlacesPage, MapError> {
        self.searches.lock().unwrap().push((query.to_string(), page));
        let held = self.held_queries.lock().unwrap().contains(query);
        if held {
            self.wait_for_release().await;
        }
        let scripted = self
            .pages
            .lock()
            .unwrap()
            .get(&(query.to_string(), page))
            .cloned();
        match scripted {
            Some(result) => result,
            None => self.catalogue_page(query, page, page_size),
        }
    }
}

pub struct FakeLoader {
    map: Arc<FakeMap>,
    pub loads: AtomicUsize,
    fail: bool,
}

impl FakeLoader {
    pub fn new(map: Arc<FakeMap>) -> Self {
        Self {
            map,
            loads: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(map: Arc<FakeMap>) -> Self {
        Self {
            fail: true,
            ..Self::new(map)
        }
    }
}

#[async_trait]
impl ProviderLoader for FakeLoader {
    async fn load(&self, center: Coordinate) -> Result<MapProvider, MapError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            return Err(MapError::LoadFailed("script blocked".into()));
        }
        self.map.set_center(center);
        Ok(self.map.provider())
    }
}

pub struct FixedPosition(pub Result<Coordinate, GeolocationError>);

#[async_trait]
impl Geolocation for FixedPosition {
    async fn current_position(&self) -> Result<Coordinate, GeolocationError> {
        self.0.clone()
    }
}
