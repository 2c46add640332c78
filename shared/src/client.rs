//! Authenticated request pipeline.
//!
//! Every backend call goes through [`ApiClient::send`]. Outbound, the stored
//! access token is attached as a bearer header. Inbound, a 401 on anything
//! other than the login call triggers one token renewal shared by every
//! request that fails while it runs, after which each of them is retried
//! exactly once.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    Capabilities, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, KeyValueStore,
    KvError, Navigator, ValidatedUrl, AUTHORIZATION, MAX_TIMEOUT_MS,
};
use crate::refresh::{RefreshClaim, RefreshCoordinator, RefreshGuard};
use crate::session::{SessionStore, Token};
use crate::{
    AppError, AppResult, ErrorKind, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT_MS, LOGIN_PATH,
    LOGIN_REDIRECT_PATH,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Requests to this path never trigger a renewal.
    pub login_path: String,
    /// Where the user is sent when the session cannot be renewed.
    pub login_redirect: String,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: LOGIN_PATH.to_string(),
            login_redirect: LOGIN_REDIRECT_PATH.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> AppResult<ValidatedUrl> {
        let base = ValidatedUrl::new(self.base_url.clone()).map_err(|e| {
            AppError::new(ErrorKind::InvalidState, "invalid base URL").with_internal(e.to_string())
        })?;
        if !self.login_path.starts_with('/') || !self.login_redirect.starts_with('/') {
            return Err(AppError::new(
                ErrorKind::InvalidState,
                "login paths must be absolute",
            ));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(AppError::new(
                ErrorKind::InvalidState,
                format!("request timeout must be between 1 and {MAX_TIMEOUT_MS}ms"),
            ));
        }
        Ok(base)
    }
}

pub struct ApiClient {
    config: ClientConfig,
    base_url: ValidatedUrl,
    transport: Arc<dyn HttpTransport>,
    session: SessionStore,
    navigator: Arc<dyn Navigator>,
    refresh: RefreshCoordinator,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
    ) -> AppResult<Self> {
        let base_url = config.validate()?;
        let session = SessionStore::new(store).map_err(AppError::from)?;
        Ok(Self {
            config,
            base_url,
            transport,
            session,
            navigator,
            refresh: RefreshCoordinator::new(),
        })
    }

    pub fn from_capabilities(config: ClientConfig, caps: &Capabilities) -> AppResult<Self> {
        Self::new(
            config,
            caps.http.clone(),
            caps.kv.clone(),
            caps.navigator.clone(),
        )
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Builds a request against the configured base URL.
    pub fn request(&self, method: HttpMethod, path: &str) -> Result<HttpRequest, HttpError> {
        let url = self.base_url.join(path)?;
        HttpRequest::new(method, url).with_timeout_ms(self.config.request_timeout_ms)
    }

    #[instrument(
        skip(self, request),
        fields(
            method = request.method().as_str(),
            path = request.url().path(),
            request_id = request.request_id(),
        )
    )]
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let error = match self.dispatch(&mut request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if !self.qualifies_for_refresh(&request, &error) {
            return Err(error);
        }
        request.mark_retried();

        match self.refresh.claim() {
            RefreshClaim::Follower(waiter) => {
                debug!("refresh in flight, waiting");
                match waiter.await {
                    Ok(token) => self.dispatch_with(&mut request, Some(&token)).await,
                    Err(_) => Err(error),
                }
            }
            RefreshClaim::Leader(guard) => self.refresh_and_retry(guard, request, error).await,
        }
    }

    /// Drops the stored session and sends the user to the login screen.
    pub async fn logout(&self) -> Result<(), KvError> {
        self.session.clear_all().await?;
        self.navigator.redirect(&self.config.login_redirect);
        Ok(())
    }

    async fn refresh_and_retry(
        &self,
        guard: RefreshGuard,
        mut request: HttpRequest,
        original: HttpError,
    ) -> Result<HttpResponse, HttpError> {
        let refresh_token = match self.session.refresh_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "could not read refresh token");
                None
            }
        };

        let Some(refresh_token) = refresh_token else {
            info!("no refresh token, forcing logout");
            if let Err(e) = self.session.clear_all().await {
                warn!(error = %e, "failed to clear session storage");
            }
            self.navigator.redirect(&self.config.login_redirect);
            guard.fail();
            return Err(original);
        };

        info!("refreshing access token");
        match self.refresh(&refresh_token).await {
            Ok(pair) => {
                if let Err(e) = self
                    .session
                    .save(&pair.access_token, pair.refresh_token.as_ref())
                    .await
                {
                    warn!(error = %e, "failed to persist renewed tokens");
                }
                let released = guard.succeed(&pair.access_token);
                info!(released, "access token refreshed");
                self.dispatch_with(&mut request, Some(&pair.access_token))
                    .await
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, ending session");
                if let Err(e) = self.session.clear_tokens().await {
                    warn!(error = %e, "failed to clear tokens");
                }
                self.navigator.redirect(&self.config.login_redirect);
                guard.fail();
                Err(e)
            }
        }
    }

    fn qualifies_for_refresh(&self, request: &HttpRequest, error: &HttpError) -> bool {
        error.is_unauthorized() && !request.is_retried() && !self.is_login_request(request)
    }

    fn is_login_request(&self, request: &HttpRequest) -> bool {
        request.url().path().trim_end_matches('/') == self.config.login_path.trim_end_matches('/')
    }

    pub(crate) async fn dispatch(
        &self,
        request: &mut HttpRequest,
    ) -> Result<HttpResponse, HttpError> {
        let token = match self.session.access_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "could not read access token");
                None
            }
        };
        self.dispatch_with(request, token.as_ref()).await
    }

    async fn dispatch_with(
        &self,
        request: &mut HttpRequest,
        token: Option<&Token>,
    ) -> Result<HttpResponse, HttpError> {
        match token {
            Some(token) => {
                request
                    .headers_mut()
                    .insert(AUTHORIZATION, token.bearer_header())?;
            }
            None => {
                request.headers_mut().remove(AUTHORIZATION);
            }
        }
        let response = self.transport.execute(request.clone()).await?;
        debug!(status = response.status(), "response received");
        response.error_for_status()
    }
}
