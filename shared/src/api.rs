//! Typed backend endpoints.
//!
//! Wire shapes are camelCase JSON. Most responses use the envelope
//! `{code, success, message, data}`; callers decide which of `code` or
//! `success` signals acceptance, since the backend is not consistent about it.

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capabilities::{HttpError, HttpMethod, HttpResponse};
use crate::client::ApiClient;
use crate::session::{Credentials, Token};
use crate::{AppError, AppResult, ErrorKind, LOGIN_PATH, SUCCESS_CODE};

pub const SAVED_LOCATION_PATH: &str = "/api/users/saved-location";
pub const SAVE_LOCATION_PATH: &str = "/api/users/locations";
pub const EMAIL_CODE_PATH: &str = "/api/users/email-code";
pub const CHECK_EMAIL_CODE_PATH: &str = "/api/users/check-emailcode";
pub const CHECK_PHONE_PATH: &str = "/api/users/check-phone";
pub const CHECK_EMAIL_PATH: &str = "/api/users/check-email";
pub const SIGNUP_PATH: &str = "/api/users/signup";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn has_success_code(&self) -> bool {
        self.code == Some(SUCCESS_CODE)
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: Token,
    /// Present only when the backend rotated the refresh token.
    pub refresh_token: Option<Token>,
}

impl TokenPair {
    fn from_envelope(envelope: Envelope<TokenData>) -> Option<Self> {
        let data = envelope.data?;
        Some(Self {
            access_token: data.access_token.and_then(Token::parse)?,
            refresh_token: data.refresh_token.and_then(Token::parse),
        })
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub location: String,
}

#[derive(Debug, Deserialize)]
struct SavedLocationBody {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub name: &'a str,
    /// `YYYY-MM-DD`.
    pub birthdate: String,
    pub phone_number: &'a str,
    pub nickname: &'a str,
}

/// The backend's verdict on a check or submission that completed at the
/// HTTP level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiOutcome {
    pub accepted: bool,
    pub message: Option<String>,
}

fn parse<T: DeserializeOwned>(response: &HttpResponse) -> Result<Envelope<T>, HttpError> {
    response.json()
}

impl ApiClient {
    #[instrument(skip(self, password))]
    pub async fn login(&self, identifier: &str, password: &SecretString) -> AppResult<Credentials> {
        let request = self.request(HttpMethod::Post, LOGIN_PATH)?.with_json(&LoginRequest {
            identifier,
            password: Some(password.expose_secret()),
        })?;
        let response = self.send(request).await?;
        let envelope: Envelope<TokenData> = parse(&response)?;
        let message = envelope.message.clone();
        let pair = TokenPair::from_envelope(envelope).ok_or_else(|| {
            AppError::new(
                ErrorKind::Authentication,
                message.unwrap_or_else(|| "로그인에 실패했습니다.".into()),
            )
        })?;
        self.session()
            .replace(&pair.access_token, pair.refresh_token.as_ref())
            .await?;
        info!(with_refresh = pair.refresh_token.is_some(), "signed in");
        Ok(Credentials {
            access_token: Some(pair.access_token),
            refresh_token: pair.refresh_token,
        })
    }

    /// Exchanges a refresh token for a new access token through the login
    /// endpoint. Bypasses the renewal logic in [`ApiClient::send`].
    pub async fn refresh(&self, refresh_token: &Token) -> Result<TokenPair, HttpError> {
        let mut request = self.request(HttpMethod::Post, LOGIN_PATH)?.with_json(&LoginRequest {
            identifier: refresh_token.expose(),
            password: None,
        })?;
        let response = self.dispatch(&mut request).await?;
        let request_id = response.request_id().to_string();
        TokenPair::from_envelope(parse(&response)?).ok_or(HttpError::InvalidResponse {
            reason: "refresh response carried no access token".into(),
            request_id,
        })
    }

    pub async fn saved_location(&self) -> AppResult<Option<String>> {
        let request = self.request(HttpMethod::Get, SAVED_LOCATION_PATH)?;
        let body: SavedLocationBody = self.send(request).await?.json()?;
        Ok(body.location.filter(|l| !l.trim().is_empty()))
    }

    #[instrument(skip(self, body), fields(location = %body.location))]
    pub async fn save_location(&self, body: &SaveLocationRequest) -> AppResult<()> {
        let request = self.request(HttpMethod::Post, SAVE_LOCATION_PATH)?.with_json(body)?;
        let response = self.send(request).await?;
        // Some deployments answer with an empty body.
        if let Ok(envelope) = parse::<serde_json::Value>(&response) {
            if envelope.success == Some(false) {
                return Err(AppError::new(
                    ErrorKind::Conflict,
                    envelope
                        .message
                        .unwrap_or_else(|| "위치 저장에 실패했습니다.".into()),
                ));
            }
        }
        Ok(())
    }

    pub async fn send_email_code(&self, email: &str) -> AppResult<ApiOutcome> {
        let request = self
            .request(HttpMethod::Post, EMAIL_CODE_PATH)?
            .with_json(&serde_json::json!({ "email": email }))?;
        self.outcome(request, Envelope::has_success_code).await
    }

    pub async fn check_email_code(&self, email: &str, code: &str) -> AppResult<ApiOutcome> {
        let request = self
            .request(HttpMethod::Post, CHECK_EMAIL_CODE_PATH)?
            .with_json(&serde_json::json!({ "email": email, "code": code }))?;
        self.outcome(request, Envelope::is_success).await
    }

    pub async fn check_phone(&self, phone: &str) -> AppResult<ApiOutcome> {
        let request = self
            .request(HttpMethod::Get, CHECK_PHONE_PATH)?
            .with_query(&[("phone", phone)]);
        self.outcome(request, Envelope::is_success).await
    }

    pub async fn check_email(&self, email: &str) -> AppResult<ApiOutcome> {
        let request = self
            .request(HttpMethod::Get, CHECK_EMAIL_PATH)?
            .with_query(&[("email", email)]);
        self.outcome(request, Envelope::has_success_code).await
    }

    #[instrument(skip(self, body), fields(email = body.email))]
    pub async fn signup(&self, body: &SignupRequest<'_>) -> AppResult<ApiOutcome> {
        let request = self.request(HttpMethod::Post, SIGNUP_PATH)?.with_json(body)?;
        self.outcome(request, Envelope::is_success).await
    }

    async fn outcome(
        &self,
        request: crate::capabilities::HttpRequest,
        accepted: fn(&Envelope<serde_json::Value>) -> bool,
    ) -> AppResult<ApiOutcome> {
        let path = request.url().path().to_string();
        let envelope: Envelope<serde_json::Value> = parse(&self.send(request).await?)?;
        let accepted = accepted(&envelope);
        if !accepted {
            warn!(%path, message = envelope.message.as_deref(), "request declined");
        }
        Ok(ApiOutcome {
            accepted,
            message: envelope.message,
        })
    }
}
