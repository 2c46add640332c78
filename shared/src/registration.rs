//! Sign-up form flow.
//!
//! Holds the field values and the server-side checks the user has passed.
//! Editing a field that was checked against the backend invalidates that
//! check. Submission never reaches the backend while the form is invalid.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{ApiOutcome, SignupRequest};
use crate::capabilities::Navigator;
use crate::client::ApiClient;
use crate::validation::{
    format_birthdate, is_valid_email, is_valid_name, is_valid_nickname, is_valid_password,
    is_valid_phone, parse_birthdate, Field, ValidationError,
};
use crate::{AppError, AppResult, Notice, LOGIN_REDIRECT_PATH};

const NETWORK_ERROR: &str = "네트워크 오류";

struct FormState {
    email: String,
    auth_code: String,
    password: SecretString,
    password_confirm: SecretString,
    name: String,
    birthdate: String,
    phone: String,
    nickname: String,
    agreed: bool,
    code_sent: bool,
    sending_code: bool,
    email_verified: bool,
    phone_checked: bool,
    nickname_checked: bool,
    errors: BTreeMap<Field, String>,
    notice: Option<Notice>,
}

impl FormState {
    fn new() -> Self {
        Self {
            email: String::new(),
            auth_code: String::new(),
            password: SecretString::new(String::new()),
            password_confirm: SecretString::new(String::new()),
            name: String::new(),
            birthdate: String::new(),
            phone: String::new(),
            nickname: String::new(),
            agreed: false,
            code_sent: false,
            sending_code: false,
            email_verified: false,
            phone_checked: false,
            nickname_checked: false,
            errors: BTreeMap::new(),
            notice: None,
        }
    }

    fn problems(&self) -> Vec<ValidationError> {
        let mut problems = Vec::new();
        if !is_valid_email(&self.email) {
            problems.push(ValidationError::Email);
        } else if !self.email_verified {
            problems.push(ValidationError::EmailNotVerified);
        }
        let password = self.password.expose_secret();
        if !is_valid_password(password) {
            problems.push(ValidationError::Password);
        }
        if password != self.password_confirm.expose_secret() {
            problems.push(ValidationError::PasswordMismatch);
        }
        if !is_valid_name(&self.name) {
            problems.push(ValidationError::Name);
        }
        if !is_valid_phone(&self.phone) {
            problems.push(ValidationError::Phone);
        } else if !self.phone_checked {
            problems.push(ValidationError::PhoneNotChecked);
        }
        if !is_valid_nickname(&self.nickname) {
            problems.push(ValidationError::Nickname);
        } else if !self.nickname_checked {
            problems.push(ValidationError::NicknameNotChecked);
        }
        if parse_birthdate(&self.birthdate).is_err() {
            problems.push(ValidationError::Birthdate);
        }
        if !self.agreed {
            problems.push(ValidationError::Agreement);
        }
        problems
    }

    fn reject(&mut self, field: Field, outcome: ApiOutcome, fallback: &str) {
        self.errors
            .insert(field, outcome.message.unwrap_or_else(|| fallback.to_string()));
    }
}

/// Snapshot handed to the shell for rendering. Passwords are never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationView {
    pub email: String,
    pub name: String,
    pub birthdate: String,
    pub phone: String,
    pub nickname: String,
    pub agreed: bool,
    pub code_sent: bool,
    pub sending_code: bool,
    pub email_verified: bool,
    pub phone_checked: bool,
    pub nickname_checked: bool,
    pub password_valid: bool,
    pub passwords_match: bool,
    pub submittable: bool,
    pub errors: BTreeMap<Field, String>,
    pub notice: Option<Notice>,
}

pub struct RegistrationForm {
    client: Arc<ApiClient>,
    navigator: Arc<dyn Navigator>,
    state: Mutex<FormState>,
}

impl std::fmt::Debug for RegistrationForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationForm").finish_non_exhaustive()
    }
}

impl RegistrationForm {
    pub fn new(client: Arc<ApiClient>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            client,
            navigator,
            state: Mutex::new(FormState::new()),
        }
    }

    pub fn set_email(&self, email: impl Into<String>) {
        let mut state = self.state();
        state.email = email.into();
        state.email_verified = false;
        state.code_sent = false;
        state.errors.remove(&Field::Email);
    }

    pub fn set_auth_code(&self, code: impl Into<String>) {
        let mut state = self.state();
        state.auth_code = code.into();
        state.errors.remove(&Field::AuthCode);
    }

    pub fn set_password(&self, password: SecretString) {
        self.state().password = password;
    }

    pub fn set_password_confirm(&self, password: SecretString) {
        self.state().password_confirm = password;
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state().name = name.into();
    }

    pub fn set_birthdate(&self, birthdate: impl Into<String>) {
        self.state().birthdate = birthdate.into();
    }

    pub fn set_phone(&self, phone: impl Into<String>) {
        let mut state = self.state();
        state.phone = phone.into();
        state.phone_checked = false;
        state.errors.remove(&Field::Phone);
    }

    pub fn set_nickname(&self, nickname: impl Into<String>) {
        let mut state = self.state();
        state.nickname = nickname.into();
        state.nickname_checked = false;
        state.errors.remove(&Field::Nickname);
    }

    pub fn set_agreed(&self, agreed: bool) {
        self.state().agreed = agreed;
    }

    /// Asks the backend to mail a verification code. A second call while
    /// one is outstanding is ignored and returns `Ok(false)`.
    pub async fn send_email_code(&self) -> AppResult<bool> {
        let email = {
            let mut state = self.state();
            if state.sending_code {
                debug!("email code request already in flight");
                return Ok(false);
            }
            if !is_valid_email(&state.email) {
                let err = ValidationError::Email;
                state.errors.insert(Field::Email, err.to_string());
                return Err(err.into());
            }
            state.sending_code = true;
            state.email.clone()
        };

        let result = self.client.send_email_code(&email).await;

        let mut state = self.state();
        state.sending_code = false;
        if state.email != email {
            debug!("email changed while the code was being sent");
            return Ok(false);
        }
        match result {
            Ok(outcome) if outcome.accepted => {
                state.errors.remove(&Field::Email);
                state.code_sent = true;
                state.notice = Some(Notice::info("인증번호가 이메일로 발송되었습니다."));
                Ok(true)
            }
            Ok(outcome) => {
                state.reject(Field::Email, outcome, "인증번호 발송에 실패했습니다.");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "sending email code failed");
                state.errors.insert(Field::Email, NETWORK_ERROR.into());
                Err(e)
            }
        }
    }

    pub async fn verify_email_code(&self) -> AppResult<bool> {
        let (email, code) = {
            let state = self.state();
            (state.email.clone(), state.auth_code.trim().to_string())
        };

        let result = self.client.check_email_code(&email, &code).await;

        let mut state = self.state();
        if state.email != email {
            return Ok(false);
        }
        match result {
            Ok(outcome) if outcome.accepted => {
                state.email_verified = true;
                state.errors.remove(&Field::AuthCode);
                state.notice = Some(Notice::info("이메일 인증이 완료되었습니다."));
                Ok(true)
            }
            Ok(outcome) => {
                state.email_verified = false;
                let message = outcome.message.clone().unwrap_or_else(|| "인증 실패".into());
                state.reject(Field::AuthCode, outcome, "인증 실패");
                state.notice = Some(Notice::error(message));
                Ok(false)
            }
            Err(e) => {
                state.email_verified = false;
                state.notice = Some(Notice::error(NETWORK_ERROR));
                Err(e)
            }
        }
    }

    pub async fn check_phone(&self) -> AppResult<bool> {
        let phone = {
            let mut state = self.state();
            if !is_valid_phone(&state.phone) {
                let err = ValidationError::Phone;
                state.errors.insert(Field::Phone, err.to_string());
                state.phone_checked = false;
                return Err(err.into());
            }
            state.phone.clone()
        };

        let result = self.client.check_phone(&phone).await;

        let mut state = self.state();
        if state.phone != phone {
            return Ok(false);
        }
        match result {
            Ok(outcome) if outcome.accepted => {
                state.errors.remove(&Field::Phone);
                state.phone_checked = true;
                Ok(true)
            }
            Ok(outcome) => {
                state.phone_checked = false;
                state.reject(Field::Phone, outcome, "이미 사용 중인 번호입니다.");
                Ok(false)
            }
            Err(e) => {
                state.phone_checked = false;
                state.errors.insert(Field::Phone, NETWORK_ERROR.into());
                Err(e)
            }
        }
    }

    /// Uniqueness check for the email address. Informational only; the
    /// verification code is what gates submission.
    pub async fn check_email(&self) -> AppResult<bool> {
        let email = self.state().email.clone();
        if !is_valid_email(&email) {
            self.state()
                .errors
                .insert(Field::Email, ValidationError::Email.to_string());
            return Err(ValidationError::Email.into());
        }

        let outcome = self.client.check_email(&email).await?;

        let mut state = self.state();
        if state.email != email {
            return Ok(false);
        }
        if outcome.accepted {
            state.errors.remove(&Field::Email);
        } else {
            state.reject(Field::Email, outcome, "이미 사용 중인 이메일입니다.");
        }
        Ok(state.errors.get(&Field::Email).is_none())
    }

    /// Local format check; there is no backend endpoint for nicknames.
    pub fn check_nickname(&self) -> bool {
        let mut state = self.state();
        let ok = is_valid_nickname(&state.nickname);
        state.nickname_checked = ok;
        if ok {
            state.errors.remove(&Field::Nickname);
        } else {
            state
                .errors
                .insert(Field::Nickname, ValidationError::Nickname.to_string());
        }
        ok
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let problems = self.state().problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    pub fn is_submittable(&self) -> bool {
        self.validate().is_ok()
    }

    /// Sends the sign-up request and, on success, moves to the login screen.
    pub async fn submit(&self) -> AppResult<bool> {
        let (email, password, name, birthdate, phone, nickname) = {
            let mut state = self.state();
            let problems = state.problems();
            if let Some(first) = problems.first().copied() {
                for problem in problems {
                    state.errors.entry(problem.field()).or_insert(problem.to_string());
                }
                return Err(AppError::from(first));
            }
            let birthdate = parse_birthdate(&state.birthdate).map_err(AppError::from)?;
            (
                state.email.clone(),
                SecretString::new(state.password.expose_secret().clone()),
                state.name.clone(),
                format_birthdate(birthdate),
                state.phone.clone(),
                state.nickname.clone(),
            )
        };

        let request = SignupRequest {
            email: &email,
            password: password.expose_secret(),
            name: &name,
            birthdate,
            phone_number: &phone,
            nickname: &nickname,
        };
        let result = self.client.signup(&request).await;

        let mut state = self.state();
        match result {
            Ok(outcome) if outcome.accepted => {
                info!("account created");
                state.notice = Some(Notice::info("회원가입 성공!"));
                drop(state);
                self.navigator.redirect(LOGIN_REDIRECT_PATH);
                Ok(true)
            }
            Ok(outcome) => {
                state.notice = Some(Notice::error(
                    outcome.message.unwrap_or_else(|| "회원가입 실패".into()),
                ));
                Ok(false)
            }
            Err(e) => {
                state.notice = Some(Notice::error(NETWORK_ERROR));
                Err(e)
            }
        }
    }

    pub fn take_notice(&self) -> Option<Notice> {
        self.state().notice.take()
    }

    pub fn view(&self) -> RegistrationView {
        let state = self.state();
        let password = state.password.expose_secret();
        RegistrationView {
            email: state.email.clone(),
            name: state.name.clone(),
            birthdate: state.birthdate.clone(),
            phone: state.phone.clone(),
            nickname: state.nickname.clone(),
            agreed: state.agreed,
            code_sent: state.code_sent,
            sending_code: state.sending_code,
            email_verified: state.email_verified,
            phone_checked: state.phone_checked,
            nickname_checked: state.nickname_checked,
            password_valid: is_valid_password(password),
            passwords_match: !password.is_empty()
                && password == state.password_confirm.expose_secret(),
            submittable: state.problems().is_empty(),
            errors: state.errors.clone(),
            notice: state.notice.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FormState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CHECK_EMAIL_CODE_PATH, CHECK_PHONE_PATH, EMAIL_CODE_PATH, SIGNUP_PATH};
    use crate::capabilities::testing::{FakeBackend, RecordingNavigator};
    use crate::capabilities::MemoryKvStore;
    use crate::client::ClientConfig;
    use crate::ErrorKind;
    use serde_json::json;

    fn form() -> (Arc<FakeBackend>, Arc<RecordingNavigator>, Arc<RegistrationForm>) {
        let backend = Arc::new(FakeBackend::new());
        let navigator = Arc::new(RecordingNavigator::default());
        let client = ApiClient::new(
            ClientConfig::default(),
            backend.clone(),
            Arc::new(MemoryKvStore::new()),
            navigator.clone(),
        )
        .unwrap();
        let form = RegistrationForm::new(Arc::new(client), navigator.clone());
        (backend, navigator, Arc::new(form))
    }

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    async fn fill_valid(backend: &FakeBackend, form: &RegistrationForm) {
        backend.route(EMAIL_CODE_PATH, 200, json!({"code": 20000}));
        backend.route(CHECK_EMAIL_CODE_PATH, 200, json!({"success": true}));
        backend.route(CHECK_PHONE_PATH, 200, json!({"success": true}));
        form.set_email("a@b.co");
        assert!(form.send_email_code().await.unwrap());
        form.set_auth_code("123456");
        assert!(form.verify_email_code().await.unwrap());
        form.set_password(secret("abcd123!"));
        form.set_password_confirm(secret("abcd123!"));
        form.set_name("홍길동");
        form.set_birthdate("19990102");
        form.set_phone("01012345678");
        assert!(form.check_phone().await.unwrap());
        form.set_nickname("길동");
        assert!(form.check_nickname());
        form.set_agreed(true);
    }

    #[tokio::test]
    async fn invalid_form_never_reaches_backend() {
        let (backend, _, form) = form();
        form.set_email("a@b.co");
        form.set_password(secret("short"));

        let err = form.submit().await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(backend.requests_to(SIGNUP_PATH).is_empty());
        let view = form.view();
        assert!(!view.submittable);
        assert!(view.errors.contains_key(&Field::Password));
        assert!(view.errors.contains_key(&Field::Agreement));
    }

    #[tokio::test]
    async fn complete_form_submits_and_redirects() {
        let (backend, navigator, form) = form();
        backend.route(SIGNUP_PATH, 200, json!({"success": true}));
        fill_valid(&backend, &form).await;
        assert!(form.is_submittable());

        assert!(form.submit().await.unwrap());

        let sent = backend.requests_to(SIGNUP_PATH);
        let body: serde_json::Value = serde_json::from_slice(sent[0].body().unwrap()).unwrap();
        assert_eq!(body["birthdate"], "1999-01-02");
        assert_eq!(body["phoneNumber"], "01012345678");
        assert_eq!(navigator.redirects(), vec!["/login".to_string()]);
        assert_eq!(form.take_notice(), Some(Notice::info("회원가입 성공!")));
    }

    #[tokio::test]
    async fn declined_signup_shows_backend_message() {
        let (backend, navigator, form) = form();
        fill_valid(&backend, &form).await;
        backend.route(SIGNUP_PATH, 200, json!({"success": false, "message": "이미 가입된 회원"}));

        assert!(!form.submit().await.unwrap());
        assert_eq!(form.take_notice(), Some(Notice::error("이미 가입된 회원")));
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn duplicate_code_request_is_ignored_while_in_flight() {
        let (backend, _, form) = form();
        backend.route(EMAIL_CODE_PATH, 200, json!({"code": 20000}));
        backend.hold(EMAIL_CODE_PATH);
        form.set_email("a@b.co");

        let first = tokio::spawn({
            let form = form.clone();
            async move { form.send_email_code().await }
        });
        while !form.view().sending_code {
            tokio::task::yield_now().await;
        }

        assert!(!form.send_email_code().await.unwrap());
        backend.release();
        assert!(first.await.unwrap().unwrap());
        assert_eq!(backend.requests_to(EMAIL_CODE_PATH).len(), 1);
        assert!(form.view().code_sent);
    }

    #[tokio::test]
    async fn code_sent_to_previous_address_is_not_reported() {
        let (backend, _, form) = form();
        backend.route(EMAIL_CODE_PATH, 200, json!({"code": 20000}));
        backend.hold(EMAIL_CODE_PATH);
        form.set_email("first@example.com");

        let pending = tokio::spawn({
            let form = form.clone();
            async move { form.send_email_code().await }
        });
        while !form.view().sending_code {
            tokio::task::yield_now().await;
        }
        form.set_email("second@example.com");
        backend.release();

        assert!(!pending.await.unwrap().unwrap());
        let view = form.view();
        assert_eq!(view.email, "second@example.com");
        assert!(!view.code_sent);
        assert!(!view.sending_code);
        assert_eq!(form.take_notice(), None);
        let sent = backend.requests_to(EMAIL_CODE_PATH);
        let body: serde_json::Value = serde_json::from_slice(sent[0].body().unwrap()).unwrap();
        assert_eq!(body, json!({"email": "first@example.com"}));
    }

    #[tokio::test]
    async fn late_email_check_does_not_touch_edited_address() {
        let (backend, _, form) = form();
        backend.route(
            crate::api::CHECK_EMAIL_PATH,
            200,
            json!({"code": 40900, "message": "이미 사용 중인 이메일입니다."}),
        );
        backend.hold(crate::api::CHECK_EMAIL_PATH);
        form.set_email("taken@example.com");

        let pending = tokio::spawn({
            let form = form.clone();
            async move { form.check_email().await }
        });
        while backend.requests_to(crate::api::CHECK_EMAIL_PATH).is_empty() {
            tokio::task::yield_now().await;
        }
        form.set_email("free@example.com");
        backend.release();

        assert!(!pending.await.unwrap().unwrap());
        assert!(form.view().errors.get(&Field::Email).is_none());
    }

    #[tokio::test]
    async fn rejected_code_request_records_backend_message() {
        let (backend, _, form) = form();
        backend.route(EMAIL_CODE_PATH, 200, json!({"code": 40900, "message": "이미 가입된 이메일입니다."}));
        form.set_email("a@b.co");

        assert!(!form.send_email_code().await.unwrap());
        assert_eq!(
            form.view().errors.get(&Field::Email).map(String::as_str),
            Some("이미 가입된 이메일입니다.")
        );
    }

    #[tokio::test]
    async fn editing_phone_invalidates_check() {
        let (backend, _, form) = form();
        backend.route(CHECK_PHONE_PATH, 200, json!({"success": true}));
        form.set_phone("01012345678");
        assert!(form.check_phone().await.unwrap());
        assert!(form.view().phone_checked);

        form.set_phone("01087654321");
        assert!(!form.view().phone_checked);
    }

    #[tokio::test]
    async fn malformed_phone_is_not_sent() {
        let (backend, _, form) = form();
        form.set_phone("010-1234");
        assert!(form.check_phone().await.is_err());
        assert!(backend.requests_to(CHECK_PHONE_PATH).is_empty());
    }

    #[test]
    fn nickname_check_is_local() {
        let (_, _, form) = form();
        form.set_nickname("1234");
        assert!(!form.check_nickname());
        assert_eq!(
            form.view().errors.get(&Field::Nickname).map(String::as_str),
            Some("닉네임 형식 오류")
        );
        form.set_nickname("길동");
        assert!(form.check_nickname());
    }

    #[test]
    fn view_never_contains_password() {
        let (_, _, form) = form();
        form.set_password(secret("abcd123!"));
        form.set_password_confirm(secret("abcd123!"));
        let view = form.view();
        assert!(view.password_valid);
        assert!(view.passwords_match);
        assert!(!serde_json::to_string(&view).unwrap().contains("abcd123!"));
    }
}
