//! Sign-in against the target site.

use crate::browser::{BrowserPage, settle};
use crate::capability::{Action, CapabilityTable, Locator};
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const SUBMIT: &str = "submit";
pub const CODE_INPUT: &str = "code_input";
pub const CODE_SUBMIT: &str = "code_submit";
pub const SIGNED_IN: &str = "signed_in";

/// Completes sign-in on a page, leaving it authenticated.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, page: &dyn BrowserPage) -> Result<()>;
}

/// For sites that can be searched without an account.
pub struct Anonymous;

#[async_trait]
impl Authenticator for Anonymous {
    async fn authenticate(&self, _page: &dyn BrowserPage) -> Result<()> {
        Ok(())
    }
}

/// Supplies the one-time code for a verification challenge.
#[async_trait]
pub trait CodeProvider: Send + Sync {
    async fn code(&self) -> Result<String>;
}

/// Reads the code from an environment variable.
pub struct EnvCode(pub String);

#[async_trait]
impl CodeProvider for EnvCode {
    async fn code(&self) -> Result<String> {
        std::env::var(&self.0)
            .map(|c| c.trim().to_string())
            .map_err(|_| ScanError::Auth(format!("verification code variable {} not set", self.0)))
    }
}

/// Asks on the terminal.
pub struct PromptCode;

#[async_trait]
impl CodeProvider for PromptCode {
    async fn code(&self) -> Result<String> {
        let line = tokio::task::spawn_blocking(|| -> std::io::Result<String> {
            let mut out = std::io::stderr();
            write!(out, "Verification code: ")?;
            out.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| ScanError::Other(e.to_string()))??;

        let code = line.trim().to_string();
        if code.is_empty() {
            return Err(ScanError::Auth("empty verification code".to_string()));
        }
        Ok(code)
    }
}

/// Env var first, terminal second.
pub struct EnvOrPrompt(pub String);

#[async_trait]
impl CodeProvider for EnvOrPrompt {
    async fn code(&self) -> Result<String> {
        match EnvCode(self.0.clone()).code().await {
            Ok(code) if !code.is_empty() => Ok(code),
            _ => PromptCode.code().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env(username_var: &str, password_var: &str) -> Result<Self> {
        let read = |var: &str| {
            std::env::var(var).map_err(|_| ScanError::Auth(format!("{var} is not set")))
        };
        Ok(Self {
            username: read(username_var)?,
            password: read(password_var)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthProfile {
    pub login_url: String,
    pub fields: CapabilityTable,
    pub settle_ms: u64,
    /// How long to wait for the signed-in marker after submitting.
    pub confirm_timeout_ms: u64,
}

impl Default for AuthProfile {
    fn default() -> Self {
        Self {
            login_url: String::new(),
            fields: default_login_fields(),
            settle_ms: 2000,
            confirm_timeout_ms: 15_000,
        }
    }
}

pub fn default_login_fields() -> CapabilityTable {
    CapabilityTable::new()
        .field(
            USERNAME,
            vec![
                Locator::css("input[type='email']"),
                Locator::css("input[name='username']"),
                Locator::label("email"),
                Locator::placeholder("email"),
            ],
        )
        .field(
            PASSWORD,
            vec![
                Locator::css("input[type='password']"),
                Locator::label("password"),
            ],
        )
        .field(
            SUBMIT,
            vec![
                Locator::css("button[type='submit']"),
                Locator::text("button", "sign in"),
                Locator::text("button", "log in"),
            ],
        )
        .field(
            CODE_INPUT,
            vec![
                Locator::css("input[autocomplete='one-time-code']"),
                Locator::label("verification code"),
                Locator::placeholder("code"),
            ],
        )
        .field(
            CODE_SUBMIT,
            vec![
                Locator::text("button", "verify"),
                Locator::css("button[type='submit']"),
            ],
        )
        .field(
            SIGNED_IN,
            vec![
                Locator::aria("account menu"),
                Locator::css("[data-test='user-menu']"),
                Locator::text("button", "sign out"),
            ],
        )
}

/// Capability-table driven login form with an optional verification step.
pub struct FormAuthenticator {
    profile: AuthProfile,
    credentials: Credentials,
    codes: Box<dyn CodeProvider>,
}

impl FormAuthenticator {
    pub fn new(profile: AuthProfile, credentials: Credentials, codes: Box<dyn CodeProvider>) -> Self {
        Self {
            profile,
            credentials,
            codes,
        }
    }

    async fn signed_in(&self, page: &dyn BrowserPage) -> Result<bool> {
        Ok(self
            .profile
            .fields
            .resolve(page, SIGNED_IN, &Action::Probe)
            .await?
            .is_some())
    }

    async fn fill(&self, page: &dyn BrowserPage, field: &str, value: &str) -> Result<()> {
        self.profile
            .fields
            .resolve(page, field, &Action::Fill(value.to_string()))
            .await?
            .map(|_| ())
            .ok_or_else(|| ScanError::Auth(format!("no {field} field on login page")))
    }

    async fn click(&self, page: &dyn BrowserPage, field: &str) -> Result<()> {
        self.profile
            .fields
            .resolve(page, field, &Action::Click)
            .await?
            .map(|_| ())
            .ok_or_else(|| ScanError::Auth(format!("no {field} control on login page")))
    }

    async fn confirm(&self, page: &dyn BrowserPage) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.profile.confirm_timeout_ms);
        loop {
            if self.signed_in(page).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScanError::Auth("sign-in was not confirmed".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl Authenticator for FormAuthenticator {
    async fn authenticate(&self, page: &dyn BrowserPage) -> Result<()> {
        if !self.profile.login_url.is_empty() {
            page.navigate(&self.profile.login_url).await?;
            settle(self.profile.settle_ms).await;
        }

        if self.signed_in(page).await? {
            debug!(page = page.id(), "Already signed in");
            return Ok(());
        }

        self.fill(page, USERNAME, &self.credentials.username).await?;
        self.fill(page, PASSWORD, &self.credentials.password).await?;
        self.click(page, SUBMIT).await?;
        settle(self.profile.settle_ms).await;

        if self
            .profile
            .fields
            .resolve(page, CODE_INPUT, &Action::Probe)
            .await?
            .is_some()
        {
            info!("Verification code requested");
            let code = self.codes.code().await?;
            self.fill(page, CODE_INPUT, &code).await?;
            if let Err(e) = self.click(page, CODE_SUBMIT).await {
                warn!("No verification submit control, relying on auto-submit: {}", e);
            }
            settle(self.profile.settle_ms).await;
        }

        self.confirm(page).await?;
        info!(page = page.id(), "Signed in");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::RecordingPage;
    use serde_json::{Value, json};

    struct FixedCode(&'static str);

    #[async_trait]
    impl CodeProvider for FixedCode {
        async fn code(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn single_candidate_profile() -> AuthProfile {
        let mut fields = CapabilityTable::new();
        for name in [USERNAME, PASSWORD, SUBMIT, CODE_INPUT, CODE_SUBMIT, SIGNED_IN] {
            fields.set(name, vec![Locator::css(&format!("#{name}"))]);
        }
        AuthProfile {
            login_url: "https://listings.test/login".to_string(),
            fields,
            settle_ms: 10,
            confirm_timeout_ms: 1000,
        }
    }

    fn authenticator(code: &'static str) -> FormAuthenticator {
        FormAuthenticator::new(
            single_candidate_profile(),
            Credentials {
                username: "sweeper@example.com".to_string(),
                password: "hunter2".to_string(),
            },
            Box::new(FixedCode(code)),
        )
    }

    fn queue(page: &RecordingPage, answers: Vec<Value>) {
        *page.answers.lock().unwrap() = answers;
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_signed_in_skips_form() {
        let page = RecordingPage::new("p");
        queue(&page, vec![json!(true)]);

        authenticator("000000").authenticate(&page).await.unwrap();

        assert_eq!(page.calls(), vec!["navigate https://listings.test/login".to_string()]);
        assert!(page.answers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_without_challenge() {
        let page = RecordingPage::new("p");
        // signed_in?, username, password, submit, code_input?, signed_in?
        queue(
            &page,
            vec![Value::Null, json!(true), json!(true), json!(true), Value::Null, json!(true)],
        );

        authenticator("000000").authenticate(&page).await.unwrap();

        assert!(page.answers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_with_verification_code() {
        let page = RecordingPage::new("p");
        // signed_in?, username, password, submit, code_input?, code fill, code submit, signed_in?
        queue(
            &page,
            vec![
                Value::Null,
                json!(true),
                json!(true),
                json!(true),
                json!(true),
                json!(true),
                json!(true),
                json!(true),
            ],
        );

        authenticator("123456").authenticate(&page).await.unwrap();

        assert!(page.answers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_username_field_is_auth_error() {
        let page = RecordingPage::new("p");
        queue(&page, vec![Value::Null, Value::Null]);

        let err = authenticator("000000").authenticate(&page).await.unwrap_err();

        assert!(matches!(err, ScanError::Auth(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_sign_in_times_out() {
        let page = RecordingPage::new("p");
        let mut answers = vec![Value::Null, json!(true), json!(true), json!(true), Value::Null];
        answers.extend(std::iter::repeat_n(Value::Null, 10));
        queue(&page, answers);

        let err = authenticator("000000").authenticate(&page).await.unwrap_err();

        assert!(matches!(err, ScanError::Auth(ref m) if m.contains("not confirmed")));
    }
}
