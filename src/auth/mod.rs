//! SSO authentication
//!
//! The gateway's initial handshake yields an identity-provider login URL.
//! An automated browser (an external collaborator behind [`BrowserDriver`])
//! completes the login and hands back the authentication cookie the VPN
//! client needs. The authenticator enforces the bounded wait and the
//! cancellation semantics; it never retries on its own.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("XML parsing failed: {0}")]
    XmlError(#[from] quick_xml::DeError),

    #[error("Authentication timed out")]
    Timeout,

    #[error("Authentication rejected: {0}")]
    Rejected(String),

    #[error("Browser automation failed: {0}")]
    Browser(String),

    #[error("Authentication cancelled")]
    Cancelled,
}

/// Opaque authentication token with an optional expiry hint.
///
/// Consumed exactly once by the process launcher and never persisted. The
/// secret is masked in all formatted output.
pub struct AuthArtifact {
    secret: String,
    expires_hint: Option<Duration>,
    issued_at: Instant,
}

impl AuthArtifact {
    pub fn new(secret: String, expires_hint: Option<Duration>) -> Self {
        Self {
            secret,
            expires_hint,
            issued_at: Instant::now(),
        }
    }

    /// True once the expiry hint has elapsed; an expired artifact must be
    /// discarded, never handed to the client
    pub fn is_expired(&self) -> bool {
        self.expires_hint
            .map_or(false, |ttl| self.issued_at.elapsed() >= ttl)
    }

    /// Consume the artifact, yielding the secret
    pub fn into_secret(self) -> String {
        self.secret
    }
}

impl fmt::Debug for AuthArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthArtifact")
            .field("secret", &mask_secret(&self.secret))
            .field("expires_hint", &self.expires_hint)
            .finish()
    }
}

/// Mask a secret to stars plus the last 4 characters.
///
/// Counts characters, not bytes; cookies can carry multibyte content and a
/// byte slice could split a code point.
pub fn mask_secret(value: &str) -> String {
    let chars = value.chars().count();
    if chars <= 4 {
        "****".to_string()
    } else {
        let tail: String = value.chars().skip(chars - 4).collect();
        format!("****{}", tail)
    }
}

/// What the browser driver needs to complete a login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Identity-provider URL to open
    pub login_url: String,
    /// URL whose load marks a completed login, when the gateway names one
    pub completion_url: Option<String>,
    /// Cookie holding the session token after login
    pub token_cookie: String,
}

// XML shapes for the gateway's aggregate-auth reply
#[derive(Debug, Deserialize)]
struct ConfigAuthXml {
    auth: Option<AuthSectionXml>,
}

#[derive(Debug, Deserialize)]
struct AuthSectionXml {
    #[serde(rename = "sso-v2-login", default)]
    sso_login: Option<String>,
    #[serde(rename = "sso-v2-login-final", default)]
    sso_login_final: Option<String>,
    #[serde(rename = "sso-v2-token-cookie-name", default)]
    token_cookie_name: Option<String>,
    #[serde(rename = "message", default)]
    message: Option<String>,
}

fn parse_prelogin(body: &str) -> Result<LoginRequest, AuthError> {
    let reply: ConfigAuthXml = quick_xml::de::from_str(body)?;

    let auth = reply
        .auth
        .ok_or_else(|| AuthError::Rejected("no auth section in gateway reply".to_string()))?;

    let login_url = auth.sso_login.ok_or_else(|| {
        AuthError::Rejected(
            auth.message
                .unwrap_or_else(|| "gateway did not offer SSO login".to_string()),
        )
    })?;

    Ok(LoginRequest {
        login_url,
        completion_url: auth.sso_login_final,
        token_cookie: auth
            .token_cookie_name
            .unwrap_or_else(|| "webvpn".to_string()),
    })
}

/// Ask the gateway where to send the user for SSO login
pub async fn prelogin(server: &str) -> Result<LoginRequest, AuthError> {
    info!("Sending SSO prelogin request to {}", server);

    let client = Client::builder()
        .danger_accept_invalid_certs(false)
        .build()?;

    let url = format!("https://{}/", server);
    let body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<config-auth client="vpn" type="init">
  <version who="vpn">4.10.0</version>
  <group-access>{}</group-access>
  <capabilities>
    <auth-method>single-sign-on-v2</auth-method>
  </capabilities>
</config-auth>"#,
        url
    );

    let response = client
        .post(&url)
        .header("User-Agent", "AnyConnect-compatible OpenConnect VPN Agent")
        .header("X-Aggregate-Auth", "1")
        .body(body)
        .send()
        .await?;

    let text = response.text().await?;
    debug!("Prelogin response: {}", text);

    parse_prelogin(&text)
}

/// Capability seam over the automated browser.
///
/// Implementations own their resource cleanup (browser profile, temp dirs)
/// on every exit path, including when the returned future is dropped.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn authenticate(&self, request: &LoginRequest) -> Result<AuthArtifact, AuthError>;
}

/// How the login URL for a server is obtained
#[async_trait]
pub trait LoginResolver: Send + Sync {
    async fn resolve(&self, server: &str) -> Result<LoginRequest, AuthError>;
}

/// Production resolver: asks the gateway via the prelogin exchange
pub struct GatewayPrelogin;

#[async_trait]
impl LoginResolver for GatewayPrelogin {
    async fn resolve(&self, server: &str) -> Result<LoginRequest, AuthError> {
        prelogin(server).await
    }
}

/// Fixed login request, independent of the server (tests, dev wiring)
pub struct StaticLogin(pub LoginRequest);

#[async_trait]
impl LoginResolver for StaticLogin {
    async fn resolve(&self, _server: &str) -> Result<LoginRequest, AuthError> {
        Ok(self.0.clone())
    }
}

/// Enforces the bounded wait and cancellation around a browser driver
pub struct SsoAuthenticator {
    resolver: std::sync::Arc<dyn LoginResolver>,
    driver: std::sync::Arc<dyn BrowserDriver>,
    max_wait: Duration,
}

impl SsoAuthenticator {
    pub fn new(
        resolver: std::sync::Arc<dyn LoginResolver>,
        driver: std::sync::Arc<dyn BrowserDriver>,
        max_wait: Duration,
    ) -> Self {
        Self {
            resolver,
            driver,
            max_wait,
        }
    }

    /// Resolve the login URL and run the browser login. Fails with
    /// `Timeout` after the bounded wait and `Cancelled` when the session is
    /// torn down mid-login; the in-flight future is dropped on both paths,
    /// which triggers the driver's cleanup.
    pub async fn authenticate(
        &self,
        server: &str,
        cancel: &CancellationToken,
    ) -> Result<AuthArtifact, AuthError> {
        info!("Waiting for SSO login (max {:?})", self.max_wait);

        let flow = async {
            let request = self.resolver.resolve(server).await?;
            info!("SSO login URL: {}", request.login_url);
            self.driver.authenticate(&request).await
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("SSO login cancelled");
                Err(AuthError::Cancelled)
            }
            result = timeout(self.max_wait, flow) => {
                match result {
                    Ok(Ok(artifact)) => {
                        info!("SSO login complete, artifact {:?}", artifact);
                        Ok(artifact)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AuthError::Timeout),
                }
            }
        }
    }
}

/// Production driver: runs a helper command with the login URL and reads
/// the resulting cookie from its stdout.
pub struct CommandBrowserDriver {
    command: Vec<String>,
}

impl CommandBrowserDriver {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BrowserDriver for CommandBrowserDriver {
    async fn authenticate(&self, request: &LoginRequest) -> Result<AuthArtifact, AuthError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AuthError::Browser("empty browser command".to_string()))?;

        debug!("Running browser helper: {}", program);

        let mut child = Command::new(program)
            .args(args)
            .arg(&request.login_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AuthError::Browser(format!("failed to start {}: {}", program, e)))?;

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| AuthError::Browser(e.to_string()))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AuthError::Browser(e.to_string()))?;

        if !status.success() {
            return Err(AuthError::Rejected(format!(
                "browser helper exited with {}",
                status
            )));
        }

        let secret = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| AuthError::Rejected("browser helper produced no cookie".to_string()))?
            .to_string();

        Ok(AuthArtifact::new(secret, None))
    }
}
