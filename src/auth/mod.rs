//! Session bootstrap: password login, TOTP second factor, app-token exchange.
//!
//! The flow mirrors the broker's web login: a password login yields a request
//! id, the TOTP code validates it into a session, and the app credentials
//! turn the resulting request-token into a long-lived access token.

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

const LOGIN_URL: &str = "https://api.tiqs.in/auth/login";
const VALIDATE_2FA_URL: &str = "https://api.tiqs.in/auth/validate-2fa";
const GENERATE_TOKEN_URL: &str = "https://api.tiqs.in/auth/app/generate-token";
const AUTHENTICATE_TOKEN_URL: &str = "https://api.tiqs.trading/auth/app/authenticate-token";

const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Credentials required to mint an access token.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub user_id: String,
    pub password: String,
    /// Base32 TOTP secret from the broker's 2FA enrollment.
    pub totp_key: String,
    pub app_id: String,
    pub app_secret: String,
}

impl ClientParams {
    fn validate(&self) -> Result<()> {
        for (value, name) in [
            (&self.user_id, "user_id"),
            (&self.password, "password"),
            (&self.totp_key, "totp_key"),
            (&self.app_id, "app_id"),
            (&self.app_secret, "app_secret"),
        ] {
            anyhow::ensure!(!value.is_empty(), "{name} must not be empty");
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct LoginData {
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Deserialize)]
struct SessionData {
    session: String,
    token: String,
}

#[derive(Deserialize)]
struct RedirectData {
    #[serde(rename = "redirectUrl")]
    redirect_url: String,
}

#[derive(Deserialize)]
struct AccessTokenData {
    token: String,
}

#[derive(Deserialize)]
struct StepResponse<T> {
    data: T,
}

/// Run the full login flow and return the access token.
pub async fn generate_access_token(params: &ClientParams) -> Result<String> {
    params.validate()?;
    let http = reqwest::Client::new();

    let request_id = send_login(&http, params)
        .await
        .context("password login failed")?;

    let code = generate_totp(&params.totp_key).context("TOTP generation failed")?;

    let session = verify_totp(&http, params, &request_id, &code)
        .await
        .context("2FA validation failed")?;

    let redirect_url = generate_app_token(&http, &session, &params.app_id)
        .await
        .context("app token generation failed")?;

    let request_token = extract_request_token(&redirect_url)?;

    let checksum = hash_key(&format!(
        "{}:{}:{}",
        params.app_id, params.app_secret, request_token
    ));

    authenticate_token(&http, &checksum, &request_token, &params.app_id)
        .await
        .context("token authentication failed")
}

async fn send_login(http: &reqwest::Client, params: &ClientParams) -> Result<String> {
    let response = http
        .post(LOGIN_URL)
        .json(&json!({
            "userId": params.user_id,
            "password": params.password,
            "captchaValue": "",
            "captchaId": null,
        }))
        .send()
        .await?;
    let body: StepResponse<LoginData> = check_status(response).await?;
    Ok(body.data.request_id)
}

async fn verify_totp(
    http: &reqwest::Client,
    params: &ClientParams,
    request_id: &str,
    code: &str,
) -> Result<SessionData> {
    let response = http
        .post(VALIDATE_2FA_URL)
        .json(&json!({
            "code": code,
            "requestId": request_id,
            "userId": params.user_id,
        }))
        .send()
        .await?;
    let body: StepResponse<SessionData> = check_status(response).await?;
    Ok(body.data)
}

async fn generate_app_token(
    http: &reqwest::Client,
    session: &SessionData,
    app_id: &str,
) -> Result<String> {
    let response = http
        .post(GENERATE_TOKEN_URL)
        .header("Session", &session.session)
        .header("Token", &session.token)
        .json(&json!({ "apiKey": app_id }))
        .send()
        .await?;
    let body: StepResponse<RedirectData> = check_status(response).await?;
    Ok(body.data.redirect_url)
}

async fn authenticate_token(
    http: &reqwest::Client,
    checksum: &str,
    request_token: &str,
    app_id: &str,
) -> Result<String> {
    let response = http
        .post(AUTHENTICATE_TOKEN_URL)
        .json(&json!({
            "checkSum": checksum,
            "token": request_token,
            "appId": app_id,
        }))
        .send()
        .await?;
    let body: StepResponse<AccessTokenData> = check_status(response).await?;
    Ok(body.data.token)
}

async fn check_status<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("API error ({status}): {body}"));
    }
    response.json().await.context("unexpected response shape")
}

/// Current RFC 6238 TOTP code for a base32 secret.
pub fn generate_totp(secret: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before Unix epoch")?
        .as_secs();
    totp_at(secret, now)
}

fn totp_at(secret: &str, unix_secs: u64) -> Result<String> {
    let key = base32::decode(
        base32::Alphabet::Rfc4648 { padding: false },
        &secret.to_uppercase().replace(' ', ""),
    )
    .ok_or_else(|| anyhow!("TOTP secret is not valid base32"))?;

    let counter = unix_secs / TOTP_STEP_SECS;
    let mut mac =
        Hmac::<Sha1>::new_from_slice(&key).map_err(|_| anyhow!("TOTP secret is empty"))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) % 10u32.pow(TOTP_DIGITS);

    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Pull the `request-token` query parameter out of the redirect URL.
fn extract_request_token(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid redirect url: {url}"))?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "request-token")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| anyhow!("redirect url carries no request-token"))
}

/// Hex-encoded SHA-256 of the checksum key.
fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
