//! Authentication strategies.
//!
//! Old firmware protects its API with HTTP digest credentials; newer
//! firmware (7.x) expects a cloud-issued JWT presented as a bearer
//! header plus a session cookie obtained from `/auth/check_jwt`. Both
//! strategies sit behind [`GatewayAuth`] so the reader never cares
//! which one is active.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::http::{send_with_retry, HttpRequest, HttpResponse, HttpTransport, Method};

const ENLIGHTEN_LOGIN_URL: &str = "https://enlighten.enphaseenergy.com/login/login.json";
const ENTREZ_TOKEN_URL: &str = "https://entrez.enphaseenergy.com/tokens";

/// Tokens are refreshed proactively this long before their expiry.
const TOKEN_STALE_WINDOW_DAYS: i64 = 30;

#[async_trait]
pub trait GatewayAuth: Send {
    /// Scheme the device expects for authenticated requests.
    fn protocol(&self) -> &'static str;

    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn cookies(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Per-request `Authorization` value, for strategies that sign the
    /// method and URI (digest). Bearer strategies use [`headers`]
    /// instead and return `None` here.
    ///
    /// [`headers`]: GatewayAuth::headers
    fn authorize(&mut self, _method: Method, _uri: &str) -> Option<String> {
        None
    }

    fn is_stale(&self) -> bool {
        false
    }

    /// The held bearer token, if any, so the host can persist it.
    fn token(&self) -> Option<&str> {
        None
    }

    async fn setup(&mut self, _transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn refresh(&mut self, _transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        Ok(())
    }

    /// React to a 401 from the device. The rejected response is passed
    /// in so challenge-based strategies can read it.
    async fn resolve_401(
        &mut self,
        _transport: &dyn HttpTransport,
        _response: &HttpResponse,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Compute the password the device derives from its own serial number
/// for the built-in `installer` account.
pub fn installer_password(serial: &str) -> String {
    let digest = md5_hex(&format!("[e]installer@{serial}"));
    let mut count_zero = digest.matches('0').count() as i32;
    let mut count_one = digest.matches('1').count() as i32;
    let mut password = String::with_capacity(8);

    for cc in digest.chars().rev().take(8) {
        if count_zero == 3 || count_zero == 6 || count_zero == 9 {
            count_zero -= 1;
        }
        count_zero = count_zero.clamp(0, 20);
        if count_one == 9 || count_one == 15 {
            count_one -= 1;
        }
        count_one = count_one.clamp(0, 26);

        match cc {
            '0' => {
                password.push_str(&count_zero.to_string());
                count_zero -= 1;
            }
            '1' => {
                password.push_str(&count_one.to_string());
                count_one -= 1;
            }
            _ => password.push(cc),
        }
    }
    password
}

/// Default password for the built-in accounts when none is supplied.
pub fn default_password(username: &str, serial: &str) -> Option<String> {
    match username {
        "installer" => Some(installer_password(serial)),
        "envoy" => Some(serial.chars().take(6).collect()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
}

fn parse_challenge(header: &str) -> Option<DigestChallenge> {
    let params = header.strip_prefix("Digest ")?;

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut opaque = None;

    for param in split_challenge_params(params) {
        let (key, value) = param.split_once('=')?;
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "qop" => qop = Some(value),
            "opaque" => opaque = Some(value),
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        qop,
        opaque,
    })
}

// Commas inside quoted values (qop="auth,auth-int") must not split.
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (i, ch) in params.char_indices() {
        match ch {
            '"' => in_quote = !in_quote,
            ',' if !in_quote => {
                out.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(params[start..].trim());
    out.retain(|p| !p.is_empty());
    out
}

#[allow(clippy::too_many_arguments)]
fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    match qop {
        Some(qop) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// Digest credentials for pre-7.x firmware. The challenge is captured
/// from the first 401 the device sends; until then requests go out
/// unauthenticated, which is also how unprotected legacy endpoints
/// behave.
pub struct LegacyAuth {
    username: String,
    password: String,
    challenge: Option<DigestChallenge>,
    nc: u32,
}

impl LegacyAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: None,
            nc: 0,
        }
    }

    fn build_header(&mut self, method: Method, uri: &str) -> Option<String> {
        let challenge = self.challenge.clone()?;
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let cnonce = md5_hex(&format!(
            "{}:{}:{}",
            challenge.nonce,
            nc,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        // First qop the server offers; the device only ever sends "auth".
        let qop = challenge
            .qop
            .as_deref()
            .and_then(|q| q.split(',').next())
            .map(str::trim);

        let response = digest_response(
            &self.username,
            &self.password,
            &challenge.realm,
            &challenge.nonce,
            method.as_str(),
            uri,
            qop,
            &nc,
            &cnonce,
        );

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri, response
        );
        if let Some(qop) = qop {
            header.push_str(&format!(", qop={qop}, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        Some(header)
    }
}

#[async_trait]
impl GatewayAuth for LegacyAuth {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn authorize(&mut self, method: Method, uri: &str) -> Option<String> {
        self.build_header(method, uri)
    }

    async fn resolve_401(
        &mut self,
        _transport: &dyn HttpTransport,
        response: &HttpResponse,
    ) -> Result<(), GatewayError> {
        let header = response.header("www-authenticate").ok_or_else(|| {
            GatewayError::GatewayAuthentication("401 without a digest challenge".to_string())
        })?;
        self.challenge = Some(parse_challenge(header).ok_or_else(|| {
            GatewayError::GatewayAuthentication(format!("unparseable challenge: {header}"))
        })?);
        self.nc = 0;
        debug!("captured digest challenge");
        Ok(())
    }
}

fn decode_expiry(token: &str) -> Result<DateTime<Utc>, GatewayError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| GatewayError::InvalidToken("token has no payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| GatewayError::InvalidToken(format!("payload is not base64: {err}")))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|err| GatewayError::InvalidToken(format!("payload is not JSON: {err}")))?;
    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::InvalidToken("payload has no exp claim".to_string()))?;
    DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| GatewayError::InvalidToken(format!("exp claim out of range: {exp}")))
}

/// Bearer-token strategy for 7.x firmware.
///
/// A missing token is obtained through the Enlighten cloud (account
/// login for a session id, then the token-issuance service), after
/// which the token is validated against the device itself to pick up
/// the session cookie.
pub struct TokenAuth {
    host: String,
    serial: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    expiry: Option<DateTime<Utc>>,
    cookies: Vec<(String, String)>,
}

impl TokenAuth {
    pub fn new(
        host: impl Into<String>,
        serial: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            serial: serial.into(),
            username,
            password,
            token: None,
            expiry: None,
            cookies: Vec::new(),
        }
    }

    /// Install a host-persisted token, decoding its expiry claim. The
    /// signature is deliberately not verified; the device is the only
    /// party that can judge validity.
    pub fn set_token(&mut self, token: impl Into<String>) -> Result<(), GatewayError> {
        let token = token.into();
        self.expiry = Some(decode_expiry(&token)?);
        self.token = Some(token);
        Ok(())
    }

    fn clear(&mut self) {
        self.token = None;
        self.expiry = None;
        self.cookies.clear();
    }

    async fn retrieve_token(&mut self, transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => {
                return Err(GatewayError::AuthenticationRequired(
                    "cloud account credentials are required to obtain a token".to_string(),
                ))
            }
        };

        info!("requesting a new token from the Enlighten cloud");
        let login = HttpRequest::post(ENLIGHTEN_LOGIN_URL).form(vec![
            ("user[email]".to_string(), username.clone()),
            ("user[password]".to_string(), password),
        ]);
        let response = send_with_retry(transport, login, 3)
            .await
            .map_err(|err| GatewayError::CloudCommunication(err.to_string()))?;
        if response.status == 401 {
            return Err(GatewayError::CloudAuthentication);
        }
        if !response.is_success() {
            return Err(GatewayError::CloudCommunication(format!(
                "login returned status {}",
                response.status
            )));
        }
        let session_id = response
            .json()
            .ok()
            .and_then(|v| v.get("session_id").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| {
                GatewayError::CloudCommunication("login response carried no session id".to_string())
            })?;

        let issue = HttpRequest::post(ENTREZ_TOKEN_URL).json(json!({
            "session_id": session_id,
            "serial_num": self.serial,
            "username": username,
        }));
        let response = send_with_retry(transport, issue, 3)
            .await
            .map_err(|err| GatewayError::CloudCommunication(err.to_string()))?;
        if !response.is_success() {
            return Err(GatewayError::CloudCommunication(format!(
                "token issuance returned status {}",
                response.status
            )));
        }

        self.set_token(response.text().trim().to_string())
    }

    async fn validate_token(&mut self, transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        let token = self.token.clone().ok_or_else(|| {
            GatewayError::AuthenticationRequired("no token to validate".to_string())
        })?;

        let request = HttpRequest::get(format!("https://{}/auth/check_jwt", self.host))
            .header("Authorization", format!("Bearer {token}"));
        let response = send_with_retry(transport, request, 3)
            .await
            .map_err(|err| GatewayError::GatewayCommunication(err.to_string()))?;

        match response.status {
            status if (200..300).contains(&status) => {
                self.cookies = response.set_cookies();
                debug!("token accepted by the gateway");
                Ok(())
            }
            401 | 403 => Err(GatewayError::InvalidToken(
                "the gateway rejected the token".to_string(),
            )),
            status => Err(GatewayError::GatewayCommunication(format!(
                "token validation returned status {status}"
            ))),
        }
    }
}

#[async_trait]
impl GatewayAuth for TokenAuth {
    fn protocol(&self) -> &'static str {
        "https"
    }

    fn headers(&self) -> Vec<(String, String)> {
        match &self.token {
            Some(token) => vec![("Authorization".to_string(), format!("Bearer {token}"))],
            None => Vec::new(),
        }
    }

    fn cookies(&self) -> Vec<(String, String)> {
        self.cookies.clone()
    }

    fn is_stale(&self) -> bool {
        match (&self.token, self.expiry) {
            (Some(_), Some(expiry)) => {
                Utc::now() > expiry - Duration::days(TOKEN_STALE_WINDOW_DAYS)
            }
            _ => true,
        }
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    async fn setup(&mut self, transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        if self.token.is_none() {
            self.retrieve_token(transport).await?;
        }
        match self.validate_token(transport).await {
            Err(GatewayError::InvalidToken(reason)) => {
                warn!(%reason, "held token was rejected, requesting a fresh one");
                self.clear();
                self.retrieve_token(transport).await?;
                self.validate_token(transport).await
            }
            other => other,
        }
    }

    async fn refresh(&mut self, transport: &dyn HttpTransport) -> Result<(), GatewayError> {
        self.retrieve_token(transport).await?;
        self.validate_token(transport).await
    }

    async fn resolve_401(
        &mut self,
        transport: &dyn HttpTransport,
        _response: &HttpResponse,
    ) -> Result<(), GatewayError> {
        match self.validate_token(transport).await {
            Err(GatewayError::InvalidToken(reason)) => {
                warn!(%reason, "token no longer valid, running full setup");
                self.clear();
                self.setup(transport).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_response_matches_rfc2617_example() {
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            "00000001",
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn challenge_parsing_handles_quoted_qop_list() {
        let challenge = parse_challenge(
            "Digest realm=\"enphaseenergy.com\", qop=\"auth,auth-int\", \
             nonce=\"5e21bf\", opaque=\"a23f\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "enphaseenergy.com");
        assert_eq!(challenge.nonce, "5e21bf");
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(challenge.opaque.as_deref(), Some("a23f"));
    }

    #[test]
    fn installer_password_is_deterministic_and_short() {
        let a = installer_password("122107000000");
        let b = installer_password("122107000000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_ne!(a, installer_password("122107000001"));
    }

    #[test]
    fn envoy_default_password_is_serial_prefix() {
        assert_eq!(
            default_password("envoy", "122107000000").as_deref(),
            Some("122107")
        );
        assert_eq!(default_password("someone", "122107000000"), None);
    }

    fn make_token(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({"aud": "122107000000", "exp": exp})).unwrap(),
        );
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn token_expiry_is_decoded_without_verification() {
        let mut auth = TokenAuth::new("envoy.local", "122107000000", None, None);
        let exp = (Utc::now() + Duration::days(120)).timestamp();
        auth.set_token(make_token(exp)).unwrap();
        assert!(!auth.is_stale());
        assert!(auth.token().is_some());
    }

    #[test]
    fn token_near_expiry_is_stale() {
        let mut auth = TokenAuth::new("envoy.local", "122107000000", None, None);
        let exp = (Utc::now() + Duration::days(10)).timestamp();
        auth.set_token(make_token(exp)).unwrap();
        assert!(auth.is_stale());
    }

    #[test]
    fn missing_token_is_stale() {
        let auth = TokenAuth::new("envoy.local", "122107000000", None, None);
        assert!(auth.is_stale());
        assert!(auth.headers().is_empty());
    }

    #[test]
    fn garbage_token_is_rejected() {
        let mut auth = TokenAuth::new("envoy.local", "122107000000", None, None);
        assert!(matches!(
            auth.set_token("not-a-jwt"),
            Err(GatewayError::InvalidToken(_))
        ));
    }

    #[test]
    fn digest_header_carries_challenge_fields() {
        let mut auth = LegacyAuth::new("envoy", "122107");
        auth.challenge = Some(DigestChallenge {
            realm: "enphaseenergy.com".to_string(),
            nonce: "5e21bf".to_string(),
            qop: Some("auth".to_string()),
            opaque: None,
        });

        let header = auth
            .authorize(Method::Get, "/api/v1/production")
            .expect("header");
        assert!(header.starts_with("Digest username=\"envoy\""));
        assert!(header.contains("nonce=\"5e21bf\""));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("nc=00000001"));
    }

    #[test]
    fn no_challenge_means_no_header() {
        let mut auth = LegacyAuth::new("envoy", "122107");
        assert!(auth.authorize(Method::Get, "/api/v1/production").is_none());
    }
}
