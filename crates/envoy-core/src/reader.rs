use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::auth::{default_password, GatewayAuth, LegacyAuth, TokenAuth};
use crate::config::ReaderConfig;
use crate::endpoint::{Endpoint, EndpointData};
use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewayModel};
use crate::http::{send_with_retry, HttpRequest, HttpResponse, HttpTransport, Method};
use crate::info::GatewayInfo;
use crate::snapshot::{Snapshot, SnapshotDevice};

/// Everything after the host part of a URL, for strategies that sign
/// the request URI.
fn request_uri(url: &str) -> &str {
    url.split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("/")
}

/// Polls one gateway: detects its identity and variant, authenticates,
/// and keeps the variant's payloads fresh.
///
/// A reader serves a single consumer; `update` takes `&mut self`
/// precisely because endpoint timestamps and fetched payloads are not
/// synchronized for concurrent cycles.
pub struct GatewayReader<T: HttpTransport> {
    host: String,
    config: ReaderConfig,
    transport: T,
    auth: Option<Box<dyn GatewayAuth>>,
    gateway: Option<Gateway>,
    info: GatewayInfo,
    endpoints: BTreeMap<String, Endpoint>,
}

impl<T: HttpTransport> GatewayReader<T> {
    pub fn new(host: impl Into<String>, transport: T) -> Self {
        Self::with_config(host, transport, ReaderConfig::default())
    }

    pub fn with_config(host: impl Into<String>, transport: T, config: ReaderConfig) -> Self {
        Self {
            host: host.into(),
            config,
            transport,
            auth: None,
            gateway: None,
            info: GatewayInfo::new(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &GatewayInfo {
        &self.info
    }

    /// Fetch the identity document without authenticating. Useful for
    /// checking what a device is before deciding on credentials.
    pub async fn fetch_info(&mut self) -> Result<&GatewayInfo, GatewayError> {
        self.info.update(&self.transport, &self.host).await?;
        Ok(&self.info)
    }

    pub fn model(&self) -> Option<GatewayModel> {
        self.gateway.as_ref().map(Gateway::model)
    }

    /// The bearer token currently held, when token auth is active.
    pub fn token(&self) -> Option<&str> {
        self.auth.as_deref().and_then(|auth| auth.token())
    }

    pub fn property(&self, name: &str) -> Option<serde_json::Value> {
        self.gateway.as_ref().and_then(|g| g.property(name))
    }

    fn protocol(&self) -> &'static str {
        self.auth.as_deref().map_or("https", |auth| auth.protocol())
    }

    fn device_url(&self, path: &str) -> String {
        format!("{}://{}/{path}", self.protocol(), self.host)
    }

    /// Fetch identity, pick and set up the authentication strategy,
    /// classify the variant and run its probe. Must complete before
    /// the first `update`.
    pub async fn authenticate(
        &mut self,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Result<(), GatewayError> {
        self.info.update(&self.transport, &self.host).await?;
        let serial = self.info.serial.clone();

        let use_token = self.info.web_tokens
            && (token.is_some() || (username.is_some() && password.is_some()));

        let mut auth: Box<dyn GatewayAuth> = if use_token {
            let serial = serial.clone().ok_or_else(|| {
                GatewayError::Setup("identity document carried no serial number".to_string())
            })?;
            let mut auth = TokenAuth::new(self.host.clone(), serial, username, password);
            if let Some(token) = token {
                match auth.set_token(token) {
                    Ok(()) => {}
                    // A stored token that no longer parses is not fatal
                    // while the cloud path is still open.
                    Err(err) => warn!(%err, "discarding unusable stored token"),
                }
            }
            Box::new(auth)
        } else {
            // No account given means the built-in installer account
            // with its serial-derived password; that password is also
            // recomputed when "installer" is named explicitly.
            let username = username.unwrap_or_else(|| "installer".to_string());
            let password = match password {
                Some(password) if username != "installer" => password,
                _ => default_password(&username, serial.as_deref().unwrap_or_default())
                    .ok_or_else(|| {
                        GatewayError::AuthenticationRequired(format!(
                            "no password available for account '{username}'"
                        ))
                    })?,
            };
            Box::new(LegacyAuth::new(username, password))
        };

        auth.setup(&self.transport).await?;
        self.auth = Some(auth);

        let model = GatewayModel::classify(self.info.firmware.as_ref(), self.info.imeter);
        info!(
            model = model.verbose_name(),
            serial = serial.as_deref().unwrap_or("unknown"),
            "gateway detected"
        );

        let mut gateway = Gateway::new(model);
        self.probe(&mut gateway).await?;
        let gateway = match gateway.probe_transition() {
            Some(next) => gateway.transition_to(next),
            None => gateway,
        };
        self.gateway = Some(gateway);
        self.endpoints.clear();
        Ok(())
    }

    async fn probe(&mut self, gateway: &mut Gateway) -> Result<(), GatewayError> {
        for spec in gateway.probing_endpoints() {
            let url = self.device_url(spec.path);
            let response = self.get(&url).await?;
            let data = EndpointData::decode(&response, spec.path)?;
            gateway.state.store(spec.path, data);
        }
        gateway.run_probes();
        Ok(())
    }

    /// One polling cycle. The first cycle fetches every required
    /// endpoint regardless of TTL; later cycles only refresh expired
    /// ones. An authentication failure mid-cycle gets exactly one
    /// refresh-and-retry before it is surfaced.
    pub async fn update(&mut self) -> Result<(), GatewayError> {
        let mut gateway = self.gateway.take().ok_or_else(|| {
            GatewayError::AuthenticationRequired(
                "authenticate() has not been called".to_string(),
            )
        })?;

        let mut result = self.update_gateway(&mut gateway).await;
        if let Err(err) = &result {
            if err.is_auth_error() {
                warn!(%err, "authentication failed mid-update, refreshing once");
                match self.refresh_auth().await {
                    Ok(()) => result = self.update_gateway(&mut gateway).await,
                    Err(refresh_err) => result = Err(refresh_err),
                }
            }
        }

        self.gateway = Some(gateway);
        result
    }

    async fn update_gateway(&mut self, gateway: &mut Gateway) -> Result<(), GatewayError> {
        let force = !gateway.initial_update_finished;

        for spec in gateway.required_endpoints() {
            let due = force
                || self
                    .endpoints
                    .get(spec.path)
                    .map(Endpoint::update_required)
                    .unwrap_or(true);
            if !due {
                continue;
            }

            let url = self.device_url(spec.path);
            match self.get(&url).await {
                Ok(response) => match EndpointData::decode(&response, spec.path) {
                    Ok(data) => {
                        gateway.state.store(spec.path, data);
                        self.endpoints
                            .entry(spec.path.to_string())
                            .or_insert_with(|| Endpoint::new(spec.path, spec.cache_ttl))
                            .mark_fetched();
                        debug!(path = spec.path, "endpoint refreshed");
                    }
                    // An undecodable payload counts as no data; the
                    // previous payload and timestamp stay in place.
                    Err(err) => warn!(path = spec.path, %err, "discarding undecodable payload"),
                },
                Err(err) if err.is_auth_error() => return Err(err),
                // A single flaky endpoint should not starve the rest;
                // its previous payload stays in place.
                Err(err) => warn!(path = spec.path, %err, "endpoint fetch failed"),
            }
        }

        if !gateway.initial_update_finished {
            gateway.initial_update_finished = true;
        }
        Ok(())
    }

    async fn get(&mut self, url: &str) -> Result<HttpResponse, GatewayError> {
        self.request(url, true).await
    }

    /// Authenticated GET. On a 401 the active strategy gets one chance
    /// to recover before the retried request's 401 becomes fatal.
    async fn request(&mut self, url: &str, handle_401: bool) -> Result<HttpResponse, GatewayError> {
        let mut handle_401 = handle_401;
        loop {
            let mut request = HttpRequest::get(url).header("Accept", "application/json");
            if let Some(auth) = self.auth.as_mut() {
                for (name, value) in auth.headers() {
                    request = request.header(name, value);
                }
                let cookies = auth.cookies();
                if !cookies.is_empty() {
                    let cookie = cookies
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    request = request.header("Cookie", cookie);
                }
                if let Some(authorization) = auth.authorize(Method::Get, request_uri(url)) {
                    request = request.header("Authorization", authorization);
                }
            }

            let response = send_with_retry(&self.transport, request, self.config.request_attempts)
                .await
                .map_err(|err| GatewayError::GatewayCommunication(err.to_string()))?;

            if response.status == 401 {
                if handle_401 {
                    if let Some(auth) = self.auth.as_mut() {
                        auth.resolve_401(&self.transport, &response).await?;
                        handle_401 = false;
                        continue;
                    }
                }
                return Err(GatewayError::GatewayAuthentication(format!(
                    "request to {url} was rejected"
                )));
            }
            if !response.is_success() {
                return Err(GatewayError::GatewayCommunication(format!(
                    "request to {url} returned status {}",
                    response.status
                )));
            }
            return Ok(response);
        }
    }

    async fn refresh_auth(&mut self) -> Result<(), GatewayError> {
        match self.auth.as_mut() {
            Some(auth) => auth.refresh(&self.transport).await,
            None => Err(GatewayError::AuthenticationRequired(
                "no authentication strategy is active".to_string(),
            )),
        }
    }

    /// Proactive staleness check, intended for a slower timer than the
    /// update cycle. Returns whether a refresh was performed.
    pub async fn refresh_auth_if_stale(&mut self) -> Result<bool, GatewayError> {
        let Some(auth) = self.auth.as_mut() else {
            return Ok(false);
        };
        if auth.is_stale() {
            info!("authentication is stale, refreshing");
            auth.refresh(&self.transport).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// The full property surface plus identity, for reporting.
    pub fn snapshot(&self) -> Result<Snapshot, GatewayError> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            GatewayError::AuthenticationRequired(
                "authenticate() has not been called".to_string(),
            )
        })?;

        Ok(Snapshot {
            ts: Utc::now(),
            device: SnapshotDevice {
                host: self.host.clone(),
                model: gateway.model().verbose_name().to_string(),
                serial_number: self.info.serial.clone(),
                part_number: self.info.part.clone(),
                firmware_version: self.info.firmware.as_ref().map(|f| f.to_string()),
                token: self.token().map(String::from),
            },
            values: gateway.all_values(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uri_strips_scheme_and_host() {
        assert_eq!(
            request_uri("http://envoy.local/api/v1/production"),
            "/api/v1/production"
        );
        assert_eq!(request_uri("https://envoy.local/info"), "/info");
        assert_eq!(request_uri("https://envoy.local"), "/");
    }
}
