use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::GatewayError;
use crate::http::HttpResponse;

/// A device URL the reader polls, with its own cache lifetime.
///
/// Fast-moving endpoints (live power readings) carry a zero TTL and are
/// fetched every cycle; slow inventories are refreshed at most once per
/// TTL window.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub cache_ttl: Duration,
    last_fetch: Option<Instant>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            path: path.into(),
            cache_ttl,
            last_fetch: None,
        }
    }

    pub fn url(&self, protocol: &str, host: &str) -> String {
        format!("{protocol}://{host}/{}", self.path)
    }

    /// Whether the cached value has aged out. Never-fetched endpoints
    /// always require an update.
    pub fn update_required(&self) -> bool {
        match self.last_fetch {
            None => true,
            Some(at) => at + self.cache_ttl <= Instant::now(),
        }
    }

    pub fn mark_fetched(&mut self) {
        self.last_fetch = Some(Instant::now());
    }
}

/// A decoded endpoint payload. JSON responses are parsed once here so
/// extraction never re-parses; everything else is kept as text for the
/// regex descriptors.
#[derive(Debug, Clone)]
pub enum EndpointData {
    Json(Value),
    Text(String),
}

impl EndpointData {
    pub fn decode(response: &HttpResponse, path: &str) -> Result<Self, GatewayError> {
        let is_json = response
            .content_type()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        if is_json {
            let value = response.json().map_err(|err| GatewayError::Decode {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
            Ok(EndpointData::Json(value))
        } else {
            Ok(EndpointData::Text(response.text()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_always_requires_update() {
        let mut endpoint = Endpoint::new("production.json", Duration::ZERO);
        assert!(endpoint.update_required());
        endpoint.mark_fetched();
        assert!(endpoint.update_required());
    }

    #[test]
    fn long_ttl_suppresses_refetch() {
        let mut endpoint = Endpoint::new("ivp/ensemble/inventory", Duration::from_secs(50));
        endpoint.mark_fetched();
        assert!(!endpoint.update_required());
    }

    #[test]
    fn url_joins_protocol_host_and_path() {
        let endpoint = Endpoint::new("api/v1/production", Duration::ZERO);
        assert_eq!(
            endpoint.url("https", "envoy.local"),
            "https://envoy.local/api/v1/production"
        );
    }

    #[test]
    fn decode_parses_json_content_type() {
        let response = HttpResponse {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "application/json; charset=utf-8".to_string(),
            )],
            body: br#"{"wattsNow": 42}"#.to_vec(),
        };

        match EndpointData::decode(&response, "api/v1/production").unwrap() {
            EndpointData::Json(value) => assert_eq!(value["wattsNow"], 42),
            EndpointData::Text(_) => panic!("expected JSON"),
        }
    }

    #[test]
    fn decode_keeps_non_json_as_text() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: b"<td>1.2 kW</td>".to_vec(),
        };

        match EndpointData::decode(&response, "production").unwrap() {
            EndpointData::Text(text) => assert!(text.contains("kW")),
            EndpointData::Json(_) => panic!("expected text"),
        }
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: b"not json".to_vec(),
        };

        assert!(matches!(
            EndpointData::decode(&response, "ivp/meters"),
            Err(GatewayError::Decode { .. })
        ));
    }
}
