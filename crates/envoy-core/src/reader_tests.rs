use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde_json::json;

use crate::error::GatewayError;
use crate::gateway::GatewayModel;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::reader::GatewayReader;

const HOST: &str = "envoy.local";
const LOGIN_URL: &str = "https://enlighten.enphaseenergy.com/login/login.json";
const TOKENS_URL: &str = "https://entrez.enphaseenergy.com/tokens";

/// Canned-response transport. Each route holds a queue of responses;
/// the last response is repeated once the queue is down to one entry.
/// Unrouted URLs fail like a closed port, which is also how the
/// https-to-http identity fallback gets exercised.
#[derive(Clone, Default)]
struct FakeTransport {
    routes: Arc<Mutex<HashMap<String, VecDeque<HttpResponse>>>>,
    log: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self::default()
    }

    fn route(&self, url: &str, response: HttpResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    fn hits(&self, url: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.url == url).count()
    }

    fn last_request_to(&self, url: &str) -> Option<HttpRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.url == url)
            .cloned()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&request.url) {
            Some(queue) if queue.len() == 1 => Ok(queue.front().unwrap().clone()),
            Some(queue) => queue
                .pop_front()
                .ok_or_else(|| TransportError::Connect(format!("no route for {}", request.url))),
            None => Err(TransportError::Connect(format!(
                "no route for {}",
                request.url
            ))),
        }
    }
}

fn json_response(value: serde_json::Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: serde_json::to_vec(&value).unwrap(),
    }
}

fn text_response(content_type: &str, body: &str) -> HttpResponse {
    HttpResponse {
        status: 200,
        headers: vec![("content-type".to_string(), content_type.to_string())],
        body: body.as_bytes().to_vec(),
    }
}

fn status_response(status: u16, headers: Vec<(String, String)>) -> HttpResponse {
    HttpResponse {
        status,
        headers,
        body: Vec::new(),
    }
}

fn info_xml(software: &str, imeter: Option<bool>, web_tokens: bool) -> String {
    let imeter = imeter
        .map(|v| format!("<imeter>{v}</imeter>"))
        .unwrap_or_default();
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\n\
         <envoy_info>\n\
           <device>\n\
             <sn>122107001234</sn>\n\
             <pn>800-00654-r08</pn>\n\
             <software>{software}</software>\n\
             {imeter}\n\
           </device>\n\
           <web-tokens>{web_tokens}</web-tokens>\n\
         </envoy_info>"
    )
}

fn make_token(days_until_expiry: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let exp = (Utc::now() + Duration::days(days_until_expiry)).timestamp();
    let payload = URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&json!({"aud": "122107001234", "exp": exp})).unwrap());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

const PRODUCTION_HTML: &str = "<html><body><table>\n\
    <tr><td>Currently</td>\n <td> 6.63 kW</td></tr>\n\
    <tr><td>Today</td>\n <td> 53.6 kWh</td></tr>\n\
    <tr><td>Past Week</td>\n <td> 405 kWh</td></tr>\n\
    <tr><td>Since Installation</td>\n <td> 133 MWh</td></tr>\n\
    </table></body></html>";

#[tokio::test]
async fn legacy_firmware_reads_html_production_figures() {
    let transport = FakeTransport::new();
    // Old firmware has no https listener, so /info only answers on http.
    transport.route(
        &format!("http://{HOST}/info"),
        text_response("text/xml", &info_xml("R3.7.0", None, false)),
    );
    transport.route(
        &format!("http://{HOST}/production"),
        text_response("text/html", PRODUCTION_HTML),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader.authenticate(None, None, None).await.unwrap();
    assert_eq!(reader.model(), Some(GatewayModel::EnvoyLegacy));
    assert_eq!(reader.token(), None);

    reader.update().await.unwrap();
    reader.update().await.unwrap();

    assert_eq!(reader.property("production"), Some(json!(6630.0)));
    assert_eq!(reader.property("daily_production"), Some(json!(53600.0)));
    assert_eq!(reader.property("seven_days_production"), Some(json!(405000.0)));
    assert_eq!(reader.property("lifetime_production"), Some(json!(133000000.0)));
    // JSON-era properties are silently absent on this hardware.
    assert_eq!(reader.property("inverters"), None);
    assert_eq!(reader.property("consumption"), None);
}

#[tokio::test]
async fn valid_token_skips_the_cloud_entirely() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", Some(false), true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(
            200,
            vec![(
                "set-cookie".to_string(),
                "sessionId=abc123; Path=/".to_string(),
            )],
        ),
    );
    transport.route(
        &format!("https://{HOST}/api/v1/production"),
        json_response(json!({"wattsNow": 1200, "wattHoursToday": 900,
                             "wattHoursSevenDays": 6000, "wattHoursLifetime": 50000})),
    );

    let token = make_token(120);
    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(None, None, Some(token.clone()))
        .await
        .unwrap();

    assert_eq!(reader.model(), Some(GatewayModel::EnvoyS));
    assert_eq!(reader.token(), Some(token.as_str()));
    assert_eq!(transport.hits(LOGIN_URL), 0);

    // Ensemble endpoints are unrouted; their failures must not sink
    // the cycle.
    reader.update().await.unwrap();
    assert_eq!(reader.property("production"), Some(json!(1200)));

    let request = transport
        .last_request_to(&format!("https://{HOST}/api/v1/production"))
        .unwrap();
    let authorization = request
        .headers
        .iter()
        .find(|(k, _)| k == "Authorization")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(authorization, format!("Bearer {token}"));
    let cookie = request
        .headers
        .iter()
        .find(|(k, _)| k == "Cookie")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(cookie, "sessionId=abc123");
}

#[tokio::test]
async fn missing_token_is_fetched_through_the_cloud() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(LOGIN_URL, json_response(json!({"session_id": "sess-1"})));
    transport.route(TOKENS_URL, text_response("text/plain", &make_token(200)));
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(
            Some("owner@example.com".to_string()),
            Some("hunter2".to_string()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(transport.hits(LOGIN_URL), 1);
    assert_eq!(transport.hits(TOKENS_URL), 1);
    assert!(reader.token().is_some());
    assert_eq!(reader.model(), Some(GatewayModel::Envoy));
}

#[tokio::test]
async fn bad_cloud_credentials_surface_as_cloud_authentication() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(LOGIN_URL, status_response(401, Vec::new()));

    let mut reader = GatewayReader::new(HOST, transport);
    let err = reader
        .authenticate(
            Some("owner@example.com".to_string()),
            Some("wrong".to_string()),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CloudAuthentication));
}

#[tokio::test]
async fn slow_endpoints_are_fetched_once_across_cycles() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );
    transport.route(
        &format!("https://{HOST}/api/v1/production"),
        json_response(json!({"wattsNow": 800, "wattHoursToday": 100,
                             "wattHoursSevenDays": 700, "wattHoursLifetime": 9000})),
    );
    transport.route(
        &format!("https://{HOST}/api/v1/production/inverters"),
        json_response(json!([{"serialNumber": "482125", "lastReportWatts": 200}])),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(None, None, Some(make_token(120)))
        .await
        .unwrap();
    assert_eq!(reader.model(), Some(GatewayModel::Envoy));

    reader.update().await.unwrap();
    reader.update().await.unwrap();

    // Live production refreshes every cycle; the inverter inventory is
    // cached and only fetched during the first (forced) cycle.
    assert_eq!(transport.hits(&format!("https://{HOST}/api/v1/production")), 2);
    assert_eq!(
        transport.hits(&format!("https://{HOST}/api/v1/production/inverters")),
        1
    );

    let inverters = reader.property("inverters").unwrap();
    assert_eq!(inverters["482125"]["lastReportWatts"], 200);
}

#[tokio::test]
async fn metered_gateway_without_active_cts_transitions_at_probe_time() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", Some(true), true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );
    transport.route(
        &format!("https://{HOST}/ivp/meters"),
        json_response(json!([
            {"eid": 704643328, "state": "disabled", "measurementType": "production"},
            {"eid": 704643584, "state": "disabled", "measurementType": "net-consumption"},
        ])),
    );
    transport.route(
        &format!("https://{HOST}/production.json"),
        json_response(json!({
            "production": [
                {"type": "inverters", "activeCount": 4, "wNow": 1120.0,
                 "whToday": 4500.0, "whLifetime": 930000.0},
                {"type": "eim", "activeCount": 0, "wNow": 0.0},
            ],
            "consumption": [
                {"measurementType": "total-consumption", "activeCount": 1,
                 "wNow": 350.0, "whToday": 2100.0, "whLifetime": 81000.0},
            ],
        })),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(None, None, Some(make_token(120)))
        .await
        .unwrap();

    assert_eq!(reader.model(), Some(GatewayModel::EnvoySMeteredCtDisabled));

    reader.update().await.unwrap();
    assert_eq!(reader.property("production"), Some(json!(1120.0)));
    assert_eq!(reader.property("consumption"), Some(json!(350.0)));
    assert_eq!(reader.property("grid_power"), None);
    assert_eq!(reader.property("seven_days_production"), None);
}

#[tokio::test]
async fn legacy_401_is_answered_with_a_digest_retry() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("http://{HOST}/info"),
        text_response("text/xml", &info_xml("R3.7.0", None, false)),
    );
    let challenge = status_response(
        401,
        vec![(
            "www-authenticate".to_string(),
            "Digest realm=\"enphaseenergy.com\", qop=\"auth\", nonce=\"5e21bf\"".to_string(),
        )],
    );
    transport.route(&format!("http://{HOST}/production"), challenge);
    transport.route(
        &format!("http://{HOST}/production"),
        text_response("text/html", PRODUCTION_HTML),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader.authenticate(None, None, None).await.unwrap();
    reader.update().await.unwrap();

    assert_eq!(reader.property("production"), Some(json!(6630.0)));
    let retried = transport
        .last_request_to(&format!("http://{HOST}/production"))
        .unwrap();
    let authorization = retried
        .headers
        .iter()
        .find(|(k, _)| k == "Authorization")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(authorization.starts_with("Digest username=\"installer\""));
    assert!(authorization.contains("nonce=\"5e21bf\""));
}

#[tokio::test]
async fn legacy_account_defaults_honour_the_named_user() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("http://{HOST}/info"),
        text_response("text/xml", &info_xml("R3.7.0", None, false)),
    );
    let challenge = status_response(
        401,
        vec![(
            "www-authenticate".to_string(),
            "Digest realm=\"enphaseenergy.com\", qop=\"auth\", nonce=\"77aa02\"".to_string(),
        )],
    );
    transport.route(&format!("http://{HOST}/production"), challenge);
    transport.route(
        &format!("http://{HOST}/production"),
        text_response("text/html", PRODUCTION_HTML),
    );

    // The envoy account keeps its serial-prefix default; only a
    // missing username falls back to the installer account.
    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(Some("envoy".to_string()), None, None)
        .await
        .unwrap();
    reader.update().await.unwrap();

    let retried = transport
        .last_request_to(&format!("http://{HOST}/production"))
        .unwrap();
    let authorization = retried
        .headers
        .iter()
        .find(|(k, _)| k == "Authorization")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(authorization.starts_with("Digest username=\"envoy\""));
}

#[tokio::test]
async fn undecodable_payload_is_skipped_without_sinking_the_cycle() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );
    // Claims to be JSON but is not.
    transport.route(
        &format!("https://{HOST}/api/v1/production"),
        text_response("application/json", "not json at all"),
    );
    transport.route(
        &format!("https://{HOST}/api/v1/production/inverters"),
        json_response(json!([{"serialNumber": "482125", "lastReportWatts": 200}])),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(None, None, Some(make_token(120)))
        .await
        .unwrap();

    reader.update().await.unwrap();

    // The broken endpoint yields no data, the healthy one still does.
    assert_eq!(reader.property("production"), None);
    assert_eq!(
        transport.hits(&format!("https://{HOST}/api/v1/production/inverters")),
        1
    );
    let inverters = reader.property("inverters").unwrap();
    assert_eq!(inverters["482125"]["lastReportWatts"], 200);
}

#[tokio::test]
async fn persistent_401_is_fatal_after_one_recovery_attempt() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("http://{HOST}/info"),
        text_response("text/xml", &info_xml("R3.7.0", None, false)),
    );
    let challenge = status_response(
        401,
        vec![(
            "www-authenticate".to_string(),
            "Digest realm=\"enphaseenergy.com\", qop=\"auth\", nonce=\"5e21bf\"".to_string(),
        )],
    );
    transport.route(&format!("http://{HOST}/production"), challenge.clone());
    transport.route(&format!("http://{HOST}/production"), challenge);

    let mut reader = GatewayReader::new(HOST, transport);
    reader.authenticate(None, None, None).await.unwrap();

    let err = reader.update().await.unwrap_err();
    assert!(matches!(err, GatewayError::GatewayAuthentication(_)));
}

#[tokio::test]
async fn rejected_token_triggers_one_reauthentication_during_update() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );
    transport.route(LOGIN_URL, json_response(json!({"session_id": "sess-2"})));
    transport.route(TOKENS_URL, text_response("text/plain", &make_token(200)));

    let production_url = format!("https://{HOST}/api/v1/production");
    transport.route(&production_url, status_response(401, Vec::new()));
    transport.route(&production_url, status_response(401, Vec::new()));
    transport.route(
        &production_url,
        json_response(json!({"wattsNow": 640, "wattHoursToday": 80,
                             "wattHoursSevenDays": 500, "wattHoursLifetime": 7000})),
    );

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(
            Some("owner@example.com".to_string()),
            Some("hunter2".to_string()),
            Some(make_token(120)),
        )
        .await
        .unwrap();
    assert_eq!(transport.hits(LOGIN_URL), 0);

    reader.update().await.unwrap();

    assert_eq!(transport.hits(LOGIN_URL), 1);
    assert_eq!(reader.property("production"), Some(json!(640)));
}

#[tokio::test]
async fn stale_token_is_refreshed_proactively() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("https://{HOST}/info"),
        text_response("text/xml", &info_xml("D7.0.88", None, true)),
    );
    transport.route(
        &format!("https://{HOST}/auth/check_jwt"),
        status_response(200, Vec::new()),
    );
    transport.route(LOGIN_URL, json_response(json!({"session_id": "sess-3"})));
    transport.route(TOKENS_URL, text_response("text/plain", &make_token(200)));

    let mut reader = GatewayReader::new(HOST, transport.clone());
    reader
        .authenticate(
            Some("owner@example.com".to_string()),
            Some("hunter2".to_string()),
            Some(make_token(10)),
        )
        .await
        .unwrap();

    assert!(reader.refresh_auth_if_stale().await.unwrap());
    assert_eq!(transport.hits(LOGIN_URL), 1);
    // The fresh token is well clear of the staleness window.
    assert!(!reader.refresh_auth_if_stale().await.unwrap());
    assert_eq!(transport.hits(LOGIN_URL), 1);
}

#[tokio::test]
async fn update_before_authenticate_is_rejected() {
    let mut reader = GatewayReader::new(HOST, FakeTransport::new());
    let err = reader.update().await.unwrap_err();
    assert!(matches!(err, GatewayError::AuthenticationRequired(_)));
    assert!(matches!(
        reader.snapshot().unwrap_err(),
        GatewayError::AuthenticationRequired(_)
    ));
}

#[tokio::test]
async fn snapshot_reports_identity_and_full_property_surface() {
    let transport = FakeTransport::new();
    transport.route(
        &format!("http://{HOST}/info"),
        text_response("text/xml", &info_xml("R3.7.0", None, false)),
    );
    transport.route(
        &format!("http://{HOST}/production"),
        text_response("text/html", PRODUCTION_HTML),
    );

    let mut reader = GatewayReader::new(HOST, transport);
    reader.authenticate(None, None, None).await.unwrap();
    reader.update().await.unwrap();

    let snapshot = reader.snapshot().unwrap();
    assert_eq!(snapshot.device.serial_number.as_deref(), Some("122107001234"));
    assert_eq!(snapshot.device.firmware_version.as_deref(), Some("3.7.0"));
    assert_eq!(snapshot.device.token, None);
    assert_eq!(
        snapshot.values.len(),
        crate::gateway::AVAILABLE_PROPERTIES.len()
    );
    assert_eq!(snapshot.values["production"], Some(json!(6630.0)));
    assert_eq!(snapshot.values["consumption"], None);
}
