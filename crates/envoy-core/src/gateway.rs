//! Gateway variants and their property tables.
//!
//! Each hardware/firmware generation exposes a different API surface.
//! A variant is a table of bindings from logical property name to the
//! endpoint that feeds it and the extraction that reads it, composed by
//! overlaying the more capable generations on top of the basic ones.
//! The property surface itself is uniform; asking a variant for a
//! property it does not define answers `None`, never an error.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::descriptors::{resolve_json_path, resolve_regex};
use crate::endpoint::EndpointData;
use crate::info::FirmwareVersion;

pub const PRODUCTION_HTML: &str = "production";
pub const API_V1_PRODUCTION: &str = "api/v1/production";
pub const API_V1_INVERTERS: &str = "api/v1/production/inverters";
pub const PRODUCTION_JSON: &str = "production.json";
pub const IVP_METERS: &str = "ivp/meters";
pub const IVP_METERS_READINGS: &str = "ivp/meters/readings";
pub const ENSEMBLE_INVENTORY: &str = "ivp/ensemble/inventory";
pub const ENSEMBLE_POWER: &str = "ivp/ensemble/power";
pub const ENSEMBLE_SECCTRL: &str = "ivp/ensemble/secctrl";

const TTL_LIVE: Duration = Duration::ZERO;
const TTL_SLOW: Duration = Duration::from_secs(50);

/// Every logical property a gateway can be asked for, in report order.
pub const AVAILABLE_PROPERTIES: &[&str] = &[
    "production",
    "daily_production",
    "seven_days_production",
    "lifetime_production",
    "inverters",
    "ensemble_secctrl",
    "ensemble_inventory",
    "ensemble_power",
    "ac_battery",
    "grid_power",
    "grid_import",
    "grid_export",
    "lifetime_grid_net_import",
    "lifetime_grid_net_export",
    "consumption",
    "daily_consumption",
    "seven_days_consumption",
    "lifetime_consumption",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayModel {
    EnvoyLegacy,
    Envoy,
    EnvoyS,
    EnvoySMetered,
    EnvoySMeteredCtDisabled,
}

impl GatewayModel {
    pub fn verbose_name(&self) -> &'static str {
        match self {
            GatewayModel::EnvoyLegacy => "Envoy-R (legacy)",
            GatewayModel::Envoy => "Envoy-R",
            GatewayModel::EnvoyS => "Envoy-S Standard",
            GatewayModel::EnvoySMetered => "Envoy-S Metered",
            GatewayModel::EnvoySMeteredCtDisabled => "Envoy-S Metered without CTs",
        }
    }

    /// Pick the initial variant from identity facts. Probing may later
    /// demote a metered gateway whose CTs turn out to be disabled; that
    /// terminal variant is never chosen here.
    pub fn classify(firmware: Option<&FirmwareVersion>, imeter: Option<bool>) -> Self {
        let legacy_threshold = FirmwareVersion::parse("3.9.0");
        if let Some(fw) = firmware {
            if *fw < legacy_threshold {
                return GatewayModel::EnvoyLegacy;
            }
        }
        match imeter {
            Some(true) => GatewayModel::EnvoySMetered,
            Some(false) => GatewayModel::EnvoyS,
            None => GatewayModel::Envoy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSpec {
    pub path: &'static str,
    pub cache_ttl: Duration,
}

impl EndpointSpec {
    const fn new(path: &'static str, cache_ttl: Duration) -> Self {
        Self { path, cache_ttl }
    }
}

/// Probed CT meter configuration for metered gateways.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeterConfig {
    pub production_eid: Option<i64>,
    pub net_consumption_eid: Option<i64>,
    pub total_consumption_eid: Option<i64>,
}

/// Fetched payloads keyed by endpoint path, plus probe findings. This
/// is what survives a variant transition.
#[derive(Debug, Default)]
pub struct GatewayState {
    pub data: HashMap<String, EndpointData>,
    pub meters: MeterConfig,
}

impl GatewayState {
    pub fn store(&mut self, path: impl Into<String>, data: EndpointData) {
        self.data.insert(path.into(), data);
    }

    fn json(&self, path: &str) -> Option<&Value> {
        match self.data.get(path) {
            Some(EndpointData::Json(value)) => Some(value),
            _ => None,
        }
    }

    fn text(&self, path: &str) -> Option<&str> {
        match self.data.get(path) {
            Some(EndpointData::Text(text)) => Some(text),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
pub enum Extraction {
    /// Path expression over the endpoint's JSON payload.
    JsonPath(&'static str),
    /// Value/unit regex over the endpoint's HTML payload.
    Regex(&'static str),
    /// Anything needing probe results or cross-payload arithmetic.
    Computed(fn(&GatewayState) -> Option<Value>),
    /// Defined by a less capable variant but deliberately absent here.
    Unsupported,
}

#[derive(Clone, Copy)]
pub struct Binding {
    pub endpoint: Option<EndpointSpec>,
    pub extraction: Extraction,
}

impl Binding {
    const fn json(path: &'static str, ttl: Duration, expr: &'static str) -> Self {
        Self {
            endpoint: Some(EndpointSpec::new(path, ttl)),
            extraction: Extraction::JsonPath(expr),
        }
    }

    const fn regex(path: &'static str, pattern: &'static str) -> Self {
        Self {
            endpoint: Some(EndpointSpec::new(path, TTL_LIVE)),
            extraction: Extraction::Regex(pattern),
        }
    }

    const fn computed(path: &'static str, ttl: Duration, f: fn(&GatewayState) -> Option<Value>) -> Self {
        Self {
            endpoint: Some(EndpointSpec::new(path, ttl)),
            extraction: Extraction::Computed(f),
        }
    }

    const fn unsupported() -> Self {
        Self {
            endpoint: None,
            extraction: Extraction::Unsupported,
        }
    }
}

type BindingTable = Vec<(&'static str, Binding)>;

/// Later entries replace same-named earlier ones, mirroring subclass
/// override semantics.
fn overlay(mut base: BindingTable, over: BindingTable) -> BindingTable {
    for (name, binding) in over {
        match base.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = binding,
            None => base.push((name, binding)),
        }
    }
    base
}

fn legacy_bindings() -> BindingTable {
    vec![
        (
            "production",
            Binding::regex(
                PRODUCTION_HTML,
                r"<td>Currentl.*</td>\s+<td>\s*(\d+|\d+\.\d+)\s*(W|kW|MW)</td>",
            ),
        ),
        (
            "daily_production",
            Binding::regex(
                PRODUCTION_HTML,
                r"<td>Today</td>\s+<td>\s*(\d+|\d+\.\d+)\s*(Wh|kWh|MWh)</td>",
            ),
        ),
        (
            "seven_days_production",
            Binding::regex(
                PRODUCTION_HTML,
                r"<td>Past Week</td>\s+<td>\s*(\d+|\d+\.\d+)\s*(Wh|kWh|MWh)</td>",
            ),
        ),
        (
            "lifetime_production",
            Binding::regex(
                PRODUCTION_HTML,
                r"<td>Since Installation</td>\s+<td>\s*(\d+|\d+\.\d+)\s*(Wh|kWh|MWh)</td>",
            ),
        ),
    ]
}

fn envoy_bindings() -> BindingTable {
    vec![
        (
            "production",
            Binding::json(API_V1_PRODUCTION, TTL_LIVE, "wattsNow"),
        ),
        (
            "daily_production",
            Binding::json(API_V1_PRODUCTION, TTL_LIVE, "wattHoursToday"),
        ),
        (
            "seven_days_production",
            Binding::json(API_V1_PRODUCTION, TTL_LIVE, "wattHoursSevenDays"),
        ),
        (
            "lifetime_production",
            Binding::json(API_V1_PRODUCTION, TTL_LIVE, "wattHoursLifetime"),
        ),
        (
            "inverters",
            Binding::computed(API_V1_INVERTERS, TTL_SLOW, inverters_by_serial),
        ),
    ]
}

fn envoy_s_bindings() -> BindingTable {
    overlay(
        envoy_bindings(),
        vec![
            (
                "ensemble_secctrl",
                Binding::json(ENSEMBLE_SECCTRL, TTL_SLOW, ""),
            ),
            (
                "ensemble_inventory",
                Binding::computed(ENSEMBLE_INVENTORY, TTL_SLOW, encharge_by_serial),
            ),
            (
                "ensemble_power",
                Binding::json(ENSEMBLE_POWER, TTL_LIVE, "'devices:'"),
            ),
            (
                "ac_battery",
                Binding::json(PRODUCTION_JSON, TTL_LIVE, "storage[?(@.percentFull)]"),
            ),
        ],
    )
}

fn metered_bindings() -> BindingTable {
    overlay(
        envoy_s_bindings(),
        vec![
            (
                "production",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, metered_production),
            ),
            (
                "daily_production",
                Binding::json(
                    PRODUCTION_JSON,
                    TTL_LIVE,
                    "production[?(@.type=='eim' & @.activeCount > 0)].whToday",
                ),
            ),
            // Firmware reports wildly inaccurate rolling-week figures
            // on metered models, so the value is withheld.
            ("seven_days_production", Binding::unsupported()),
            (
                "lifetime_production",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, metered_lifetime_production),
            ),
            (
                "grid_power",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, grid_power),
            ),
            (
                "grid_import",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, grid_import),
            ),
            (
                "grid_export",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, grid_export),
            ),
            (
                "lifetime_grid_net_import",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, lifetime_grid_net_import),
            ),
            (
                "lifetime_grid_net_export",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, lifetime_grid_net_export),
            ),
            (
                "consumption",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, metered_consumption),
            ),
            (
                "daily_consumption",
                Binding::json(
                    PRODUCTION_JSON,
                    TTL_LIVE,
                    "consumption[?(@.measurementType == 'total-consumption' & @.activeCount > 0)].whToday",
                ),
            ),
            ("seven_days_consumption", Binding::unsupported()),
            (
                "lifetime_consumption",
                Binding::computed(IVP_METERS_READINGS, TTL_LIVE, metered_lifetime_consumption),
            ),
        ],
    )
}

fn ct_disabled_bindings() -> BindingTable {
    overlay(
        envoy_s_bindings(),
        vec![
            (
                "production",
                Binding::computed(PRODUCTION_JSON, TTL_LIVE, fallback_production),
            ),
            (
                "daily_production",
                Binding::computed(PRODUCTION_JSON, TTL_LIVE, fallback_daily_production),
            ),
            ("seven_days_production", Binding::unsupported()),
            (
                "lifetime_production",
                Binding::computed(PRODUCTION_JSON, TTL_LIVE, fallback_lifetime_production),
            ),
            (
                "consumption",
                Binding::json(
                    PRODUCTION_JSON,
                    TTL_LIVE,
                    "consumption[?(@.measurementType == 'total-consumption' & @.activeCount > 0)].wNow",
                ),
            ),
            (
                "daily_consumption",
                Binding::json(
                    PRODUCTION_JSON,
                    TTL_LIVE,
                    "consumption[?(@.measurementType == 'total-consumption' & @.activeCount > 0)].whToday",
                ),
            ),
            ("seven_days_consumption", Binding::unsupported()),
            (
                "lifetime_consumption",
                Binding::json(
                    PRODUCTION_JSON,
                    TTL_LIVE,
                    "consumption[?(@.measurementType == 'total-consumption' & @.activeCount > 0)].whLifetime",
                ),
            ),
        ],
    )
}

fn inverters_by_serial(state: &GatewayState) -> Option<Value> {
    let list = state.json(API_V1_INVERTERS)?.as_array()?;
    if list.is_empty() {
        return None;
    }
    let mut by_serial = Map::new();
    for inverter in list {
        if let Some(serial) = inverter.get("serialNumber").and_then(Value::as_str) {
            by_serial.insert(serial.to_string(), inverter.clone());
        }
    }
    Some(Value::Object(by_serial))
}

fn encharge_by_serial(state: &GatewayState) -> Option<Value> {
    let doc = state.json(ENSEMBLE_INVENTORY)?;
    let devices = resolve_json_path("$[?(@.type=='ENCHARGE')].devices", doc)?;
    let list = devices.as_array()?;
    if list.is_empty() {
        return None;
    }
    let mut by_serial = Map::new();
    for device in list {
        if let Some(serial) = device.get("serial_num").and_then(Value::as_str) {
            by_serial.insert(serial.to_string(), device.clone());
        }
    }
    Some(Value::Object(by_serial))
}

fn reading_field(state: &GatewayState, eid: i64, field: &str) -> Option<Value> {
    let doc = state.json(IVP_METERS_READINGS)?;
    resolve_json_path(&format!("$[?(@.eid=={eid})].{field}"), doc)
}

fn metered_production(state: &GatewayState) -> Option<Value> {
    reading_field(state, state.meters.production_eid?, "activePower")
}

fn metered_lifetime_production(state: &GatewayState) -> Option<Value> {
    reading_field(state, state.meters.production_eid?, "actEnergyDlvd")
}

fn grid_power(state: &GatewayState) -> Option<Value> {
    reading_field(state, state.meters.net_consumption_eid?, "activePower")
}

fn grid_import(state: &GatewayState) -> Option<Value> {
    let power = grid_power(state)?.as_f64()?;
    Some(Value::from(if power > 0.0 { power } else { 0.0 }))
}

fn grid_export(state: &GatewayState) -> Option<Value> {
    let power = grid_power(state)?.as_f64()?;
    Some(Value::from(if power < 0.0 { -power } else { 0.0 }))
}

fn lifetime_grid_net_import(state: &GatewayState) -> Option<Value> {
    reading_field(state, state.meters.net_consumption_eid?, "actEnergyDlvd")
}

fn lifetime_grid_net_export(state: &GatewayState) -> Option<Value> {
    reading_field(state, state.meters.net_consumption_eid?, "actEnergyRcvd")
}

// With a net CT the house load is production plus the (signed) grid
// power; with only a total-consumption CT it is read directly.
fn metered_consumption(state: &GatewayState) -> Option<Value> {
    if let Some(eid) = state.meters.net_consumption_eid {
        let production = metered_production(state)?.as_f64()?;
        let net = reading_field(state, eid, "activePower")?.as_f64()?;
        return Some(Value::from(production + net));
    }
    if let Some(eid) = state.meters.total_consumption_eid {
        return reading_field(state, eid, "activePower");
    }
    None
}

fn metered_lifetime_consumption(state: &GatewayState) -> Option<Value> {
    if let Some(eid) = state.meters.net_consumption_eid {
        let production = metered_lifetime_production(state)?.as_f64()?;
        let exported = reading_field(state, eid, "actEnergyRcvd")?.as_f64()?;
        let imported = reading_field(state, eid, "actEnergyDlvd")?.as_f64()?;
        return Some(Value::from(production - (exported - imported)));
    }
    if let Some(eid) = state.meters.total_consumption_eid {
        return reading_field(state, eid, "actEnergyRcvd");
    }
    None
}

// A CT-disabled gateway with a configured-but-inactive production
// meter still reports through the "eim" block; one with no production
// meter at all reports through the inverter aggregate.
fn production_source(state: &GatewayState) -> &'static str {
    if state.meters.production_eid.is_some() {
        "eim"
    } else {
        "inverters"
    }
}

fn fallback_field(state: &GatewayState, field: &str) -> Option<Value> {
    let doc = state.json(PRODUCTION_JSON)?;
    let expr = format!(
        "production[?(@.type=='{}' & @.activeCount > 0)].{field}",
        production_source(state)
    );
    resolve_json_path(&expr, doc)
}

fn fallback_production(state: &GatewayState) -> Option<Value> {
    fallback_field(state, "wNow")
}

fn fallback_daily_production(state: &GatewayState) -> Option<Value> {
    fallback_field(state, "whToday")
}

fn fallback_lifetime_production(state: &GatewayState) -> Option<Value> {
    fallback_field(state, "whLifetime")
}

fn meters_probe(state: &mut GatewayState) {
    let doc = match state.json(IVP_METERS) {
        Some(doc) => doc.clone(),
        None => return,
    };
    let eid_for = |measurement: &str| {
        resolve_json_path(
            &format!("$[?(@.state=='enabled' & @.measurementType=='{measurement}')].eid"),
            &doc,
        )
        .and_then(|v| v.as_i64())
    };
    state.meters.production_eid = eid_for("production");
    state.meters.net_consumption_eid = eid_for("net-consumption");
    state.meters.total_consumption_eid = eid_for("total-consumption");
    debug!(
        production = ?state.meters.production_eid,
        net_consumption = ?state.meters.net_consumption_eid,
        total_consumption = ?state.meters.total_consumption_eid,
        "meter probe finished"
    );
}

pub struct Probe {
    pub endpoint: EndpointSpec,
    run: fn(&mut GatewayState),
}

/// One detected gateway: its variant's binding table plus the payloads
/// fetched so far.
pub struct Gateway {
    model: GatewayModel,
    bindings: BindingTable,
    probes: Vec<Probe>,
    pub state: GatewayState,
    pub initial_update_finished: bool,
    frozen_endpoints: Option<Vec<EndpointSpec>>,
}

impl Gateway {
    pub fn new(model: GatewayModel) -> Self {
        let bindings = match model {
            GatewayModel::EnvoyLegacy => legacy_bindings(),
            GatewayModel::Envoy => envoy_bindings(),
            GatewayModel::EnvoyS => envoy_s_bindings(),
            GatewayModel::EnvoySMetered => metered_bindings(),
            GatewayModel::EnvoySMeteredCtDisabled => ct_disabled_bindings(),
        };
        let probes = match model {
            GatewayModel::EnvoySMetered => vec![Probe {
                endpoint: EndpointSpec::new(IVP_METERS, TTL_LIVE),
                run: meters_probe,
            }],
            _ => Vec::new(),
        };
        Self {
            model,
            bindings,
            probes,
            state: GatewayState::default(),
            initial_update_finished: false,
            frozen_endpoints: None,
        }
    }

    pub fn model(&self) -> GatewayModel {
        self.model
    }

    /// Look up one logical property. Unknown or unsupported names
    /// answer `None`.
    pub fn property(&self, name: &str) -> Option<Value> {
        let binding = self
            .bindings
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| b)?;

        match binding.extraction {
            Extraction::Unsupported => None,
            Extraction::Computed(f) => f(&self.state),
            Extraction::JsonPath(expr) => {
                let path = binding.endpoint?.path;
                resolve_json_path(expr, self.state.json(path)?)
            }
            Extraction::Regex(pattern) => {
                let path = binding.endpoint?.path;
                resolve_regex(pattern, self.state.text(path)?).map(Value::from)
            }
        }
    }

    /// The full property surface, `None` for everything the variant
    /// does not provide.
    pub fn all_values(&self) -> BTreeMap<String, Option<Value>> {
        AVAILABLE_PROPERTIES
            .iter()
            .map(|name| (name.to_string(), self.property(name)))
            .collect()
    }

    /// Endpoints the update cycle must poll, deduplicated by path with
    /// the shortest TTL winning. After the initial update, endpoints
    /// whose every dependent property came back empty are dropped for
    /// good and the set is frozen.
    pub fn required_endpoints(&mut self) -> Vec<EndpointSpec> {
        if let Some(frozen) = &self.frozen_endpoints {
            return frozen.clone();
        }

        let mut merged: Vec<EndpointSpec> = Vec::new();
        for (name, binding) in &self.bindings {
            let Some(spec) = binding.endpoint else {
                continue;
            };
            if self.initial_update_finished && value_is_empty(&self.property(name)) {
                continue;
            }
            match merged.iter_mut().find(|e| e.path == spec.path) {
                Some(existing) => {
                    if spec.cache_ttl < existing.cache_ttl {
                        existing.cache_ttl = spec.cache_ttl;
                    }
                }
                None => merged.push(spec),
            }
        }

        if self.initial_update_finished {
            debug!(count = merged.len(), "froze required endpoint set");
            self.frozen_endpoints = Some(merged.clone());
        }
        merged
    }

    pub fn probing_endpoints(&self) -> Vec<EndpointSpec> {
        let mut out: Vec<EndpointSpec> = Vec::new();
        for probe in &self.probes {
            if !out.iter().any(|e| e.path == probe.endpoint.path) {
                out.push(probe.endpoint);
            }
        }
        out
    }

    pub fn run_probes(&mut self) {
        for probe in &self.probes {
            (probe.run)(&mut self.state);
        }
    }

    /// At most one capability transition, decided after probing: a
    /// metered gateway with no active production meter or no active
    /// consumption meter falls back to the CT-disabled variant.
    pub fn probe_transition(&self) -> Option<GatewayModel> {
        if self.model != GatewayModel::EnvoySMetered {
            return None;
        }
        let consumption = self
            .state
            .meters
            .net_consumption_eid
            .or(self.state.meters.total_consumption_eid);
        if self.state.meters.production_eid.is_none() || consumption.is_none() {
            Some(GatewayModel::EnvoySMeteredCtDisabled)
        } else {
            None
        }
    }

    /// Rebuild as another variant, carrying the fetched payloads and
    /// probe findings over.
    pub fn transition_to(self, model: GatewayModel) -> Gateway {
        info!(
            from = self.model.verbose_name(),
            to = model.verbose_name(),
            "switching gateway variant"
        );
        let mut next = Gateway::new(model);
        next.state = self.state;
        next
    }
}

fn value_is_empty(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        _ => false,
    }
}
