use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::http::{send_with_retry, HttpRequest, HttpTransport, TransportError};

/// Dotted firmware version, compared numerically component by component.
///
/// Raw strings carry a vendor prefix letter ("D7.0.88", "R3.9.36") that
/// is stripped before parsing. Shorter versions compare as if padded
/// with zeros, so "3.9" equals "3.9.0".
#[derive(Debug, Clone)]
pub struct FirmwareVersion(Vec<u32>);

impl FirmwareVersion {
    pub fn parse(raw: &str) -> Self {
        let digits_from = raw.find(|c: char| c.is_ascii_digit()).unwrap_or(raw.len());
        let parts = raw[digits_from..]
            .split('.')
            .map_while(|p| p.trim().parse::<u32>().ok())
            .collect();
        Self(parts)
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[derive(Debug, Deserialize)]
struct DeviceSection {
    sn: Option<String>,
    pn: Option<String>,
    software: Option<String>,
    imeter: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InfoDocument {
    device: Option<DeviceSection>,
    #[serde(rename = "web-tokens", default)]
    web_tokens: Option<bool>,
}

/// Identity facts read from the unauthenticated `/info` page.
///
/// The document barely changes over a device's life, so it is cached
/// for roughly a day and refreshed opportunistically.
#[derive(Debug)]
pub struct GatewayInfo {
    pub serial: Option<String>,
    pub part: Option<String>,
    pub firmware: Option<FirmwareVersion>,
    pub imeter: Option<bool>,
    pub web_tokens: bool,
    populated: bool,
    last_fetch: Option<Instant>,
    cache_ttl: Duration,
}

impl Default for GatewayInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayInfo {
    pub fn new() -> Self {
        Self {
            serial: None,
            part: None,
            firmware: None,
            imeter: None,
            web_tokens: false,
            populated: false,
            last_fetch: None,
            cache_ttl: Duration::from_secs(86_000),
        }
    }

    pub fn update_required(&self) -> bool {
        if !self.populated {
            return true;
        }
        match self.last_fetch {
            None => true,
            Some(at) => at + self.cache_ttl <= Instant::now(),
        }
    }

    /// Fetch and parse `/info`. Newer firmware serves it over HTTPS
    /// only; older firmware over HTTP only, so an unreachable HTTPS
    /// port falls back to plain HTTP before giving up.
    pub async fn update(
        &mut self,
        transport: &dyn HttpTransport,
        host: &str,
    ) -> Result<(), GatewayError> {
        if !self.update_required() {
            return Ok(());
        }

        let text = match self.fetch(transport, "https", host).await {
            Ok(text) => text,
            Err(TransportError::Timeout(_)) | Err(TransportError::Connect(_)) => {
                debug!(host, "https probe failed, retrying over http");
                self.fetch(transport, "http", host)
                    .await
                    .map_err(|err| GatewayError::GatewayCommunication(err.to_string()))?
            }
            Err(err) => return Err(GatewayError::GatewayCommunication(err.to_string())),
        };

        self.apply(&text)?;
        self.populated = true;
        self.last_fetch = Some(Instant::now());
        Ok(())
    }

    async fn fetch(
        &self,
        transport: &dyn HttpTransport,
        protocol: &str,
        host: &str,
    ) -> Result<String, TransportError> {
        let request = HttpRequest::get(format!("{protocol}://{host}/info"));
        let response = send_with_retry(transport, request, 3).await?;
        if !response.is_success() {
            return Err(TransportError::Other(format!(
                "info page returned status {}",
                response.status
            )));
        }
        Ok(response.text())
    }

    fn apply(&mut self, text: &str) -> Result<(), GatewayError> {
        let doc: InfoDocument = serde_xml_rs::from_str(text)
            .map_err(|err| GatewayError::Setup(format!("malformed info document: {err}")))?;

        match doc.device {
            Some(device) => {
                self.serial = device.sn;
                self.part = device.pn;
                self.firmware = device.software.as_deref().map(FirmwareVersion::parse);
                self.imeter = device.imeter;
            }
            None => warn!("info document carries no device section"),
        }
        self.web_tokens = doc.web_tokens.unwrap_or(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_XML: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<envoy_info>
  <time>1682344534</time>
  <device>
    <sn>122107000000</sn>
    <pn>800-00654-r08</pn>
    <software>D7.0.88</software>
    <euaid>4c8675</euaid>
    <seqnum>0</seqnum>
    <apiver>1</apiver>
    <imeter>true</imeter>
  </device>
  <web-tokens>true</web-tokens>
</envoy_info>"#;

    #[test]
    fn parses_device_section() {
        let mut info = GatewayInfo::new();
        info.apply(INFO_XML).unwrap();

        assert_eq!(info.serial.as_deref(), Some("122107000000"));
        assert_eq!(info.part.as_deref(), Some("800-00654-r08"));
        assert_eq!(info.firmware, Some(FirmwareVersion::parse("7.0.88")));
        assert_eq!(info.imeter, Some(true));
        assert!(info.web_tokens);
    }

    #[test]
    fn malformed_document_is_fatal() {
        let mut info = GatewayInfo::new();
        assert!(matches!(
            info.apply("<envoy_info><device>"),
            Err(GatewayError::Setup(_))
        ));
    }

    #[test]
    fn version_prefix_letter_is_stripped() {
        assert_eq!(
            FirmwareVersion::parse("R3.9.36"),
            FirmwareVersion::parse("3.9.36")
        );
        assert_eq!(FirmwareVersion::parse("D7.0.88").to_string(), "7.0.88");
    }

    #[test]
    fn versions_order_numerically_with_zero_padding() {
        let threshold = FirmwareVersion::parse("3.9.0");
        assert!(FirmwareVersion::parse("3.8.42") < threshold);
        assert!(FirmwareVersion::parse("3.17.3") > threshold);
        assert!(FirmwareVersion::parse("7.0.88") > threshold);
        assert_eq!(FirmwareVersion::parse("3.9"), threshold);
    }
}
