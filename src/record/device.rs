//! Device properties attached to session and install events.

use crate::record::types::Payload;

/// SDK name reported with every device property set.
pub const SDK_NAME: &str = "offline-tracker";

/// Static description of the host device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub os_name: String,
    pub device_model: String,
    pub device_type: String,
    pub sdk: String,
    pub sdk_version: String,
    pub app_version: Option<String>,
}

impl DeviceProperties {
    /// Detect properties of the current machine.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            os_name: std::env::consts::OS.to_string(),
            device_model: hostname,
            device_type: "desktop".to_string(),
            sdk: SDK_NAME.to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            app_version: None,
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("os_name".into(), self.os_name.as_str().into());
        payload.insert("device_model".into(), self.device_model.as_str().into());
        payload.insert("device_type".into(), self.device_type.as_str().into());
        payload.insert("sdk".into(), self.sdk.as_str().into());
        payload.insert("sdk_version".into(), self.sdk_version.as_str().into());
        if let Some(ref version) = self.app_version {
            payload.insert("app_version".into(), version.as_str().into());
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reports_sdk() {
        let device = DeviceProperties::detect();
        assert_eq!(device.sdk, SDK_NAME);
        assert!(!device.os_name.is_empty());

        let payload = device.with_app_version("2.1.0").to_payload();
        assert_eq!(payload.get("sdk").and_then(|v| v.as_str()), Some(SDK_NAME));
        assert_eq!(
            payload.get("app_version").and_then(|v| v.as_str()),
            Some("2.1.0")
        );
    }
}
