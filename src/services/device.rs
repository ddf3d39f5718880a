use super::settings::ConfigStore;
use anyhow::Result;
use log::warn;
use serde::Serialize;
use std::{fs, path::Path};

pub const API_VERSION: u32 = 8;

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub api_version: u32,
    pub app_version: &'static str,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "serverURL")]
    pub server_url: String,
    #[serde(rename = "groupname")]
    pub group_name: String,
    #[serde(rename = "devicename")]
    pub device_name: String,
    #[serde(rename = "deviceID")]
    pub device_id: u32,
    #[serde(rename = "saltID")]
    pub salt_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

pub struct DeviceService;

impl DeviceService {
    pub fn version() -> Version {
        Version {
            api_version: API_VERSION,
            app_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn info(store: &ConfigStore, minion_id: &Path) -> Result<DeviceInfo> {
        let device = store.device()?;
        let salt_id = Self::salt_id(minion_id);

        Ok(DeviceInfo {
            server_url: device.server,
            group_name: device.group,
            device_name: device.name,
            device_id: device.id,
            device_type: device_type(&salt_id),
            salt_id,
        })
    }

    /// Device model derived from the salt minion id, e.g. `tc2` for `tc2-1234`
    pub fn device_type(minion_id: &Path) -> String {
        device_type(&Self::salt_id(minion_id))
    }

    fn salt_id(minion_id: &Path) -> String {
        match fs::read_to_string(minion_id) {
            Ok(id) => id.trim().to_string(),
            Err(e) => {
                warn!("failed to read {minion_id:?}: {e}");
                String::new()
            }
        }
    }
}

fn device_type(salt_id: &str) -> String {
    let parts: Vec<&str> = salt_id.split('-').collect();
    if parts.len() < 2 {
        if !salt_id.is_empty() {
            warn!("failed to parse device type from salt id {salt_id:?}");
        }
        return String::new();
    }

    parts[..parts.len() - 1].join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_drops_the_serial() {
        assert_eq!(device_type("tc2-1234"), "tc2");
        assert_eq!(device_type("pi-dev-42"), "pi-dev");
        assert_eq!(device_type("1234"), "");
        assert_eq!(device_type(""), "");
    }

    #[test]
    fn info_combines_config_and_minion_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        let minion_id = dir.path().join("minion_id");
        fs::write(
            &config,
            "[device]\nid = 42\nname = \"kokako\"\ngroup = \"forest\"\nserver = \"https://api.cacophony.org.nz\"\n",
        )
        .unwrap();
        fs::write(&minion_id, "tc2-1234\n").unwrap();

        let info = DeviceService::info(&ConfigStore::new(config), &minion_id).unwrap();

        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({
                "serverURL": "https://api.cacophony.org.nz",
                "groupname": "forest",
                "devicename": "kokako",
                "deviceID": 42,
                "saltID": "tc2-1234",
                "type": "tc2",
            })
        );
    }

    #[test]
    fn version_reports_api_level() {
        let version = serde_json::to_value(DeviceService::version()).unwrap();

        assert_eq!(version["apiVersion"], 8);
        assert_eq!(version["appVersion"], env!("CARGO_PKG_VERSION"));
    }
}
