use crate::http_response::InputError;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_valid::Validate;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use toml::{Table, Value, value::Datetime};

pub const DEVICE: &str = "device";
pub const LOCATION: &str = "location";
pub const AUDIO_RECORDING: &str = "audio-recording";
pub const AUDIO: &str = "audio";
pub const THERMAL_RECORDER: &str = "thermal-recorder";

const SECTIONS: [&str; 5] = [DEVICE, LOCATION, AUDIO_RECORDING, AUDIO, THERMAL_RECORDER];

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub group: String,
    pub server: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate)]
#[serde(default)]
pub struct Location {
    #[validate(minimum = -90.0)]
    #[validate(maximum = 90.0)]
    pub latitude: f64,
    #[validate(minimum = -180.0)]
    #[validate(maximum = 180.0)]
    pub longitude: f64,
    #[validate(minimum = 0.0)]
    #[validate(maximum = 10000.0)]
    pub altitude: f64,
    #[validate(minimum = 0.0)]
    #[validate(maximum = 10000.0)]
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Datetime>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct AudioRecording {
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Audio {
    pub card: u32,
    pub volume_control: String,
}

impl Default for Audio {
    fn default() -> Self {
        Self {
            card: 0,
            volume_control: "PCM".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThermalRecorder {
    pub output_dir: PathBuf,
}

impl Default for ThermalRecorder {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/var/spool/cptv"),
        }
    }
}

/// Location as reported to clients, the timestamp as RFC 3339 in UTC
#[derive(Debug, PartialEq, Serialize)]
pub struct LocationView {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub timestamp: Option<String>,
}

impl From<Location> for LocationView {
    fn from(location: Location) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            altitude: location.altitude,
            accuracy: location.accuracy,
            timestamp: location.timestamp.map(|t| utc_rfc3339(&t)),
        }
    }
}

/// Device config file shared with the other daemons on the camera
///
/// Writes go through a temporary file and a rename so readers never see a
/// partially written file.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Table> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{:?} does not exist, using defaults", self.path);
                return Ok(Table::new());
            }
            Err(e) => return Err(e).context(format!("failed to read {:?}", self.path)),
        };

        toml::from_str(&content).context(format!("failed to parse {:?}", self.path))
    }

    /// Typed view of one section, missing keys take their default
    pub fn section<T>(&self, name: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.load()?.remove(name) {
            Some(value) => from_toml_value(&value)
                .with_context(|| format!("failed to read config section {name}")),
            None => Ok(T::default()),
        }
    }

    pub fn device(&self) -> Result<Device> {
        self.section(DEVICE)
    }

    pub fn location(&self) -> Result<Location> {
        self.section(LOCATION)
    }

    pub fn audio_recording(&self) -> Result<AudioRecording> {
        self.section(AUDIO_RECORDING)
    }

    pub fn audio(&self) -> Result<Audio> {
        self.section(AUDIO)
    }

    pub fn thermal_recorder(&self) -> Result<ThermalRecorder> {
        self.section(THERMAL_RECORDER)
    }

    /// Every known section with its current values and defaults
    ///
    /// Values are keyed by the camel case section name, defaults by the
    /// section name as it appears in the file.
    pub fn values_and_defaults(&self) -> Result<serde_json::Value> {
        let table = self.load()?;
        let mut values = serde_json::Map::new();
        let mut defaults = serde_json::Map::new();

        for section in SECTIONS {
            let default = default_section(section)?;
            let mut merged = default.clone();
            if let Some(Value::Table(current)) = table.get(section) {
                merged.extend(current.clone());
            }

            values.insert(to_camel_case(section), toml_to_json(&Value::Table(merged)));
            defaults.insert(section.to_string(), toml_to_json(&Value::Table(default)));
        }

        Ok(serde_json::json!({ "values": values, "defaults": defaults }))
    }

    /// Merge `values` into `section`, rejecting values the section cannot hold
    pub fn set_section(
        &self,
        section: &str,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        validate_section_name(section)?;

        self.modify(|table| {
            let mut current = match table.remove(section) {
                Some(Value::Table(current)) => current,
                _ => Table::new(),
            };

            for (key, value) in values {
                let value = Value::try_from(&value).map_err(|e| {
                    InputError::new(format!("invalid value for {section}.{key}: {e}"))
                })?;
                current.insert(key, value);
            }

            let current = Value::Table(current);
            validate_section(section, &current)?;
            table.insert(section.to_string(), current);

            Ok(())
        })
    }

    pub fn clear_section(&self, section: &str) -> Result<()> {
        if section.is_empty() {
            return Err(InputError::new("section field was empty").into());
        }

        info!("clearing config section {section}");
        self.modify(|table| {
            table.remove(section);
            Ok(())
        })
    }

    pub fn set_location(&self, location: Location) -> Result<()> {
        location
            .validate()
            .map_err(|e| InputError::new(format!("invalid location: {e}")))?;

        let value = to_toml_value(&location).context("failed to serialize location")?;
        self.modify(|table| {
            table.insert(LOCATION.to_string(), value);
            Ok(())
        })
    }

    pub fn set_audio_recording_enabled(&self, enabled: bool) -> Result<()> {
        self.set_section(
            AUDIO_RECORDING,
            serde_json::Map::from_iter([("enabled".to_string(), enabled.into())]),
        )
    }

    fn modify<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Table) -> Result<()>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("config write lock poisoned"))?;

        let mut table = self.load()?;
        change(&mut table)?;

        let content = toml::to_string(&table).context("failed to serialize config")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).context(format!("failed to write {tmp:?}"))?;
        fs::rename(&tmp, &self.path).context(format!("failed to replace {:?}", self.path))
    }
}

/// Convert a unix timestamp in milliseconds to a TOML datetime, second precision
pub fn datetime_from_millis(millis: i64) -> Result<Datetime> {
    let time = DateTime::<Utc>::from_timestamp(millis.div_euclid(1000), 0)
        .ok_or_else(|| InputError::new(format!("timestamp {millis} out of range")))?;

    time.to_rfc3339_opts(SecondsFormat::Secs, true)
        .parse()
        .context("failed to convert timestamp")
}

fn utc_rfc3339(datetime: &Datetime) -> String {
    let raw = datetime.to_string();
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(time) => time
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => raw,
    }
}

fn validate_section_name(section: &str) -> Result<()> {
    if section.is_empty() {
        return Err(InputError::new("section field was empty").into());
    }
    if !SECTIONS.contains(&section) {
        return Err(InputError::new(format!("unknown config section {section}")).into());
    }
    Ok(())
}

fn parse_section<T>(section: &str, value: &Value) -> Result<T>
where
    T: DeserializeOwned,
{
    from_toml_value(value)
        .map_err(|e| InputError::new(format!("invalid {section} section: {e:#}")).into())
}

fn validate_section(section: &str, value: &Value) -> Result<()> {
    match section {
        DEVICE => parse_section::<Device>(section, value).map(drop),
        LOCATION => parse_section::<Location>(section, value)?
            .validate()
            .map_err(|e| InputError::new(format!("invalid location: {e}")).into()),
        AUDIO_RECORDING => parse_section::<AudioRecording>(section, value).map(drop),
        AUDIO => parse_section::<Audio>(section, value).map(drop),
        THERMAL_RECORDER => parse_section::<ThermalRecorder>(section, value).map(drop),
        _ => Err(InputError::new(format!("unknown config section {section}")).into()),
    }
}

fn default_section(section: &str) -> Result<Table> {
    let value = match section {
        DEVICE => to_toml_value(&Device::default()),
        LOCATION => to_toml_value(&Location::default()),
        AUDIO_RECORDING => to_toml_value(&AudioRecording::default()),
        AUDIO => to_toml_value(&Audio::default()),
        THERMAL_RECORDER => to_toml_value(&ThermalRecorder::default()),
        _ => return Ok(Table::new()),
    }
    .with_context(|| format!("failed to serialize {section} defaults"))?;

    match value {
        Value::Table(table) => Ok(table),
        _ => Ok(Table::new()),
    }
}

/// Convert through TOML text, keeping datetimes native TOML datetimes
fn to_toml_value<T>(value: &T) -> Result<Value>
where
    T: Serialize,
{
    let text = toml::to_string(value)?;
    Ok(Value::Table(toml::from_str(&text)?))
}

fn from_toml_value<T>(value: &Value) -> Result<T>
where
    T: DeserializeOwned,
{
    let Value::Table(table) = value else {
        bail!("expected a table");
    };
    let text = toml::to_string(table)?;
    Ok(toml::from_str(&text)?)
}

fn toml_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::String(s) => s.clone().into(),
        Value::Integer(i) => (*i).into(),
        Value::Float(f) => (*f).into(),
        Value::Boolean(b) => (*b).into(),
        Value::Datetime(d) => utc_rfc3339(d).into(),
        Value::Array(values) => values.iter().map(toml_to_json).collect(),
        Value::Table(table) => table
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_json(v)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
    }
}

fn to_camel_case(section: &str) -> String {
    let mut parts = section.split('-');
    let mut camel = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            camel.extend(first.to_uppercase());
            camel.push_str(chars.as_str());
        }
    }
    camel
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(content: &str) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        (dir, ConfigStore::new(path))
    }

    fn location_values(latitude: f64) -> serde_json::Map<String, serde_json::Value> {
        serde_json::json!({ "latitude": latitude, "longitude": 172.6 })
            .as_object()
            .unwrap()
            .clone()
    }

    mod read {
        use super::*;

        #[test]
        fn missing_file_yields_defaults() {
            let dir = tempfile::tempdir().unwrap();
            let store = ConfigStore::new(dir.path().join("config.toml"));

            assert_eq!(store.audio().unwrap(), Audio::default());
            assert_eq!(
                store.thermal_recorder().unwrap().output_dir,
                PathBuf::from("/var/spool/cptv")
            );
        }

        #[test]
        fn device_section_is_parsed() {
            let (_dir, store) = store(
                "[device]\nid = 1234\nname = \"frog\"\ngroup = \"pond\"\nserver = \"https://api.cacophony.org.nz\"\n",
            );

            let device = store.device().unwrap();

            assert_eq!(device.id, 1234);
            assert_eq!(device.group, "pond");
        }

        #[test]
        fn values_are_merged_over_defaults() {
            let (_dir, store) = store("[audio]\ncard = 1\n[windows]\nstart-recording = \"-30m\"\n");

            let config = store.values_and_defaults().unwrap();

            assert_eq!(config["values"]["audio"]["card"], 1);
            assert_eq!(config["values"]["audio"]["volume-control"], "PCM");
            assert_eq!(config["defaults"]["audio"]["card"], 0);
            assert_eq!(
                config["values"]["thermalRecorder"]["output-dir"],
                "/var/spool/cptv"
            );
            assert!(config["values"].get("windows").is_none());
        }

        #[test]
        fn section_names_become_camel_case() {
            assert_eq!(to_camel_case("thermal-recorder"), "thermalRecorder");
            assert_eq!(to_camel_case("audio-recording"), "audioRecording");
            assert_eq!(to_camel_case("device"), "device");
        }
    }

    mod write {
        use super::*;

        #[test]
        fn set_section_keeps_other_keys_and_sections() {
            let (_dir, store) = store("[audio]\ncard = 1\n[windows]\npower-on = \"12:00\"\n");

            store
                .set_section(
                    AUDIO,
                    serde_json::json!({ "volume-control": "Speaker" })
                        .as_object()
                        .unwrap()
                        .clone(),
                )
                .unwrap();

            let table = store.load().unwrap();
            assert_eq!(table["audio"]["card"].as_integer(), Some(1));
            assert_eq!(table["audio"]["volume-control"].as_str(), Some("Speaker"));
            assert_eq!(table["windows"]["power-on"].as_str(), Some("12:00"));
        }

        #[test]
        fn set_section_rejects_unknown_section() {
            let (_dir, store) = store("");

            let err = store
                .set_section("modemd", serde_json::Map::new())
                .unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_some());
        }

        #[test]
        fn set_section_rejects_wrongly_typed_values() {
            let (_dir, store) = store("");

            let err = store
                .set_section(
                    AUDIO,
                    serde_json::json!({ "card": "first" })
                        .as_object()
                        .unwrap()
                        .clone(),
                )
                .unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_some());
            assert!(store.load().unwrap().is_empty());
        }

        #[test]
        fn set_section_validates_location_ranges() {
            let (_dir, store) = store("");

            store.set_section(LOCATION, location_values(-43.5)).unwrap();
            let err = store.set_section(LOCATION, location_values(91.0)).unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_some());
            assert_eq!(store.location().unwrap().latitude, -43.5);
        }

        #[test]
        fn clear_section_removes_it() {
            let (_dir, store) = store("[audio]\ncard = 1\n[device]\nid = 3\n");

            store.clear_section(AUDIO).unwrap();

            let table = store.load().unwrap();
            assert!(!table.contains_key("audio"));
            assert!(table.contains_key("device"));
        }

        #[test]
        fn audio_recording_flag_is_toggled() {
            let (_dir, store) = store("[audio-recording]\naudio-mode = \"AudioOnly\"\n");

            store.set_audio_recording_enabled(true).unwrap();

            assert!(store.audio_recording().unwrap().enabled);
            assert_eq!(
                store.load().unwrap()["audio-recording"]["audio-mode"].as_str(),
                Some("AudioOnly")
            );
        }
    }

    mod location {
        use super::*;

        #[test]
        fn location_is_stored_with_utc_timestamp() {
            let (_dir, store) = store("");
            let location = Location {
                latitude: -43.5,
                longitude: 172.6,
                altitude: 20.0,
                accuracy: 5.0,
                timestamp: Some(datetime_from_millis(1_700_000_000_123).unwrap()),
            };

            store.set_location(location).unwrap();

            let view = LocationView::from(store.location().unwrap());
            assert_eq!(view.timestamp.as_deref(), Some("2023-11-14T22:13:20Z"));
            assert_eq!(view.altitude, 20.0);
        }

        #[test]
        fn location_is_written_as_native_toml() {
            let (dir, store) = store("[device]\nid = 3\n");
            let location = Location {
                latitude: -43.5,
                longitude: 172.6,
                timestamp: Some(datetime_from_millis(1_700_000_000_000).unwrap()),
                ..Default::default()
            };

            store.set_location(location.clone()).unwrap();

            let content = fs::read_to_string(dir.path().join("config.toml")).unwrap();
            assert!(content.contains("timestamp = 2023-11-14T22:13:20Z"));
            assert!(content.contains("longitude = 172.6\n"));
            assert!(!content.contains("$__toml_private_datetime"));
            assert_eq!(store.location().unwrap(), location);
            assert_eq!(store.device().unwrap().id, 3);
        }

        #[test]
        fn hand_written_timestamp_is_read() {
            let (_dir, store) =
                store("[location]\nlatitude = -43.5\ntimestamp = 2023-11-14T22:13:20Z\n");

            let location = store.location().unwrap();

            assert_eq!(
                LocationView::from(location).timestamp.as_deref(),
                Some("2023-11-14T22:13:20Z")
            );
            let config = store.values_and_defaults().unwrap();
            assert_eq!(
                config["values"]["location"]["timestamp"],
                "2023-11-14T22:13:20Z"
            );
        }

        #[test]
        fn location_with_timestamp_accepts_section_updates() {
            let (_dir, store) =
                store("[location]\nlatitude = -43.5\ntimestamp = 2023-11-14T22:13:20Z\n");

            store.set_section(LOCATION, location_values(-41.0)).unwrap();

            let location = store.location().unwrap();
            assert_eq!(location.latitude, -41.0);
            assert!(location.timestamp.is_some());
        }

        #[test]
        fn out_of_range_location_is_rejected() {
            let (_dir, store) = store("");
            let location = Location {
                longitude: 181.0,
                ..Default::default()
            };

            let err = store.set_location(location).unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_some());
        }

        #[test]
        fn offset_timestamps_are_reported_in_utc() {
            let datetime: Datetime = "2024-03-01T13:00:00+13:00".parse().unwrap();

            assert_eq!(utc_rfc3339(&datetime), "2024-03-01T00:00:00Z");
        }
    }
}
