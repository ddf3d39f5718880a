#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use anyhow::{Context, Result};
use log::{debug, info};
#[cfg(feature = "mock")]
use mockall::automock;
use serde::Serialize;
use trait_variant::make;
use zbus::{Connection, proxy};

#[proxy(
    interface = "org.cacophony.TC2Agent",
    default_service = "org.cacophony.TC2Agent",
    default_path = "/org/cacophony/TC2Agent",
    gen_blocking = false
)]
trait Tc2Agent {
    #[zbus(name = "audiostatus")]
    fn audio_status(&self) -> zbus::Result<i32>;

    #[zbus(name = "testaudio")]
    fn test_audio(&self) -> zbus::Result<String>;

    /// `(is_offloading, percent, seconds, files_total, files_remaining,
    /// events_total, events_remaining)`
    #[zbus(name = "offloadstatus")]
    fn offload_status(&self) -> zbus::Result<(i32, i32, i32, i32, i32, i32, i32)>;

    #[zbus(name = "canceloffload")]
    fn cancel_offload(&self) -> zbus::Result<String>;

    /// `(mode, status)`
    #[zbus(name = "testthermalstatus")]
    fn test_thermal_status(&self) -> zbus::Result<(i32, i32)>;

    #[zbus(name = "shorttestthermalrecording")]
    fn short_test_thermal_recording(&self) -> zbus::Result<String>;

    #[zbus(name = "longtestthermalrecording")]
    fn long_test_thermal_recording(&self, seconds: u64) -> zbus::Result<String>;

    #[zbus(name = "prioritiseframeserve")]
    fn prioritise_frame_serve(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.cacophony.RTC",
    default_service = "org.cacophony.RTC",
    default_path = "/org/cacophony/RTC",
    gen_blocking = false
)]
trait Rtc {
    /// `(RFC 3339 time, clock integrity)`
    fn get_time(&self) -> zbus::Result<(String, bool)>;

    fn set_time(&self, time: &str) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.cacophony.thermalrecorder",
    default_service = "org.cacophony.thermalrecorder",
    default_path = "/org/cacophony/thermalrecorder",
    gen_blocking = false
)]
trait ThermalRecorder {
    fn take_snapshot(&self) -> zbus::Result<()>;

    fn take_test_recording(&self) -> zbus::Result<()>;
}

/// Progress of the recording offload from the RP2040
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OffloadStatus {
    pub offload_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<i32>,
    pub files_total: i32,
    pub files_remaining: i32,
    pub events_total: i32,
    pub events_remaining: i32,
}

impl OffloadStatus {
    /// Interpret the D-Bus reply, progress is only meaningful while offloading
    pub fn from_reply(reply: (i32, i32, i32, i32, i32, i32, i32)) -> Self {
        let (
            is_offloading,
            percent_complete,
            seconds_remaining,
            files_total,
            files_remaining,
            events_total,
            events_remaining,
        ) = reply;
        let offload_in_progress = is_offloading == 1;

        Self {
            offload_in_progress,
            seconds_remaining: offload_in_progress.then_some(seconds_remaining),
            percent_complete: offload_in_progress.then_some(percent_complete),
            files_total,
            files_remaining,
            events_total,
            events_remaining,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThermalTestStatus {
    pub mode: i32,
    pub status: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RtcTime {
    /// RFC 3339
    pub time: String,
    pub integrity: bool,
}

/// Recording hardware owned by the sibling agents on the system bus
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait DeviceAgent {
    async fn audio_status(&self) -> Result<i32>;
    async fn test_audio(&self) -> Result<String>;
    async fn offload_status(&self) -> Result<OffloadStatus>;
    async fn cancel_offload(&self) -> Result<String>;
    async fn thermal_test_status(&self) -> Result<ThermalTestStatus>;
    async fn short_test_thermal_recording(&self) -> Result<String>;
    async fn long_test_thermal_recording(&self, seconds: u64) -> Result<String>;
    async fn prioritise_frame_serve(&self) -> Result<String>;
    async fn rtc_time(&self) -> Result<RtcTime>;
    async fn set_rtc_time(&self, time: String) -> Result<()>;
    async fn take_snapshot(&self) -> Result<()>;
    async fn take_test_recording(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct DbusDeviceAgent {
    connection: Connection,
}

impl DbusDeviceAgent {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("failed to connect to system bus")?;

        Ok(Self { connection })
    }

    async fn tc2_agent(&self) -> Result<Tc2AgentProxy<'_>> {
        Tc2AgentProxy::new(&self.connection)
            .await
            .context("failed to create TC2Agent proxy")
    }

    async fn rtc(&self) -> Result<RtcProxy<'_>> {
        RtcProxy::new(&self.connection)
            .await
            .context("failed to create RTC proxy")
    }

    async fn thermal_recorder(&self) -> Result<ThermalRecorderProxy<'_>> {
        ThermalRecorderProxy::new(&self.connection)
            .await
            .context("failed to create thermalrecorder proxy")
    }
}

impl DeviceAgent for DbusDeviceAgent {
    async fn audio_status(&self) -> Result<i32> {
        self.tc2_agent()
            .await?
            .audio_status()
            .await
            .context("failed to get audio status")
    }

    async fn test_audio(&self) -> Result<String> {
        info!("requesting test audio recording");
        self.tc2_agent()
            .await?
            .test_audio()
            .await
            .context("failed to request test audio recording")
    }

    async fn offload_status(&self) -> Result<OffloadStatus> {
        let reply = self
            .tc2_agent()
            .await?
            .offload_status()
            .await
            .context("failed to request recording offload status")?;

        debug!("offload status: {reply:?}");

        Ok(OffloadStatus::from_reply(reply))
    }

    async fn cancel_offload(&self) -> Result<String> {
        self.tc2_agent()
            .await?
            .cancel_offload()
            .await
            .context("failed to cancel offload")
    }

    async fn thermal_test_status(&self) -> Result<ThermalTestStatus> {
        let (mode, status) = self
            .tc2_agent()
            .await?
            .test_thermal_status()
            .await
            .context("failed to get test thermal recording status")?;

        Ok(ThermalTestStatus { mode, status })
    }

    async fn short_test_thermal_recording(&self) -> Result<String> {
        self.tc2_agent()
            .await?
            .short_test_thermal_recording()
            .await
            .context("failed to request short test thermal recording")
    }

    async fn long_test_thermal_recording(&self, seconds: u64) -> Result<String> {
        info!("requesting {seconds}s test thermal recording");
        self.tc2_agent()
            .await?
            .long_test_thermal_recording(seconds)
            .await
            .context("failed to request long test thermal recording")
    }

    async fn prioritise_frame_serve(&self) -> Result<String> {
        self.tc2_agent()
            .await?
            .prioritise_frame_serve()
            .await
            .context("failed to prioritise frame serve")
    }

    async fn rtc_time(&self) -> Result<RtcTime> {
        let (time, integrity) = self
            .rtc()
            .await?
            .get_time()
            .await
            .context("failed to get rtc status")?;

        Ok(RtcTime { time, integrity })
    }

    async fn set_rtc_time(&self, time: String) -> Result<()> {
        info!("setting rtc time to {time}");
        self.rtc()
            .await?
            .set_time(&time)
            .await
            .context("failed to set rtc time")
    }

    async fn take_snapshot(&self) -> Result<()> {
        self.thermal_recorder()
            .await?
            .take_snapshot()
            .await
            .context("failed to take snapshot")
    }

    async fn take_test_recording(&self) -> Result<()> {
        self.thermal_recorder()
            .await?
            .take_test_recording()
            .await
            .context("failed to take test recording")
    }
}
