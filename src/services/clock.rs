use crate::{
    agent_client::DeviceAgent,
    command::{self, CommandRunner},
    http_response::InputError,
};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use log::{error, info, warn};
use serde::Serialize;

const DATE_FORMAT_ARG: &str = "+%Y-%m-%dT%H:%M:%S%:z";
const HWCLOCK_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClockInfo {
    #[serde(rename = "RTCTimeUTC")]
    pub rtc_time_utc: String,
    #[serde(rename = "RTCTimeLocal")]
    pub rtc_time_local: String,
    pub system_time: String,
    #[serde(rename = "LowRTCBattery")]
    pub low_rtc_battery: bool,
    #[serde(rename = "RTCIntegrity")]
    pub rtc_integrity: bool,
    #[serde(rename = "NTPSynced")]
    pub ntp_synced: bool,
    pub timezone: String,
}

struct RtcState {
    time: DateTime<FixedOffset>,
    integrity: bool,
    low_battery: bool,
}

/// Real time clock and system time. TC2 cameras keep their RTC behind the
/// RTC agent, older cameras expose it to `hwclock`.
pub struct ClockService;

impl ClockService {
    pub async fn status<R, A>(runner: &R, agent: &A, is_tc2: bool) -> Result<ClockInfo>
    where
        R: CommandRunner + Sync,
        A: DeviceAgent + Sync,
    {
        let rtc = if is_tc2 {
            Self::agent_rtc(agent).await?
        } else {
            Self::hwclock_rtc(runner).await?
        };

        let date = command::run(runner, "date", &[DATE_FORMAT_ARG])
            .await
            .context("failed to read system time")?;
        let system_time = DateTime::parse_from_rfc3339(date.trim())
            .with_context(|| format!("failed to parse system time {:?}", date.trim()))?;

        let ntp_synced = command::run(runner, "timedatectl", &["status"])
            .await
            .context("failed to get ntp status")?
            .contains("synchronized: yes");

        Ok(ClockInfo {
            rtc_time_utc: format_time(&rtc.time.with_timezone(&Utc)),
            rtc_time_local: format_time(&rtc.time.with_timezone(&Local)),
            system_time: format_time(&system_time),
            low_rtc_battery: rtc.low_battery,
            rtc_integrity: rtc.integrity,
            ntp_synced,
            timezone: Self::timezone(runner).await,
        })
    }

    /// Apply a new timezone and set system time and RTC to `date`
    ///
    /// A failing timezone change is logged only.
    pub async fn set<R, A>(
        runner: &R,
        agent: &A,
        is_tc2: bool,
        date: &str,
        timezone: Option<&str>,
    ) -> Result<()>
    where
        R: CommandRunner + Sync,
        A: DeviceAgent + Sync,
    {
        if let Some(timezone) = timezone.filter(|tz| !tz.is_empty()) {
            info!("setting timezone to {timezone}");
            if let Err(e) = command::run(runner, "timedatectl", &["set-timezone", timezone]).await
            {
                error!("failed to set timezone: {e:#}");
            }
        }

        let date = DateTime::parse_from_rfc3339(date)
            .map_err(|e| InputError::new(format!("failed to parse date {date:?}: {e}")))?;
        let date = format_time(&date);

        if is_tc2 {
            return agent.set_rtc_time(date).await;
        }

        info!("setting system time to {date}");
        command::run(
            runner,
            "date",
            &[DATE_FORMAT_ARG, "--utc", &format!("--set={date}")],
        )
        .await
        .context("failed to set system time")?;

        command::run(runner, "hwclock", &["--systohc"])
            .await
            .context("failed to write rtc")?;

        Ok(())
    }

    async fn timezone<R>(runner: &R) -> String
    where
        R: CommandRunner + Sync,
    {
        match command::run(runner, "timedatectl", &["show", "-p", "Timezone", "--value"]).await {
            Ok(timezone) => timezone.trim().to_string(),
            Err(e) => {
                warn!("failed to get timezone: {e:#}");
                String::new()
            }
        }
    }

    async fn agent_rtc<A>(agent: &A) -> Result<RtcState>
    where
        A: DeviceAgent + Sync,
    {
        let rtc = agent.rtc_time().await?;
        let time = DateTime::parse_from_rfc3339(&rtc.time)
            .with_context(|| format!("failed to parse rtc time {:?}", rtc.time))?;

        Ok(RtcState {
            time,
            integrity: rtc.integrity,
            low_battery: false,
        })
    }

    async fn hwclock_rtc<R>(runner: &R) -> Result<RtcState>
    where
        R: CommandRunner + Sync,
    {
        let output = command::run(runner, "hwclock", &["--get"])
            .await
            .context("failed to read rtc")?;

        Ok(RtcState {
            time: parse_hwclock(output.trim())?,
            integrity: true,
            low_battery: false,
        })
    }
}

fn parse_hwclock(output: &str) -> Result<DateTime<FixedOffset>> {
    HWCLOCK_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(output, format).ok())
        .ok_or_else(|| anyhow!("failed to parse hwclock output {output:?}"))
}

fn format_time<Tz>(time: &DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent_client::{OffloadStatus, RtcTime, ThermalTestStatus},
        command::{CommandOutput, testing::ScriptedRunner},
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRtc {
        time: String,
        set: Mutex<Vec<String>>,
    }

    impl DeviceAgent for FakeRtc {
        async fn audio_status(&self) -> Result<i32> {
            Ok(0)
        }
        async fn test_audio(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn offload_status(&self) -> Result<OffloadStatus> {
            Ok(OffloadStatus::default())
        }
        async fn cancel_offload(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn thermal_test_status(&self) -> Result<ThermalTestStatus> {
            Ok(ThermalTestStatus::default())
        }
        async fn short_test_thermal_recording(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn long_test_thermal_recording(&self, _seconds: u64) -> Result<String> {
            Ok(String::new())
        }
        async fn prioritise_frame_serve(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn rtc_time(&self) -> Result<RtcTime> {
            Ok(RtcTime {
                time: self.time.clone(),
                integrity: true,
            })
        }
        async fn set_rtc_time(&self, time: String) -> Result<()> {
            self.set.lock().unwrap().push(time);
            Ok(())
        }
        async fn take_snapshot(&self) -> Result<()> {
            Ok(())
        }
        async fn take_test_recording(&self) -> Result<()> {
            Ok(())
        }
    }

    fn runner() -> ScriptedRunner {
        let runner = ScriptedRunner::default();
        runner
            .on("date +", CommandOutput::ok("2024-03-01T13:00:05+13:00\n"))
            .on(
                "timedatectl status",
                CommandOutput::ok("System clock synchronized: yes\n"),
            )
            .on(
                "timedatectl show",
                CommandOutput::ok("Pacific/Auckland\n"),
            )
            .on(
                "hwclock --get",
                CommandOutput::ok("2024-03-01 13:00:04.512345+13:00\n"),
            );
        runner
    }

    #[test]
    fn hwclock_output_is_parsed() {
        let time = parse_hwclock("2024-03-01 13:00:04.512345+13:00").unwrap();

        assert_eq!(format_time(&time.with_timezone(&Utc)), "2024-03-01T00:00:04Z");
        assert!(parse_hwclock("Fri 01 Mar 2024").is_err());
    }

    #[tokio::test]
    async fn status_reads_hwclock_on_older_cameras() {
        let runner = runner();

        let info = ClockService::status(&runner, &FakeRtc::default(), false)
            .await
            .unwrap();

        assert_eq!(info.rtc_time_utc, "2024-03-01T00:00:04Z");
        assert_eq!(info.system_time, "2024-03-01T13:00:05+13:00");
        assert!(info.ntp_synced);
        assert!(!info.low_rtc_battery);
        assert_eq!(info.timezone, "Pacific/Auckland");
    }

    #[tokio::test]
    async fn status_asks_rtc_agent_on_tc2() {
        let runner = runner();
        let agent = FakeRtc {
            time: "2024-03-01T00:00:09Z".to_string(),
            ..Default::default()
        };

        let info = ClockService::status(&runner, &agent, true).await.unwrap();

        assert_eq!(info.rtc_time_utc, "2024-03-01T00:00:09Z");
        assert!(info.rtc_integrity);
        assert_eq!(runner.count("hwclock --get"), 0);
    }

    #[tokio::test]
    async fn status_keys_match_clock_page() {
        let runner = runner();

        let info = ClockService::status(&runner, &FakeRtc::default(), false)
            .await
            .unwrap();
        let json = serde_json::to_value(&info).unwrap();

        for key in [
            "RTCTimeUTC",
            "RTCTimeLocal",
            "SystemTime",
            "LowRTCBattery",
            "RTCIntegrity",
            "NTPSynced",
            "Timezone",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn set_writes_system_time_and_rtc() {
        let runner = ScriptedRunner::default();

        ClockService::set(
            &runner,
            &FakeRtc::default(),
            false,
            "2024-03-01T00:00:00Z",
            Some("Pacific/Auckland"),
        )
        .await
        .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "timedatectl set-timezone Pacific/Auckland",
                "date +%Y-%m-%dT%H:%M:%S%:z --utc --set=2024-03-01T00:00:00Z",
                "hwclock --systohc",
            ]
        );
    }

    #[tokio::test]
    async fn set_on_tc2_goes_through_rtc_agent() {
        let runner = ScriptedRunner::default();
        let agent = FakeRtc::default();

        ClockService::set(&runner, &agent, true, "2024-03-01T13:00:00+13:00", None)
            .await
            .unwrap();

        assert_eq!(*agent.set.lock().unwrap(), vec!["2024-03-01T13:00:00+13:00"]);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn set_rejects_malformed_date() {
        let runner = ScriptedRunner::default();
        runner.on(
            "timedatectl set-timezone",
            CommandOutput::failed(1, "Invalid time zone"),
        );

        let err = ClockService::set(&runner, &FakeRtc::default(), false, "yesterday", Some("Mars"))
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<InputError>().is_some());
        assert_eq!(runner.calls(), vec!["timedatectl set-timezone Mars"]);
    }
}
