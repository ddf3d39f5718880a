use crate::{
    command::{self, CommandRunner},
    http_response::InputError,
};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use regex::Regex;
use serde::Serialize;
use std::{collections::BTreeMap, fs, path::Path, sync::LazyLock, time::Duration};

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_@:.][a-zA-Z0-9_@:.-]*$").expect("valid service name regex")
});

const KEEP_AWAKE_MINUTES: &str = "5";

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceStatus {
    pub enabled: bool,
    pub active: bool,
    /// Seconds since the main process started
    pub duration: u64,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryReading {
    pub time: String,
    pub main_battery: String,
    pub rtc_battery: String,
}

pub struct SystemService;

impl SystemService {
    /// Last `lines` journal entries of `service`
    pub async fn logs<R>(runner: &R, service: &str, lines: Option<&str>) -> Result<Vec<String>>
    where
        R: CommandRunner + Sync,
    {
        validate_service(service)?;
        let lines = parse_int_field("lines", lines)?;

        let output = command::run(
            runner,
            "/bin/journalctl",
            &["-u", service, "--no-pager", "-n", &lines.to_string()],
        )
        .await
        .with_context(|| format!("failed to get logs of {service}"))?;

        let mut logs: Vec<String> = output.split('\n').map(str::to_string).collect();
        if logs.last().is_some_and(|line| line.is_empty()) {
            logs.pop();
        }

        Ok(logs)
    }

    pub async fn service_status<R>(runner: &R, service: &str) -> Result<ServiceStatus>
    where
        R: CommandRunner + Sync,
    {
        validate_service(service)?;

        // both exit non zero for the negative answer
        let enabled = runner.output("systemctl", &["is-enabled", service]).await?;
        let active = runner.output("systemctl", &["is-active", service]).await?;

        let mut status = ServiceStatus {
            enabled: enabled.stdout.trim() == "enabled",
            active: active.stdout.trim() == "active",
            duration: 0,
        };

        if !status.active {
            return Ok(status);
        }

        let pids = command::run(runner, "pidof", &[service])
            .await
            .with_context(|| format!("failed to get pid of {service}"))?;
        let Some(pid) = pids.split_whitespace().next() else {
            bail!("no process found for {service}");
        };
        pid.parse::<u32>()
            .with_context(|| format!("failed to parse pid {pid:?}"))?;

        let elapsed = command::run(runner, "ps", &["-p", pid, "-o", "etimes"])
            .await
            .with_context(|| format!("failed to get run time of {service}"))?;
        let elapsed = elapsed.trim().trim_start_matches("ELAPSED").trim();
        status.duration = elapsed
            .parse()
            .with_context(|| format!("failed to parse run time {elapsed:?}"))?;

        Ok(status)
    }

    pub async fn restart_service<R>(runner: &R, service: &str) -> Result<()>
    where
        R: CommandRunner + Sync,
    {
        validate_service(service)?;

        info!("restarting {service}");
        command::run(runner, "systemctl", &["restart", service])
            .await
            .with_context(|| format!("failed to restart {service}"))?;

        Ok(())
    }

    pub async fn reboot<R>(runner: &R, delay: Duration) -> Result<()>
    where
        R: CommandRunner + Sync,
    {
        info!("rebooting in {delay:?}");
        tokio::time::sleep(delay).await;

        command::run(runner, "/sbin/reboot", &[])
            .await
            .context("failed to reboot")?;

        Ok(())
    }

    /// Installed packages and their versions
    pub async fn packages<R>(runner: &R) -> Result<BTreeMap<String, String>>
    where
        R: CommandRunner + Sync,
    {
        let output = command::run(runner, "dpkg-query", &["-W", "-f=${Package}\\t${Version}\\n"])
            .await
            .context("failed to list packages")?;

        Ok(output
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(name, version)| (name.to_string(), version.trim().to_string()))
            .collect())
    }

    pub fn battery(battery_csv: &Path) -> Result<BatteryReading> {
        let content = fs::read_to_string(battery_csv)
            .with_context(|| format!("failed to read {battery_csv:?}"))?;
        let last_line = content.lines().last().unwrap_or_default();

        let parts: Vec<&str> = last_line.split(',').collect();
        let [time, main_battery, rtc_battery] = parts[..] else {
            bail!("unexpected format in battery-readings.csv");
        };

        Ok(BatteryReading {
            time: time.to_string(),
            main_battery: main_battery.to_string(),
            rtc_battery: rtc_battery.to_string(),
        })
    }

    /// Keep the camera from powering down while someone is using the api
    pub async fn keep_awake<R>(runner: &R)
    where
        R: CommandRunner + Sync,
    {
        if let Err(e) = command::run(runner, "stay-on-for", &[KEEP_AWAKE_MINUTES]).await {
            warn!("failed to keep camera awake: {e:#}");
        }
    }
}

fn validate_service(service: &str) -> Result<()> {
    if service.is_empty() {
        return Err(InputError::new("service field was empty").into());
    }
    if !SERVICE_NAME.is_match(service) {
        return Err(InputError::new(format!("invalid service name {service:?}")).into());
    }
    Ok(())
}

fn parse_int_field(field: &str, value: Option<&str>) -> Result<u32> {
    let value = value.unwrap_or_default();
    if value.is_empty() {
        return Err(InputError::new(format!("didn't find a value for '{field}'")).into());
    }

    value
        .parse()
        .map_err(|_| InputError::new(format!("failed to parse '{value}' to an int")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, testing::ScriptedRunner};

    mod logs {
        use super::*;

        #[tokio::test]
        async fn trailing_empty_line_is_dropped() {
            let runner = ScriptedRunner::default();
            runner.on(
                "/bin/journalctl -u thermal-recorder",
                CommandOutput::ok("first\nsecond\n"),
            );

            let logs = SystemService::logs(&runner, "thermal-recorder", Some("2"))
                .await
                .unwrap();

            assert_eq!(logs, vec!["first", "second"]);
            assert_eq!(
                runner.calls(),
                vec!["/bin/journalctl -u thermal-recorder --no-pager -n 2"]
            );
        }

        #[tokio::test]
        async fn missing_fields_are_input_errors() {
            let runner = ScriptedRunner::default();

            let err = SystemService::logs(&runner, "", Some("2")).await.unwrap_err();
            assert_eq!(err.to_string(), "service field was empty");

            let err = SystemService::logs(&runner, "tc2-agent", None)
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "didn't find a value for 'lines'");

            let err = SystemService::logs(&runner, "tc2-agent", Some("many"))
                .await
                .unwrap_err();
            assert!(err.downcast_ref::<InputError>().is_some());

            assert!(runner.calls().is_empty());
        }

        #[tokio::test]
        async fn option_like_service_names_are_rejected() {
            let runner = ScriptedRunner::default();

            let err = SystemService::logs(&runner, "--all", Some("2"))
                .await
                .unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_some());
        }
    }

    mod services {
        use super::*;

        #[tokio::test]
        async fn inactive_service_reports_no_duration() {
            let runner = ScriptedRunner::default();
            runner
                .on("systemctl is-enabled", CommandOutput::ok("enabled\n"))
                .on("systemctl is-active", CommandOutput::failed(3, ""));

            let status = SystemService::service_status(&runner, "modemd").await.unwrap();

            assert_eq!(
                status,
                ServiceStatus {
                    enabled: true,
                    active: false,
                    duration: 0
                }
            );
            assert_eq!(runner.count("pidof modemd"), 0);
        }

        #[tokio::test]
        async fn active_service_reports_elapsed_seconds() {
            let runner = ScriptedRunner::default();
            runner
                .on("systemctl is-enabled", CommandOutput::ok("disabled\n"))
                .on("systemctl is-active", CommandOutput::ok("active\n"))
                .on("pidof", CommandOutput::ok("812\n"))
                .on("ps -p 812", CommandOutput::ok("ELAPSED\n   3605\n"));

            let status = SystemService::service_status(&runner, "tc2-agent")
                .await
                .unwrap();

            assert!(!status.enabled);
            assert!(status.active);
            assert_eq!(status.duration, 3605);
        }

        #[tokio::test]
        async fn restart_runs_systemctl() {
            let runner = ScriptedRunner::default();

            SystemService::restart_service(&runner, "thermal-recorder")
                .await
                .unwrap();

            assert_eq!(runner.calls(), vec!["systemctl restart thermal-recorder"]);
        }

        #[tokio::test]
        async fn failed_restart_is_an_error() {
            let runner = ScriptedRunner::default();
            runner.on(
                "systemctl restart",
                CommandOutput::failed(5, "Unit nope.service not found."),
            );

            let err = SystemService::restart_service(&runner, "nope")
                .await
                .unwrap_err();

            assert!(err.downcast_ref::<InputError>().is_none());
        }
    }

    #[tokio::test]
    async fn packages_are_split_on_tabs() {
        let runner = ScriptedRunner::default();
        runner.on(
            "dpkg-query",
            CommandOutput::ok("tc2-agent\t0.5.1\nthermal-recorder\t2.22.0\nbroken\n"),
        );

        let packages = SystemService::packages(&runner).await.unwrap();

        assert_eq!(packages.len(), 2);
        assert_eq!(packages["thermal-recorder"], "2.22.0");
    }

    #[test]
    fn battery_uses_last_reading() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("battery-readings.csv");
        fs::write(
            &csv,
            "2024-03-01 10:00:00,3.9,3.0\n2024-03-01 10:10:00,3.8,3.0\n",
        )
        .unwrap();

        let reading = SystemService::battery(&csv).unwrap();

        assert_eq!(reading.time, "2024-03-01 10:10:00");
        assert_eq!(reading.main_battery, "3.8");
        assert_eq!(
            serde_json::to_value(&reading).unwrap()["rtcBattery"],
            "3.0"
        );
    }

    #[test]
    fn malformed_battery_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("battery-readings.csv");
        fs::write(&csv, "2024-03-01 10:00:00,3.9\n").unwrap();

        let err = SystemService::battery(&csv).unwrap_err();

        assert_eq!(err.to_string(), "unexpected format in battery-readings.csv");
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_waits_for_delay() {
        let runner = ScriptedRunner::default();
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { SystemService::reboot(&runner, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runner.count("/sbin/reboot"), 0);

        task.await.unwrap().unwrap();
        assert_eq!(runner.count("/sbin/reboot"), 1);
    }
}
