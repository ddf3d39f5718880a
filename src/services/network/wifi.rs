//! Client mode of the wireless interface driven through wpa_supplicant

use super::config_files;
use crate::{
    command::{self, CommandRunner},
    config::NetworkConfig,
    http_response::InputError,
};
use anyhow::{Context, Result, bail, ensure};
use ini::{Ini, ParseOption};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::Serialize;
use std::{fs, sync::Arc, sync::LazyLock};
use tokio::time::{Instant, sleep};

static QUALITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Quality=([0-9]+/[0-9]+)").expect("valid quality regex"));

static SIGNAL_LEVEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Signal level=(-?[0-9]+ dBm)").expect("valid signal regex"));

/// Networks the hotspot itself answers to, never removed on disconnect
const HOTSPOT_SSIDS: [&str; 2] = ["bushnet", "Bushnet"];

/// One cell of an `iwlist scan`
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScannedNetwork {
    #[serde(rename = "SSID", skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(rename = "Quality", skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(rename = "Signal Level", skip_serializing_if = "Option::is_none")]
    pub signal_level: Option<String>,
    #[serde(rename = "Security", skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

/// Network known to wpa_supplicant
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SavedNetwork {
    pub id: String,
    pub ssid: String,
}

/// Subset of `wpa_cli status` the daemon cares about
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WpaStatus {
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub wpa_state: Option<String>,
}

impl WpaStatus {
    pub fn parse(output: &str) -> Result<Self> {
        let status = Ini::load_from_str_opt(
            output,
            ParseOption {
                enabled_quote: false,
                enabled_escape: false,
                ..ParseOption::default()
            },
        )
        .context("failed to parse wpa_cli status")?;

        let general = status.general_section();
        let non_empty = |key: &str| {
            general
                .get(key)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            ssid: non_empty("ssid"),
            ip_address: non_empty("ip_address"),
            wpa_state: non_empty("wpa_state"),
        })
    }

    fn completed(&self) -> bool {
        self.wpa_state.as_deref() == Some("COMPLETED")
    }

    /// Associated and holding an address
    pub fn is_connected(&self) -> bool {
        self.completed() && self.ssid.is_some() && self.ip_address.is_some()
    }

    pub fn is_associated_with(&self, ssid: &str) -> bool {
        self.completed() && self.ssid.as_deref() == Some(ssid)
    }
}

pub fn parse_scan(output: &str) -> Vec<ScannedNetwork> {
    let mut networks = Vec::new();
    let mut current: Option<ScannedNetwork> = None;

    for line in output.lines() {
        if line.contains("Cell") {
            networks.extend(current.replace(ScannedNetwork::default()));
            continue;
        }

        let Some(network) = current.as_mut() else {
            continue;
        };

        if line.contains("ESSID:") {
            network.ssid = line.split('"').nth(1).map(str::to_string);
        } else if line.contains("Quality=") {
            network.quality = QUALITY.captures(line).map(|c| c[1].to_string());
            network.signal_level = SIGNAL_LEVEL.captures(line).map(|c| c[1].to_string());
        } else if line.contains("Encryption key:on") {
            network.security = Some("On".to_string());
        } else if line.contains("IE: IEEE 802.11i/WPA2") {
            network.security = Some("WPA2".to_string());
        } else if line.contains("IE: WPA Version 1") {
            network.security = Some("WPA".to_string());
        } else if line.contains("IE: Unknown") && network.security.is_none() {
            network.security = Some("Unknown".to_string());
        }
    }

    networks.extend(current);
    networks
}

/// Parse `wpa_cli list_networks`, skipping the header line
pub fn parse_saved_networks(output: &str) -> Vec<SavedNetwork> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let ssid = fields.next()?;
            (!id.is_empty()).then(|| SavedNetwork {
                id: id.to_string(),
                ssid: ssid.to_string(),
            })
        })
        .collect()
}

fn ssid_entry(ssid: &str) -> String {
    format!("ssid=\"{ssid}\"")
}

/// Append a network block for `ssid`
///
/// # Returns
/// `None` if a block for `ssid` is already present
pub fn add_network_block(content: &str, ssid: &str, psk: &str) -> Option<String> {
    if content.contains(&ssid_entry(ssid)) {
        return None;
    }

    Some(format!(
        "{content}\nnetwork={{\n    ssid=\"{ssid}\"\n    psk=\"{psk}\"\n}}"
    ))
}

/// Drop every network block mentioning `ssid`, other lines are kept verbatim
pub fn remove_network_block(content: &str, ssid: &str) -> String {
    let entry = ssid_entry(ssid);
    let mut lines: Vec<&str> = Vec::new();
    let mut block: Option<Vec<&str>> = None;

    for line in content.split('\n') {
        if line.contains("network={") {
            block = Some(vec![line]);
        } else if let Some(current) = block.as_mut() {
            current.push(line);
            if line.contains('}') {
                if !current.join("\n").contains(&entry) {
                    lines.extend(current.iter());
                }
                block = None;
            }
        } else {
            lines.push(line);
        }
    }

    lines.join("\n")
}

fn validate_ssid(ssid: &str) -> Result<()> {
    if ssid.is_empty() {
        return Err(InputError::new("ssid field was empty").into());
    }
    if ssid.contains(['"', '\n']) {
        return Err(InputError::new("ssid must not contain quotes or line breaks").into());
    }
    Ok(())
}

fn validate_psk(psk: &str) -> Result<()> {
    if psk.is_empty() {
        return Err(InputError::new("psk field was empty").into());
    }
    if !(8..=63).contains(&psk.len()) || psk.contains(['"', '\n']) {
        return Err(InputError::new(
            "psk must be 8 to 63 characters without quotes or line breaks",
        )
        .into());
    }
    Ok(())
}

/// Service for the wpa_supplicant side of the wireless interface
#[derive(Clone)]
pub struct WifiService<R> {
    runner: R,
    config: Arc<NetworkConfig>,
}

impl<R> WifiService<R>
where
    R: CommandRunner + Sync,
{
    pub fn new(runner: R, config: Arc<NetworkConfig>) -> Self {
        Self { runner, config }
    }

    async fn wpa_cli(&self, args: &[&str]) -> Result<String> {
        let mut full_args = vec!["-i", self.config.wifi_interface.as_str()];
        full_args.extend_from_slice(args);

        let stdout = command::run(&self.runner, "wpa_cli", &full_args).await?;

        // wpa_cli exits 0 even if wpa_supplicant rejected the request
        ensure!(
            stdout.trim() != "FAIL",
            "wpa_cli {} was rejected",
            args.join(" ")
        );

        Ok(stdout)
    }

    pub async fn scan(&self) -> Result<Vec<ScannedNetwork>> {
        let output = command::run(
            &self.runner,
            "iwlist",
            &[self.config.wifi_interface.as_str(), "scan"],
        )
        .await
        .context("failed to scan for Wi-Fi networks")?;

        let networks = parse_scan(&output);
        info!("found {} Wi-Fi networks", networks.len());

        Ok(networks)
    }

    pub async fn saved_networks(&self) -> Result<Vec<SavedNetwork>> {
        let output = self
            .wpa_cli(&["list_networks"])
            .await
            .context("failed to list saved Wi-Fi networks")?;

        Ok(parse_saved_networks(&output))
    }

    pub async fn status(&self) -> Result<WpaStatus> {
        let output = self
            .wpa_cli(&["status"])
            .await
            .context("failed to get wpa_supplicant status")?;

        WpaStatus::parse(&output)
    }

    pub async fn is_connected(&self) -> Result<bool> {
        let status = self.status().await?;

        if status.is_connected() {
            debug!(
                "connected to {:?} with address {:?}",
                status.ssid, status.ip_address
            );
        }

        Ok(status.is_connected())
    }

    /// SSID the interface is associated with, empty if none
    pub async fn current_network(&self) -> Result<String> {
        let output = self
            .runner
            .output("iwgetid", &[self.config.wifi_interface.as_str(), "-r"])
            .await?;

        // iwgetid exits non zero without output if the interface is not associated
        if !output.success() && output.stdout.is_empty() {
            return Ok(String::new());
        }

        ensure!(
            output.success(),
            "failed to get current Wi-Fi network: {}",
            output.stderr.trim()
        );

        Ok(output.stdout.trim().to_string())
    }

    pub async fn reconfigure(&self) -> Result<()> {
        self.wpa_cli(&["reconfigure"])
            .await
            .context("failed to reconfigure wpa_supplicant")?;
        Ok(())
    }

    /// Add `ssid` to wpa_supplicant.conf and let wpa_supplicant pick it up
    pub async fn save_network(&self, ssid: &str, psk: &str) -> Result<()> {
        validate_ssid(ssid)?;
        validate_psk(psk)?;

        if self.add_network_to_config(ssid, psk)? {
            self.reconfigure().await?;
        }

        Ok(())
    }

    pub async fn forget_network(&self, ssid: &str) -> Result<()> {
        validate_ssid(ssid)?;

        if self.remove_network_from_config(ssid)? {
            self.reconfigure().await?;
        }

        Ok(())
    }

    fn add_network_to_config(&self, ssid: &str, psk: &str) -> Result<bool> {
        let path = &self.config.wpa_supplicant_conf;
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;

        let Some(content) = add_network_block(&content, ssid, psk) else {
            debug!("{ssid} is already configured");
            return Ok(false);
        };

        fs::write(path, content).with_context(|| format!("failed to write {path:?}"))?;
        info!("added {ssid} to {path:?}");

        Ok(true)
    }

    fn remove_network_from_config(&self, ssid: &str) -> Result<bool> {
        let path = &self.config.wpa_supplicant_conf;
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;

        let updated = remove_network_block(&content, ssid);
        if updated == content {
            return Ok(false);
        }

        fs::write(path, updated).with_context(|| format!("failed to write {path:?}"))?;
        info!("removed {ssid} from {path:?}");

        Ok(true)
    }

    fn discard_network(&self, ssid: &str) {
        if let Err(e) = self.remove_network_from_config(ssid) {
            error!("failed to remove {ssid} after failed connect: {e:#}");
        }
    }

    /// Join `ssid`, removing it from the config again if the interface
    /// does not associate in time
    ///
    /// An entry that was already saved before the call is kept on failure.
    pub async fn connect(&self, ssid: &str, psk: &str) -> Result<()> {
        validate_ssid(ssid)?;
        validate_psk(psk)?;

        info!("attempting to connect to Wi-Fi network {ssid}");

        let added = self
            .add_network_to_config(ssid, psk)
            .context("failed to add Wi-Fi network to config")?;

        if let Err(e) = self.select_network(ssid).await {
            if added {
                self.discard_network(ssid);
            }
            return Err(e);
        }

        if !self.wait_for_association(ssid).await {
            if added {
                self.discard_network(ssid);
            }
            bail!("failed to connect to Wi-Fi within the timeout");
        }

        info!("connected to Wi-Fi network {ssid}");

        if let Err(e) = config_files::remove_static_ip(&self.config.dhcpcd_conf) {
            error!("failed to remove static ip from dhcpcd config: {e:#}");
        }
        if let Err(e) = command::run(&self.runner, "systemctl", &["restart", "dhcpcd"]).await {
            error!("failed to restart dhcpcd: {e:#}");
        }

        Ok(())
    }

    async fn select_network(&self, ssid: &str) -> Result<()> {
        self.reconfigure().await?;

        let saved = match self.saved_networks().await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("not selecting {ssid} explicitly: {e:#}");
                return Ok(());
            }
        };

        if let Some(network) = saved.iter().find(|network| network.ssid == ssid) {
            self.wpa_cli(&["select_network", network.id.as_str()])
                .await
                .context("failed to select Wi-Fi network")?;
            self.wpa_cli(&["reassociate"])
                .await
                .context("failed to reassociate Wi-Fi network")?;
        }

        Ok(())
    }

    async fn wait_for_association(&self, ssid: &str) -> bool {
        let hotspot = &self.config.hotspot;
        let deadline = Instant::now() + hotspot.association_timeout;

        loop {
            sleep(hotspot.poll_interval).await;

            match self.status().await {
                Ok(status) if status.is_associated_with(ssid) => return true,
                Ok(_) => {}
                Err(e) => debug!("association check failed: {e:#}"),
            }

            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Leave `current`, forgetting it unless it is the hotspot network
    ///
    /// # Returns
    /// `true` if no network is joined afterwards
    pub async fn disconnect(&self, current: &str) -> Result<bool> {
        if HOTSPOT_SSIDS.contains(&current) || current.is_empty() {
            if let Err(e) = command::run(&self.runner, "systemctl", &["restart", "dhcpcd"]).await
            {
                error!("failed to restart dhcpcd: {e:#}");
            }
        } else {
            self.remove_network_from_config(current)
                .context("failed to remove network from configuration")?;
        }

        if let Err(e) = self.wpa_cli(&["disconnect"]).await {
            error!("failed to disconnect from Wi-Fi network: {e:#}");
        }

        self.reconfigure().await?;

        if let Err(e) = self.wpa_cli(&["reconnect"]).await {
            error!("failed to reconnect Wi-Fi: {e:#}");
        }

        let now = match self.current_network().await {
            Ok(now) => now,
            Err(e) => {
                error!("failed to get current Wi-Fi network: {e:#}");
                String::new()
            }
        };

        info!("disconnected from Wi-Fi network {current}");

        Ok(now.is_empty())
    }
}
