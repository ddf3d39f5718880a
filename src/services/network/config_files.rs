//! Renderers for the flat config files of dhcpcd, hostapd and dnsmasq

use crate::config::NetworkConfig;
use anyhow::{Context, Result};
use ini::Ini;
use log::{debug, info};
use std::{fs, io::ErrorKind, path::Path};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DhcpMode {
    /// wlan0 is a DHCP client of an upstream network
    Wifi,
    /// wlan0 holds the static router address and wpa_supplicant stays off
    Hotspot,
}

const DHCPCD_COMMON_LINES: [&str; 9] = [
    "hostname",
    "clientid",
    "persistent",
    "option rapid_commit",
    "option domain_name_servers, domain_name, domain_search, host_name",
    "option classless_static_routes",
    "option interface_mtu",
    "require dhcp_server_identifier",
    "slaac private",
];

const STATIC_IP_PREFIX: &str = "static ip_address=";

pub fn dhcpcd_lines(config: &NetworkConfig, mode: DhcpMode) -> Vec<String> {
    let mut lines: Vec<String> = DHCPCD_COMMON_LINES.iter().map(|l| l.to_string()).collect();

    lines.extend([
        format!("interface {}", config.modem_interface),
        "metric 300".to_string(),
        format!("interface {}", config.wifi_interface),
        "metric 200".to_string(),
    ]);

    if mode == DhcpMode::Hotspot {
        lines.extend([
            format!("interface {}", config.wifi_interface),
            format!("{STATIC_IP_PREFIX}{}/24", config.hotspot.router_ip),
            "nohook wpa_supplicant".to_string(),
        ]);
    }

    lines
}

pub fn hostapd_conf(config: &NetworkConfig) -> Result<String> {
    let hotspot = &config.hotspot;
    let mut ini = Ini::new();

    ini.with_general_section()
        .set("country_code", hotspot.country_code.as_str())
        .set("interface", config.wifi_interface.as_str())
        .set("ssid", hotspot.ssid.as_str())
        .set("hw_mode", "g")
        .set("channel", hotspot.channel.to_string())
        .set("macaddr_acl", "0")
        .set("ignore_broadcast_ssid", "0")
        .set("wpa", "2")
        .set("wpa_passphrase", hotspot.passphrase.as_str())
        .set("wpa_key_mgmt", "WPA-PSK")
        .set("wpa_pairwise", "TKIP")
        .set("rsn_pairwise", "CCMP");

    render(&ini).context("failed to render hostapd config")
}

pub fn dnsmasq_conf(config: &NetworkConfig) -> Result<String> {
    let hotspot = &config.hotspot;
    let mut ini = Ini::new();

    ini.with_general_section()
        .set("interface", config.wifi_interface.as_str())
        .set(
            "dhcp-range",
            format!(
                "{},{},{}",
                hotspot.dhcp_range_start, hotspot.dhcp_range_end, hotspot.dhcp_lease
            ),
        )
        .set("domain", "wlan");

    render(&ini).context("failed to render dnsmasq config")
}

fn render(ini: &Ini) -> Result<String> {
    let mut buf = Vec::new();
    ini.write_to(&mut buf).context("failed to serialize ini")?;
    String::from_utf8(buf).context("failed to convert ini to utf8")
}

pub fn join_lines(lines: &[String]) -> String {
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

/// Write `content` to `path` unless the file already holds exactly that content
///
/// # Returns
/// `true` if the file was written, `false` if it was left untouched
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match fs::read_to_string(path) {
        Ok(current) if current == content => {
            debug!("{path:?} is up to date");
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).context(format!("failed to read {path:?}")),
    }

    info!("writing {path:?}");
    fs::write(path, content).context(format!("failed to write {path:?}"))?;

    Ok(true)
}

/// Drop every static address line from a dhcpcd config
///
/// # Returns
/// `true` if a line was removed
pub fn remove_static_ip(path: &Path) -> Result<bool> {
    let current = match fs::read_to_string(path) {
        Ok(current) => current,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).context(format!("failed to read {path:?}")),
    };

    let lines: Vec<String> = current
        .lines()
        .filter(|line| !line.trim_start().starts_with(STATIC_IP_PREFIX))
        .map(str::to_string)
        .collect();

    if lines.len() == current.lines().count() {
        return Ok(false);
    }

    write_if_changed(path, &join_lines(&lines))
}
