use crate::{
    command::{self, CommandRunner},
    http_response::InputError,
};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::LazyLock, time::Duration};
use tokio::time::{Instant, sleep};

const IFF_UP: u32 = 0x1;
const PING_PACKETS: u32 = 3;
const PING_TARGET: &str = "1.1.1.1";
const LOOKUP_HOST: &str = "www.google.com:80";

static INTERFACE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").expect("valid interface name regex"));

static RECEIVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:packets )?received").expect("valid ping regex"));

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: String,
    prefixlen: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<String>,
    pub mtu: u32,
    pub mac_address: String,
    /// Lower case link flags joined by `|`
    pub flags: String,
    pub up: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub name: String,
    pub packets_sent: u32,
    pub packets_received: u32,
    pub up: bool,
}

/// Read the administrative up flag of `interface` from sysfs
pub fn is_up(sysfs_net: &Path, interface: &str) -> Result<bool> {
    let path = sysfs_net.join(interface).join("flags");
    let flags =
        fs::read_to_string(&path).with_context(|| format!("failed to read {path:?}"))?;
    let flags = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16)
        .with_context(|| format!("failed to parse interface flags {flags:?}"))?;

    Ok(flags & IFF_UP != 0)
}

/// Poll until `interface` is up
///
/// # Arguments
/// * `sysfs_net` - Root of the per interface sysfs entries
/// * `interface` - Interface to wait for
/// * `timeout` - Upper bound on the wait
/// * `interval` - Delay between two checks
pub async fn wait_until_up(
    sysfs_net: &Path,
    interface: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        match is_up(sysfs_net, interface) {
            Ok(true) => {
                info!("{interface} is up");
                return Ok(());
            }
            Ok(false) => debug!("{interface} is not up yet"),
            Err(e) => debug!("{interface} state unknown: {e:#}"),
        }

        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {interface} to come up");
        }

        sleep(interval).await;
    }
}

/// Whether a host name resolves through `interface`
///
/// Fails if the interface is down, a failed lookup only means no connection.
pub async fn has_internet(sysfs_net: &Path, interface: &str) -> Result<bool> {
    let up = is_up(sysfs_net, interface)
        .with_context(|| format!("interface {interface} is down"))?;
    if !up {
        bail!("interface {interface} is down");
    }

    match tokio::net::lookup_host(LOOKUP_HOST).await {
        Ok(mut addrs) => Ok(addrs.next().is_some()),
        Err(e) => {
            debug!("lookup of {LOOKUP_HOST} failed: {e:#}");
            Ok(false)
        }
    }
}

pub fn validate_interface_name(name: &str) -> Result<()> {
    if !INTERFACE_NAME.is_match(name) {
        return Err(InputError::new(format!("invalid interface name {name:?}")).into());
    }
    Ok(())
}

pub async fn list<R>(runner: &R) -> Result<Vec<NetworkInterface>>
where
    R: CommandRunner + Sync,
{
    let output = command::run(runner, "ip", &["-j", "addr", "show"])
        .await
        .context("failed to get network interfaces")?;

    parse_ip_addr(&output)
}

fn parse_ip_addr(output: &str) -> Result<Vec<NetworkInterface>> {
    let links: Vec<IpLink> =
        serde_json::from_str(output).context("failed to parse ip addr output")?;

    Ok(links
        .into_iter()
        .map(|link| NetworkInterface {
            up: link.flags.iter().any(|flag| flag == "UP"),
            flags: link
                .flags
                .iter()
                .map(|flag| flag.to_lowercase())
                .collect::<Vec<_>>()
                .join("|"),
            addresses: link
                .addr_info
                .iter()
                .map(|addr| format!("{}/{}", addr.local, addr.prefixlen))
                .collect(),
            name: link.ifname,
            mtu: link.mtu,
            mac_address: link.address,
        })
        .collect())
}

/// Ping a public address through `interface`
pub async fn ping<R>(runner: &R, interface: &str) -> Result<InterfaceStatus>
where
    R: CommandRunner + Sync,
{
    validate_interface_name(interface)?;

    let count = PING_PACKETS.to_string();
    // ping exits non zero if nothing came back, which is a result and not an error
    let output = runner
        .output(
            "ping",
            &["-I", interface, "-c", &count, "-n", "-W", "15", PING_TARGET],
        )
        .await
        .with_context(|| format!("failed to ping through {interface}"))?;

    let packets_received = RECEIVED
        .captures(&output.stdout)
        .and_then(|c| c[1].parse::<u32>().ok())
        .unwrap_or_default();

    Ok(InterfaceStatus {
        name: interface.to_string(),
        packets_sent: PING_PACKETS,
        packets_received,
        up: packets_received > 0,
    })
}
