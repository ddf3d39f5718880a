use anyhow::{Context, Result};
use std::{env, net::Ipv4Addr, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub ui: UiConfig,

    /// File locations outside of the network stack
    pub paths: PathConfig,

    /// Network mode switching configuration
    pub network: NetworkConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
    pub credentials: Credentials,
}

/// Basic auth credentials accepted by the api
#[derive(Clone, Debug, PartialEq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub config_file: PathBuf,
    /// Overrides the thermal recorder output directory of the device config
    pub cptv_dir: Option<PathBuf>,
    pub battery_csv: PathBuf,
    pub minion_id: PathBuf,
    pub test_sound: PathBuf,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub wifi_interface: String,
    pub modem_interface: String,
    pub dhcpcd_conf: PathBuf,
    pub hostapd_conf: PathBuf,
    pub dnsmasq_conf: PathBuf,
    pub wpa_supplicant_conf: PathBuf,
    /// Root of the per interface sysfs entries, usually `/sys/class/net`
    pub sysfs_net: PathBuf,
    pub hotspot: HotspotConfig,
}

#[derive(Clone, Debug)]
pub struct HotspotConfig {
    pub ssid: String,
    pub passphrase: String,
    pub country_code: String,
    pub channel: u8,
    pub router_ip: Ipv4Addr,
    pub dhcp_range_start: Ipv4Addr,
    pub dhcp_range_end: Ipv4Addr,
    pub dhcp_lease: String,
    pub interface_up_timeout: Duration,
    /// Bound on waiting for wpa_supplicant to complete association with a new network
    pub association_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_retry_interval: Duration,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// all configuration from environment variables. Subsequent calls return
    /// the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The daemon cannot do anything
    /// useful without a valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        let ui = UiConfig::load()?;
        let paths = PathConfig::load()?;
        let network = NetworkConfig::load()?;

        Ok(Self { ui, paths, network })
    }
}

impl UiConfig {
    fn load() -> Result<Self> {
        let port = env::var("UI_PORT")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<u16>()
            .context("failed to parse UI_PORT: invalid format")?;

        let credentials = Credentials {
            user: env::var("LOGIN_USER").unwrap_or_else(|_| "admin".to_string()),
            password: env::var("LOGIN_PASSWORD").unwrap_or_else(|_| "feathers".to_string()),
        };

        Ok(Self { port, credentials })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let config_file = path_var("CONFIG_FILE", "/etc/cacophony/config.toml");
        let cptv_dir = env::var("CPTV_DIR").ok().map(PathBuf::from);
        let battery_csv = path_var("BATTERY_CSV", "/var/log/battery-readings.csv");
        let minion_id = path_var("SALT_MINION_ID", "/etc/salt/minion_id");
        let test_sound = path_var("TEST_SOUND", "/usr/share/managementd/test.wav");

        Ok(Self {
            config_file,
            cptv_dir,
            battery_csv,
            minion_id,
            test_sound,
        })
    }
}

impl NetworkConfig {
    fn load() -> Result<Self> {
        let idle_timeout = match env::var("HOTSPOT_IDLE_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.parse::<u64>()
                    .context("failed to parse HOTSPOT_IDLE_TIMEOUT_SECS: invalid format")?,
            ),
            Err(_) => HotspotConfig::default().idle_timeout,
        };

        Ok(Self {
            wifi_interface: "wlan0".to_string(),
            modem_interface: "usb0".to_string(),
            dhcpcd_conf: path_var("DHCPCD_CONF", "/etc/dhcpcd.conf"),
            hostapd_conf: path_var("HOSTAPD_CONF", "/etc/hostapd/hostapd.conf"),
            dnsmasq_conf: path_var("DNSMASQ_CONF", "/etc/dnsmasq.conf"),
            wpa_supplicant_conf: path_var(
                "WPA_SUPPLICANT_CONF",
                "/etc/wpa_supplicant/wpa_supplicant.conf",
            ),
            sysfs_net: path_var("SYSFS_NET", "/sys/class/net"),
            hotspot: HotspotConfig {
                idle_timeout,
                ..Default::default()
            },
        })
    }

    /// Network configuration with every file placed below `root`
    ///
    /// Timeouts are shortened so tests exercising the polling loops finish quickly.
    #[cfg(any(test, feature = "mock"))]
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            wifi_interface: "wlan0".to_string(),
            modem_interface: "usb0".to_string(),
            dhcpcd_conf: root.join("dhcpcd.conf"),
            hostapd_conf: root.join("hostapd.conf"),
            dnsmasq_conf: root.join("dnsmasq.conf"),
            wpa_supplicant_conf: root.join("wpa_supplicant.conf"),
            sysfs_net: root.join("net"),
            hotspot: HotspotConfig {
                interface_up_timeout: Duration::from_millis(50),
                association_timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
                connect_retry_interval: Duration::from_millis(1),
                ..Default::default()
            },
        }
    }
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            ssid: "bushnet".to_string(),
            passphrase: "feathers".to_string(),
            country_code: "NZ".to_string(),
            channel: 7,
            router_ip: Ipv4Addr::new(192, 168, 4, 1),
            dhcp_range_start: Ipv4Addr::new(192, 168, 4, 2),
            dhcp_range_end: Ipv4Addr::new(192, 168, 4, 20),
            dhcp_lease: "12h".to_string(),
            interface_up_timeout: Duration::from_secs(30),
            association_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5 * 60),
            connect_attempts: 3,
            connect_retry_interval: Duration::from_secs(3),
        }
    }
}

fn path_var(key: &str, default: &str) -> PathBuf {
    env::var(key).unwrap_or_else(|_| default.to_string()).into()
}
