pub mod config_files;
pub mod interfaces;
pub mod wifi;

use crate::{
    command::{self, CommandRunner},
    config::NetworkConfig,
};
use anyhow::{Context, Result, bail};
use config_files::DhcpMode;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{Mutex, watch},
    task::AbortHandle,
    time::{Instant, sleep, sleep_until},
};
use wifi::WifiService;

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkState {
    Starting,
    WifiSetup,
    Wifi,
    HotspotSetup,
    Hotspot,
}

impl NetworkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkState::Starting => "STARTING",
            NetworkState::WifiSetup => "WIFI_SETUP",
            NetworkState::Wifi => "WIFI",
            NetworkState::HotspotSetup => "HOTSPOT_SETUP",
            NetworkState::Hotspot => "HOTSPOT",
        }
    }

    fn is_hotspot(&self) -> bool {
        matches!(self, NetworkState::HotspotSetup | NetworkState::Hotspot)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Switches the wireless interface between client and access point mode
///
/// Mode changes hold `transition` for their whole duration so two of them
/// never rewrite the config files at the same time.
#[derive(Clone)]
pub struct NetworkModeService<R> {
    runner: R,
    config: Arc<NetworkConfig>,
    wifi: WifiService<R>,
    state: Arc<watch::Sender<NetworkState>>,
    transition: Arc<Mutex<()>>,
    idle_deadline: Arc<watch::Sender<Option<Instant>>>,
    idle_task: Arc<Mutex<Option<AbortHandle>>>,
}

impl<R> NetworkModeService<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    pub fn new(runner: R, config: NetworkConfig) -> Self {
        let config = Arc::new(config);
        let (state, _) = watch::channel(NetworkState::Starting);
        let (idle_deadline, _) = watch::channel(None);

        Self {
            wifi: WifiService::new(runner.clone(), config.clone()),
            runner,
            config,
            state: Arc::new(state),
            transition: Arc::new(Mutex::new(())),
            idle_deadline: Arc::new(idle_deadline),
            idle_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn wifi(&self) -> &WifiService<R> {
        &self.wifi
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    /// Receiver observing every state change
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: NetworkState) {
        info!("network state: {state}");
        self.state.send_replace(state);
    }

    /// Bring up the hotspot, falling back to client mode if that fails
    ///
    /// A running hotspot is stopped again after the idle timeout unless
    /// [`Self::keep_hotspot_on`] is called in between.
    pub async fn setup_hotspot(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        self.setup_hotspot_locked().await
    }

    async fn setup_hotspot_locked(&self) -> Result<()> {
        self.set_state(NetworkState::HotspotSetup);

        if let Err(e) = self.enter_hotspot_mode().await {
            if let Err(e) = self.exit_hotspot_mode().await {
                error!("failed to stop hotspot: {e:#}");
            }
            self.set_state(NetworkState::Wifi);
            return Err(e.context("failed to initialise hotspot"));
        }

        self.set_state(NetworkState::Hotspot);
        self.start_idle_timer().await;

        Ok(())
    }

    /// Leave hotspot mode and join a configured network, bringing the
    /// hotspot up again if none can be joined
    ///
    /// A failure before the hotspot fallback leaves the state at `WIFI`.
    pub async fn setup_wifi(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        self.cancel_idle_timer().await;
        self.set_state(NetworkState::WifiSetup);

        let result = self.join_wifi().await;
        if self.state() == NetworkState::WifiSetup {
            self.set_state(NetworkState::Wifi);
        }

        result
    }

    async fn join_wifi(&self) -> Result<()> {
        self.exit_hotspot_mode()
            .await
            .context("failed to stop hotspot")?;
        self.wifi.reconfigure().await?;

        if self.wait_for_connection().await? {
            self.set_state(NetworkState::Wifi);
            return Ok(());
        }

        warn!("no Wi-Fi network joined, falling back to hotspot");
        self.setup_hotspot_locked().await?;

        bail!("failed to connect to a Wi-Fi network, hotspot enabled instead")
    }

    /// Reload wpa_supplicant.conf, starting the hotspot if client mode is
    /// left without a network
    pub async fn reconfigure_wifi(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        self.wifi.reconfigure().await?;

        if self.state().is_hotspot() {
            debug!("hotspot active, not checking Wi-Fi connection");
            return Ok(());
        }

        if !self.wait_for_connection().await? {
            info!("no Wi-Fi network joined after reconfigure, starting hotspot");
            self.setup_hotspot_locked().await?;
        }

        Ok(())
    }

    /// Stop the hotspot and restore the client DHCP config
    ///
    /// If stopping fails the hotspot keeps running and the idle timer is
    /// armed again.
    pub async fn stop_hotspot(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        self.cancel_idle_timer().await;
        if let Err(e) = self.exit_hotspot_mode().await {
            if self.state() == NetworkState::Hotspot {
                self.start_idle_timer().await;
            }
            return Err(e);
        }
        self.set_state(NetworkState::Wifi);

        Ok(())
    }

    /// Push the hotspot idle deadline forward, no op without a running hotspot
    pub fn keep_hotspot_on(&self) {
        let timeout = self.config.hotspot.idle_timeout;
        self.idle_deadline.send_if_modified(|deadline| match deadline {
            Some(deadline) => {
                *deadline = Instant::now() + timeout;
                true
            }
            None => false,
        });
    }

    // ========================================================================
    // Mode transitions
    // ========================================================================

    async fn enter_hotspot_mode(&self) -> Result<()> {
        info!("setting up dhcp config for joining Wi-Fi networks");
        self.set_dhcp_mode(DhcpMode::Wifi).await?;

        debug!("checking whether a Wi-Fi network is joined");
        if self
            .wait_for_connection()
            .await
            .context("failed to check Wi-Fi connection")?
        {
            bail!("already connected to a network");
        }

        info!("not connected to a network, starting hotspot");
        config_files::write_if_changed(
            &self.config.hostapd_conf,
            &config_files::hostapd_conf(&self.config)?,
        )
        .context("failed to create access point config")?;
        config_files::write_if_changed(
            &self.config.dnsmasq_conf,
            &config_files::dnsmasq_conf(&self.config)?,
        )
        .context("failed to create dns config")?;

        self.set_dhcp_mode(DhcpMode::Hotspot).await?;

        self.systemctl("restart", "dnsmasq").await?;
        self.systemctl("restart", "hostapd").await?;

        let hotspot = &self.config.hotspot;
        interfaces::wait_until_up(
            &self.config.sysfs_net,
            &self.config.wifi_interface,
            hotspot.interface_up_timeout,
            hotspot.poll_interval,
        )
        .await
    }

    async fn exit_hotspot_mode(&self) -> Result<()> {
        info!("stopping hotspot");
        self.systemctl("stop", "hostapd").await?;
        self.systemctl("stop", "dnsmasq").await?;
        self.set_dhcp_mode(DhcpMode::Wifi).await
    }

    async fn set_dhcp_mode(&self, mode: DhcpMode) -> Result<()> {
        let content = config_files::join_lines(&config_files::dhcpcd_lines(&self.config, mode));
        let changed = config_files::write_if_changed(&self.config.dhcpcd_conf, &content)
            .with_context(|| format!("failed to set dhcp to {mode:?} mode"))?;

        if changed {
            self.systemctl("restart", "dhcpcd").await
        } else {
            self.systemctl("start", "dhcpcd").await
        }
    }

    async fn systemctl(&self, action: &str, unit: &str) -> Result<()> {
        command::run(&self.runner, "systemctl", &[action, unit])
            .await
            .with_context(|| format!("failed to {action} {unit}"))?;
        Ok(())
    }

    async fn wait_for_connection(&self) -> Result<bool> {
        let hotspot = &self.config.hotspot;

        for attempt in 1..=hotspot.connect_attempts {
            if self.wifi.is_connected().await? {
                return Ok(true);
            }
            if attempt < hotspot.connect_attempts {
                sleep(hotspot.connect_retry_interval).await;
            }
        }

        Ok(false)
    }

    // ========================================================================
    // Idle timer
    // ========================================================================

    async fn start_idle_timer(&self) {
        let timeout = self.config.hotspot.idle_timeout;
        self.idle_deadline.send_replace(Some(Instant::now() + timeout));

        let service = self.clone();
        let task = tokio::spawn(async move { service.run_idle_timer().await });

        if let Some(previous) = self.idle_task.lock().await.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn cancel_idle_timer(&self) {
        self.idle_deadline.send_replace(None);

        if let Some(task) = self.idle_task.lock().await.take() {
            task.abort();
        }
    }

    // explicit Send bound breaks the auto trait cycle through stop_hotspot
    fn run_idle_timer(&self) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            let mut deadline_rx = self.idle_deadline.subscribe();

            loop {
                let Some(deadline) = *deadline_rx.borrow_and_update() else {
                    return;
                };

                sleep_until(deadline).await;

                if deadline_rx
                    .borrow()
                    .is_some_and(|deadline| deadline > Instant::now())
                {
                    continue;
                }

                break;
            }

            info!(
                "no requests for {:?}, stopping hotspot",
                self.config.hotspot.idle_timeout
            );

            // detach before stopping so stop_hotspot does not abort this task
            self.idle_task.lock().await.take();

            if let Err(e) = self.stop_hotspot().await {
                error!("failed to stop hotspot: {e:#}");
            }
        }
    }
}
