//! `org.cacophony.managementd` on the system bus
//!
//! Other daemons use it to switch the network mode and to observe mode
//! changes. Mode changes take a while, so method calls only queue them and
//! return right away.

use crate::{
    command::CommandRunner,
    services::network::{NetworkModeService, NetworkState},
};
use anyhow::{Context, Result};
use log::{debug, error, info};
use std::fmt;
use tokio::sync::{mpsc, watch};
use zbus::{Connection, connection, fdo, interface, object_server::SignalEmitter};

pub const BUS_NAME: &str = "org.cacophony.managementd";
pub const OBJECT_PATH: &str = "/org/cacophony/managementd";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NetworkCommand {
    SetupWifi,
    SetupHotspot,
    ReconfigureWifi,
}

impl NetworkCommand {
    /// Command for a requested network state, `None` for unknown states
    pub fn for_state(state: &str) -> Option<Self> {
        match state {
            "wifi" => Some(Self::SetupWifi),
            "hotspot" => Some(Self::SetupHotspot),
            _ => None,
        }
    }

    pub async fn run<R>(self, network: &NetworkModeService<R>) -> Result<()>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        match self {
            Self::SetupWifi => network.setup_wifi().await,
            Self::SetupHotspot => network.setup_hotspot().await,
            Self::ReconfigureWifi => network.reconfigure_wifi().await,
        }
    }
}

impl fmt::Display for NetworkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupWifi => write!(f, "setup wifi"),
            Self::SetupHotspot => write!(f, "setup hotspot"),
            Self::ReconfigureWifi => write!(f, "reconfigure wifi"),
        }
    }
}

pub struct ManagementInterface {
    commands: mpsc::UnboundedSender<NetworkCommand>,
    state: watch::Receiver<NetworkState>,
}

impl ManagementInterface {
    pub fn new(
        commands: mpsc::UnboundedSender<NetworkCommand>,
        state: watch::Receiver<NetworkState>,
    ) -> Self {
        Self { commands, state }
    }

    fn dispatch(&self, command: NetworkCommand) -> fdo::Result<()> {
        debug!("dbus requested {command}");
        self.commands
            .send(command)
            .map_err(|_| fdo::Error::Failed("network command queue closed".to_string()))
    }
}

#[interface(name = "org.cacophony.managementd")]
impl ManagementInterface {
    async fn set_network_state(&self, state: &str) -> fdo::Result<()> {
        let command = NetworkCommand::for_state(state)
            .ok_or_else(|| fdo::Error::InvalidArgs("invalid state".to_string()))?;
        self.dispatch(command)
    }

    async fn get_network_state(&self) -> String {
        self.state.borrow().to_string()
    }

    async fn reconfigure_wifi(&self) -> fdo::Result<()> {
        self.dispatch(NetworkCommand::ReconfigureWifi)
    }

    #[zbus(signal)]
    async fn new_network_state(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;
}

/// Owns the bus connection, dropping it releases the bus name
pub struct DbusService {
    _connection: Connection,
}

impl DbusService {
    /// Claim the bus name and start serving requests for `network`
    pub async fn start<R>(network: NetworkModeService<R>) -> Result<Self>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let interface = ManagementInterface::new(commands, network.subscribe());

        let connection = connection::Builder::system()
            .context("failed to connect to system bus")?
            .name(BUS_NAME)
            .context("invalid bus name")?
            .serve_at(OBJECT_PATH, interface)
            .context("invalid object path")?
            .build()
            .await
            .with_context(|| format!("failed to register {BUS_NAME}"))?;

        info!("serving {BUS_NAME} at {OBJECT_PATH}");

        tokio::spawn(forward_state_changes(
            connection.clone(),
            network.subscribe(),
        ));
        tokio::spawn(dispatch_commands(network, command_rx));

        Ok(Self {
            _connection: connection,
        })
    }
}

/// Run every queued command in its own task, failures are only logged
pub async fn dispatch_commands<R>(
    network: NetworkModeService<R>,
    mut commands: mpsc::UnboundedReceiver<NetworkCommand>,
) where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    while let Some(command) = commands.recv().await {
        let network = network.clone();
        tokio::spawn(async move {
            if let Err(e) = command.run(&network).await {
                error!("{command} failed: {e:#}");
            }
        });
    }

    debug!("network command queue closed");
}

async fn forward_state_changes(connection: Connection, mut state: watch::Receiver<NetworkState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();

        let emitter = match SignalEmitter::new(&connection, OBJECT_PATH) {
            Ok(emitter) => emitter,
            Err(e) => {
                error!("failed to create signal emitter: {e:#}");
                return;
            }
        };

        if let Err(e) = ManagementInterface::new_network_state(&emitter, current.as_str()).await {
            error!("failed to emit network state {current}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface() -> (
        ManagementInterface,
        mpsc::UnboundedReceiver<NetworkCommand>,
        watch::Sender<NetworkState>,
    ) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(NetworkState::Starting);
        (ManagementInterface::new(commands, state_rx), command_rx, state)
    }

    #[tokio::test]
    async fn known_states_are_queued() {
        let (interface, mut commands, _state) = interface();

        interface.set_network_state("wifi").await.unwrap();
        interface.set_network_state("hotspot").await.unwrap();
        interface.reconfigure_wifi().await.unwrap();

        assert_eq!(commands.recv().await, Some(NetworkCommand::SetupWifi));
        assert_eq!(commands.recv().await, Some(NetworkCommand::SetupHotspot));
        assert_eq!(commands.recv().await, Some(NetworkCommand::ReconfigureWifi));
    }

    #[tokio::test]
    async fn unknown_state_is_invalid_argument() {
        let (interface, mut commands, _state) = interface();

        let err = interface.set_network_state("ethernet").await.unwrap_err();

        assert!(matches!(err, fdo::Error::InvalidArgs(msg) if msg == "invalid state"));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn current_state_is_reported() {
        let (interface, _commands, state) = interface();

        state.send_replace(NetworkState::HotspotSetup);

        assert_eq!(interface.get_network_state().await, "HOTSPOT_SETUP");
    }
}
