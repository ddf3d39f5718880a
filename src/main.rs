use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use managementd::{
    agent_client::DbusDeviceAgent,
    api::Api,
    command::SystemCommandRunner,
    config::AppConfig,
    dbus_service::DbusService,
};
use std::io::Write;
use tokio::signal::unix::{SignalKind, signal};

type ManagementApi = Api<DbusDeviceAgent, SystemCommandRunner>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let config = AppConfig::get();
    let agent = DbusDeviceAgent::new()
        .await
        .context("failed to connect device agent")?;
    let api = ManagementApi::new(
        agent,
        SystemCommandRunner::default(),
        config.paths.clone(),
        config.network.clone(),
    );

    let _dbus = DbusService::start(api.network.clone())
        .await
        .context("failed to start dbus service")?;

    let network = api.network.clone();
    tokio::spawn(async move {
        if let Err(e) = network.setup_wifi().await {
            error!("initial network setup failed: {e:#}");
        }
    });

    let (server_handle, server_task) = run_server(api)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    server_handle.stop(true).await;

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn run_server(
    api: ManagementApi,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let ui = &AppConfig::get().ui;
    let port = ui.port;
    let api = Data::new(api);
    let credentials = Data::new(ui.credentials.clone());

    let server = HttpServer::new(move || {
        App::new()
            .app_data(api.clone())
            .app_data(credentials.clone())
            .configure(ManagementApi::configure)
    })
    .bind(("0.0.0.0", port))
    .with_context(|| format!("failed to bind port {port}"))?
    .disable_signals()
    .run();

    info!("listening on port {port}");

    Ok((server.handle(), tokio::spawn(server)))
}
