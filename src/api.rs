use crate::{
    agent_client::DeviceAgent,
    command::CommandRunner,
    config::{NetworkConfig, PathConfig},
    http_response::{InputError, Json, ServiceResultResponse, handle_service_result},
    middleware::{ActivityMw, ActivityObserver, AuthMw},
    services::{
        audio::AudioService,
        clock::ClockService,
        device::DeviceService,
        network::{NetworkModeService, interfaces},
        recordings::RecordingService,
        settings::{ConfigStore, Location, LocationView, datetime_from_millis},
        system::SystemService,
    },
};
use actix_files::NamedFile;
use actix_web::{
    HttpRequest, HttpResponse, Responder,
    http::header::{
        CONTENT_TYPE, ContentDisposition, DispositionParam, DispositionType, HeaderValue,
    },
    web,
};
use anyhow::{Context, Result};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::json;
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

const REBOOT_DELAY: Duration = Duration::from_secs(5);
const NETWORK_CHANGE_DELAY: Duration = Duration::from_secs(1);
const TC2: &str = "tc2";

#[derive(Deserialize)]
pub struct SetConfigForm {
    #[serde(default)]
    section: String,
    #[serde(default)]
    config: String,
}

#[derive(Deserialize)]
pub struct SectionForm {
    #[serde(default)]
    section: String,
}

#[derive(Deserialize)]
pub struct LocationForm {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    accuracy: f64,
    /// Unix time in milliseconds
    timestamp: i64,
}

#[derive(Deserialize)]
pub struct ClockForm {
    #[serde(default)]
    date: String,
    timezone: Option<String>,
}

#[derive(Deserialize)]
pub struct AudioRecordingForm {
    enabled: bool,
}

#[derive(Deserialize)]
pub struct VolumeForm {
    #[serde(default)]
    volume: String,
}

#[derive(Deserialize)]
pub struct SecondsQuery {
    seconds: u64,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    service: String,
    lines: Option<String>,
}

#[derive(Deserialize)]
pub struct ServiceForm {
    #[serde(default)]
    service: String,
}

#[derive(Deserialize)]
pub struct ConnectWifiPayload {
    ssid: String,
    password: String,
}

#[derive(Deserialize)]
pub struct WifiNetworkForm {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    psk: String,
}

pub struct Api<Agent, Runner>
where
    Agent: DeviceAgent,
    Runner: CommandRunner,
{
    pub agent: Arc<Agent>,
    pub runner: Arc<Runner>,
    pub network: NetworkModeService<Arc<Runner>>,
    pub settings: ConfigStore,
    pub paths: PathConfig,
}

impl<Agent, Runner> Clone for Api<Agent, Runner>
where
    Agent: DeviceAgent,
    Runner: CommandRunner,
{
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            runner: self.runner.clone(),
            network: self.network.clone(),
            settings: self.settings.clone(),
            paths: self.paths.clone(),
        }
    }
}

impl<Agent, Runner> Api<Agent, Runner>
where
    Agent: DeviceAgent + Send + Sync + 'static,
    Runner: CommandRunner + Send + Sync + 'static,
{
    pub fn new(agent: Agent, runner: Runner, paths: PathConfig, network: NetworkConfig) -> Self {
        let runner = Arc::new(runner);

        Api {
            agent: Arc::new(agent),
            network: NetworkModeService::new(runner.clone(), network),
            runner,
            settings: ConfigStore::new(&paths.config_file),
            paths,
        }
    }

    /// Register every endpoint below `/api`
    ///
    /// Expects `Data<Self>` and `Data<Credentials>` as app data.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.service(
            web::scope("/api")
                .wrap(ActivityMw::<Self>::default())
                .wrap(AuthMw)
                .route("/version", web::get().to(Self::version))
                .route("/device-info", web::get().to(Self::device_info))
                .route("/packages", web::get().to(Self::packages))
                .route("/recordings", web::get().to(Self::recordings))
                .route("/recording/{id}", web::get().to(Self::recording))
                .route("/recording/{id}", web::delete().to(Self::delete_recording))
                .route("/camera/snapshot", web::put().to(Self::take_snapshot))
                .route(
                    "/camera/snapshot-recording",
                    web::put().to(Self::take_test_recording),
                )
                .route("/reboot", web::post().to(Self::reboot))
                .route("/config", web::get().to(Self::config))
                .route("/config", web::post().to(Self::set_config))
                .route(
                    "/clear-config-section",
                    web::post().to(Self::clear_config_section),
                )
                .route("/location", web::get().to(Self::location))
                .route("/location", web::post().to(Self::set_location))
                .route("/clock", web::get().to(Self::clock))
                .route("/clock", web::post().to(Self::set_clock))
                .route("/audiorecording", web::get().to(Self::audio_recording))
                .route("/audiorecording", web::post().to(Self::set_audio_recording))
                .route("/audio/audio-status", web::get().to(Self::audio_status))
                .route("/audio/test-recording", web::put().to(Self::test_audio))
                .route("/play-test-sound", web::post().to(Self::play_test_sound))
                .route("/offload-status", web::get().to(Self::offload_status))
                .route("/cancel-offload", web::put().to(Self::cancel_offload))
                .route("/thermal/thermal-status", web::get().to(Self::thermal_status))
                .route(
                    "/thermal/short-test-recording",
                    web::put().to(Self::short_test_thermal_recording),
                )
                .route(
                    "/thermal/long-test-recording",
                    web::put().to(Self::long_test_thermal_recording),
                )
                .route("/serve-frames-now", web::put().to(Self::serve_frames_now))
                .route("/logs", web::get().to(Self::logs))
                .route("/service", web::get().to(Self::service_status))
                .route("/service-restart", web::post().to(Self::restart_service))
                .route("/battery", web::get().to(Self::battery))
                .route("/network/interfaces", web::get().to(Self::network_interfaces))
                .route(
                    "/interface-status/{name}",
                    web::get().to(Self::interface_status),
                )
                .route("/network/wifi", web::get().to(Self::scan_wifi))
                .route("/network/wifi", web::post().to(Self::connect_wifi))
                .route("/network/wifi/saved", web::get().to(Self::saved_wifi_networks))
                .route("/network/wifi/save", web::post().to(Self::save_wifi_network))
                .route("/network/wifi/forget", web::delete().to(Self::forget_wifi_network))
                .route("/network/wifi/current", web::get().to(Self::current_wifi))
                .route("/network/wifi/current", web::delete().to(Self::disconnect_wifi))
                .route("/wifi-networks", web::get().to(Self::saved_wifi_networks))
                .route("/wifi-networks", web::post().to(Self::save_wifi_network))
                .route("/wifi-networks", web::delete().to(Self::forget_wifi_network))
                .route("/wifi-network-scan", web::get().to(Self::scan_wifi))
                .route("/wifi-check", web::get().to(Self::wifi_check))
                .route("/modem-check", web::get().to(Self::modem_check))
                .route("/enable-wifi", web::post().to(Self::enable_wifi))
                .route("/enable-hotspot", web::post().to(Self::enable_hotspot))
                .route("/wifi-status", web::get().to(Self::wifi_status)),
        );
    }

    // ========================================================================
    // Device
    // ========================================================================

    pub async fn version() -> impl Responder {
        debug!("version() called");
        Json(DeviceService::version()).into_response()
    }

    pub async fn device_info(api: web::Data<Self>) -> impl Responder {
        debug!("device_info() called");
        handle_service_result(
            DeviceService::info(&api.settings, &api.paths.minion_id).map(Json),
            "device_info",
        )
    }

    pub async fn packages(api: web::Data<Self>) -> impl Responder {
        debug!("packages() called");
        handle_service_result(
            SystemService::packages(api.runner.as_ref()).await.map(Json),
            "packages",
        )
    }

    pub async fn reboot(api: web::Data<Self>) -> impl Responder {
        debug!("reboot() called");

        let runner = api.runner.clone();
        spawn_logged("reboot", async move {
            SystemService::reboot(runner.as_ref(), REBOOT_DELAY).await
        });

        HttpResponse::Ok().finish()
    }

    // ========================================================================
    // Recordings
    // ========================================================================

    pub async fn recordings(api: web::Data<Self>) -> impl Responder {
        debug!("recordings() called");
        handle_service_result(
            api.cptv_dir()
                .and_then(|dir| RecordingService::list(&dir))
                .map(Json),
            "recordings",
        )
    }

    pub async fn recording(
        req: HttpRequest,
        id: web::Path<String>,
        api: web::Data<Self>,
    ) -> HttpResponse {
        debug!("recording() called: {id}");

        let path = match api
            .cptv_dir()
            .and_then(|dir| RecordingService::path(&dir, &id))
        {
            Ok(path) => path,
            Err(e) => return handle_service_result::<()>(Err(e), "recording"),
        };

        let file = match NamedFile::open_async(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!("recording failed: {e:#}");
                return HttpResponse::InternalServerError().body(e.to_string());
            }
        };

        let content_type = if RecordingService::is_cptv(&path) {
            "application/x-cptv"
        } else {
            "application/json"
        };

        let mut response = file
            .set_content_disposition(ContentDisposition {
                disposition: DispositionType::Attachment,
                parameters: vec![DispositionParam::Filename(id.into_inner())],
            })
            .into_response(&req);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

        response
    }

    pub async fn delete_recording(id: web::Path<String>, api: web::Data<Self>) -> impl Responder {
        debug!("delete_recording() called: {id}");
        handle_service_result(
            api.cptv_dir()
                .and_then(|dir| RecordingService::delete(&dir, &id)),
            "delete_recording",
        )
    }

    pub async fn take_snapshot(api: web::Data<Self>) -> impl Responder {
        debug!("take_snapshot() called");
        handle_service_result(api.agent.take_snapshot().await, "take_snapshot")
    }

    pub async fn take_test_recording(api: web::Data<Self>) -> impl Responder {
        debug!("take_test_recording() called");
        handle_service_result(api.agent.take_test_recording().await, "take_test_recording")
    }

    // ========================================================================
    // Config
    // ========================================================================

    pub async fn config(api: web::Data<Self>) -> impl Responder {
        debug!("config() called");
        handle_service_result(api.settings.values_and_defaults().map(Json), "config")
    }

    pub async fn set_config(form: web::Form<SetConfigForm>, api: web::Data<Self>) -> impl Responder {
        debug!("set_config() called: {}", form.section);

        let result = match serde_json::from_str(&form.config) {
            Ok(values) => api.settings.set_section(&form.section, values),
            Err(e) => Err(InputError::new(format!("failed to parse config: {e}")).into()),
        };

        handle_service_result(result, "set_config")
    }

    pub async fn clear_config_section(
        form: web::Form<SectionForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("clear_config_section() called: {}", form.section);
        handle_service_result(
            api.settings.clear_section(&form.section),
            "clear_config_section",
        )
    }

    pub async fn location(api: web::Data<Self>) -> impl Responder {
        debug!("location() called");
        handle_service_result(
            api.settings
                .location()
                .map(|location| Json(LocationView::from(location))),
            "location",
        )
    }

    pub async fn set_location(form: web::Form<LocationForm>, api: web::Data<Self>) -> impl Responder {
        debug!("set_location() called");

        let result = datetime_from_millis(form.timestamp).and_then(|timestamp| {
            api.settings.set_location(Location {
                latitude: form.latitude,
                longitude: form.longitude,
                altitude: form.altitude,
                accuracy: form.accuracy,
                timestamp: Some(timestamp),
            })
        });

        handle_service_result(result, "set_location")
    }

    pub async fn audio_recording(api: web::Data<Self>) -> impl Responder {
        debug!("audio_recording() called");
        handle_service_result(
            api.settings
                .audio_recording()
                .map(|audio| Json(json!({ "enabled": audio.enabled }))),
            "audio_recording",
        )
    }

    pub async fn set_audio_recording(
        form: web::Form<AudioRecordingForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("set_audio_recording() called: {}", form.enabled);
        handle_service_result(
            api.settings.set_audio_recording_enabled(form.enabled),
            "set_audio_recording",
        )
    }

    // ========================================================================
    // Clock
    // ========================================================================

    pub async fn clock(api: web::Data<Self>) -> impl Responder {
        debug!("clock() called");
        handle_service_result(
            ClockService::status(api.runner.as_ref(), api.agent.as_ref(), api.is_tc2())
                .await
                .map(Json),
            "clock",
        )
    }

    pub async fn set_clock(form: web::Form<ClockForm>, api: web::Data<Self>) -> impl Responder {
        debug!("set_clock() called: {}", form.date);
        handle_service_result(
            ClockService::set(
                api.runner.as_ref(),
                api.agent.as_ref(),
                api.is_tc2(),
                &form.date,
                form.timezone.as_deref(),
            )
            .await,
            "set_clock",
        )
    }

    // ========================================================================
    // Recording hardware
    // ========================================================================

    pub async fn audio_status(api: web::Data<Self>) -> impl Responder {
        debug!("audio_status() called");
        handle_service_result(api.agent.audio_status().await.map(Json), "audio_status")
    }

    pub async fn test_audio(api: web::Data<Self>) -> impl Responder {
        debug!("test_audio() called");
        handle_service_result(api.agent.test_audio().await.map(Json), "test_audio")
    }

    pub async fn play_test_sound(form: web::Form<VolumeForm>, api: web::Data<Self>) -> impl Responder {
        debug!("play_test_sound() called: {}", form.volume);

        let result = api.play_sound(&form.volume).await;

        handle_service_result(result, "play_test_sound")
    }

    pub async fn offload_status(api: web::Data<Self>) -> impl Responder {
        debug!("offload_status() called");
        handle_service_result(api.agent.offload_status().await.map(Json), "offload_status")
    }

    pub async fn cancel_offload(api: web::Data<Self>) -> impl Responder {
        debug!("cancel_offload() called");
        handle_service_result(api.agent.cancel_offload().await.map(Json), "cancel_offload")
    }

    pub async fn thermal_status(api: web::Data<Self>) -> impl Responder {
        debug!("thermal_status() called");
        handle_service_result(
            api.agent.thermal_test_status().await.map(Json),
            "thermal_status",
        )
    }

    pub async fn short_test_thermal_recording(api: web::Data<Self>) -> impl Responder {
        debug!("short_test_thermal_recording() called");
        handle_service_result(
            api.agent.short_test_thermal_recording().await.map(Json),
            "short_test_thermal_recording",
        )
    }

    pub async fn long_test_thermal_recording(
        query: web::Query<SecondsQuery>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("long_test_thermal_recording() called: {}s", query.seconds);
        handle_service_result(
            api.agent
                .long_test_thermal_recording(query.seconds)
                .await
                .map(Json),
            "long_test_thermal_recording",
        )
    }

    pub async fn serve_frames_now(api: web::Data<Self>) -> impl Responder {
        debug!("serve_frames_now() called");
        handle_service_result(
            api.agent.prioritise_frame_serve().await.map(Json),
            "serve_frames_now",
        )
    }

    // ========================================================================
    // System
    // ========================================================================

    pub async fn logs(query: web::Query<LogsQuery>, api: web::Data<Self>) -> impl Responder {
        debug!("logs() called: {}", query.service);
        handle_service_result(
            SystemService::logs(api.runner.as_ref(), &query.service, query.lines.as_deref())
                .await
                .map(Json),
            "logs",
        )
    }

    pub async fn service_status(
        query: web::Query<ServiceForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("service_status() called: {}", query.service);
        handle_service_result(
            SystemService::service_status(api.runner.as_ref(), &query.service)
                .await
                .map(Json),
            "service_status",
        )
    }

    pub async fn restart_service(
        form: web::Form<ServiceForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("restart_service() called: {}", form.service);
        handle_service_result(
            SystemService::restart_service(api.runner.as_ref(), &form.service).await,
            "restart_service",
        )
    }

    pub async fn battery(api: web::Data<Self>) -> impl Responder {
        debug!("battery() called");
        handle_service_result(
            SystemService::battery(&api.paths.battery_csv).map(Json),
            "battery",
        )
    }

    // ========================================================================
    // Network
    // ========================================================================

    pub async fn network_interfaces(api: web::Data<Self>) -> impl Responder {
        debug!("network_interfaces() called");
        handle_service_result(
            interfaces::list(api.runner.as_ref()).await.map(Json),
            "network_interfaces",
        )
    }

    pub async fn interface_status(
        name: web::Path<String>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("interface_status() called: {name}");
        handle_service_result(
            interfaces::ping(api.runner.as_ref(), &name).await.map(Json),
            "interface_status",
        )
    }

    pub async fn scan_wifi(api: web::Data<Self>) -> impl Responder {
        debug!("scan_wifi() called");
        handle_service_result(api.network.wifi().scan().await.map(Json), "scan_wifi")
    }

    pub async fn connect_wifi(
        body: web::Json<ConnectWifiPayload>,
        api: web::Data<Self>,
    ) -> HttpResponse {
        debug!("connect_wifi() called: {}", body.ssid);

        match api.network.wifi().connect(&body.ssid, &body.password).await {
            Ok(()) => HttpResponse::Ok().body("Connected to Wi-Fi successfully"),
            Err(e) if e.downcast_ref::<InputError>().is_some() => {
                handle_service_result::<()>(Err(e), "connect_wifi")
            }
            Err(e) => {
                error!("connect_wifi failed: {e:#}");

                let network = api.network.clone();
                spawn_logged("setup hotspot", async move { network.setup_hotspot().await });

                HttpResponse::InternalServerError().body(format!("Failed to connect to Wi-Fi: {e}"))
            }
        }
    }

    pub async fn saved_wifi_networks(api: web::Data<Self>) -> impl Responder {
        debug!("saved_wifi_networks() called");
        handle_service_result(
            api.network.wifi().saved_networks().await.map(Json),
            "saved_wifi_networks",
        )
    }

    pub async fn save_wifi_network(
        form: web::Form<WifiNetworkForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("save_wifi_network() called: {}", form.ssid);
        handle_service_result(
            api.network.wifi().save_network(&form.ssid, &form.psk).await,
            "save_wifi_network",
        )
    }

    pub async fn forget_wifi_network(
        form: web::Form<WifiNetworkForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("forget_wifi_network() called: {}", form.ssid);
        handle_service_result(
            api.network.wifi().forget_network(&form.ssid).await,
            "forget_wifi_network",
        )
    }

    pub async fn current_wifi(api: web::Data<Self>) -> impl Responder {
        debug!("current_wifi() called");
        handle_service_result(
            api.network
                .wifi()
                .current_network()
                .await
                .map(|ssid| Json(json!({ "SSID": ssid }))),
            "current_wifi",
        )
    }

    pub async fn disconnect_wifi(api: web::Data<Self>) -> impl Responder {
        debug!("disconnect_wifi() called");

        let network = api.network.clone();
        spawn_logged("disconnect wifi", async move {
            tokio::time::sleep(NETWORK_CHANGE_DELAY).await;

            let current = network.wifi().current_network().await?;
            info!("disconnecting from {current:?}");

            if network.wifi().disconnect(&current).await? {
                info!("no Wi-Fi network left, starting hotspot");
                network.setup_hotspot().await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        HttpResponse::Ok().body("will disconnect from Wi-Fi network shortly")
    }

    pub async fn wifi_check(api: web::Data<Self>) -> impl Responder {
        debug!("wifi_check() called");
        Self::internet_check(&api, &api.network.config().wifi_interface).await
    }

    pub async fn modem_check(api: web::Data<Self>) -> impl Responder {
        debug!("modem_check() called");
        Self::internet_check(&api, &api.network.config().modem_interface).await
    }

    pub async fn enable_wifi(api: web::Data<Self>) -> impl Responder {
        debug!("enable_wifi() called");
        handle_service_result(api.network.setup_wifi().await, "enable_wifi")
    }

    pub async fn enable_hotspot(api: web::Data<Self>) -> impl Responder {
        debug!("enable_hotspot() called");

        let network = api.network.clone();
        spawn_logged("enable hotspot", async move {
            tokio::time::sleep(NETWORK_CHANGE_DELAY).await;
            network.setup_hotspot().await
        });

        HttpResponse::Ok().finish()
    }

    pub async fn wifi_status(api: web::Data<Self>) -> impl Responder {
        debug!("wifi_status() called");
        Json(json!({ "state": api.network.state().as_str() })).into_response()
    }

    async fn internet_check(api: &Self, interface: &str) -> HttpResponse {
        handle_service_result(
            interfaces::has_internet(&api.network.config().sysfs_net, interface)
                .await
                .map(|connected| Json(json!({ "connected": connected }))),
            "internet_check",
        )
    }

    async fn play_sound(&self, volume: &str) -> Result<String> {
        let volume = AudioService::parse_volume(volume)?;
        let audio = self.settings.audio()?;

        AudioService::play_test_sound(self.runner.as_ref(), &audio, &self.paths.test_sound, volume)
            .await
    }

    fn cptv_dir(&self) -> Result<PathBuf> {
        match &self.paths.cptv_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self
                .settings
                .thermal_recorder()
                .context("failed to get recording directory")?
                .output_dir),
        }
    }

    fn is_tc2(&self) -> bool {
        DeviceService::device_type(&self.paths.minion_id) == TC2
    }
}

impl<Agent, Runner> ActivityObserver for Api<Agent, Runner>
where
    Agent: DeviceAgent + Send + Sync + 'static,
    Runner: CommandRunner + Send + Sync + 'static,
{
    fn request_received(&self) {
        self.network.keep_hotspot_on();

        let runner = self.runner.clone();
        tokio::spawn(async move { SystemService::keep_awake(runner.as_ref()).await });
    }
}

fn spawn_logged<F>(operation: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("{operation} failed: {e:#}");
        }
    });
}
