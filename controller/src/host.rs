use std::{
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, ConnectionError, Event, Incoming, LastWill, MqttOptions, QoS};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use signal_common::{
    EngineAction, Frame, Glyph, HeadTopics, InboundEvent, RuntimeConfig, SignalEngine,
    SignalOutput,
};

use crate::api::{
    inbound_field_event, ConfigUpdate, ConfigUpdateError, ConfigView, ErrorBody, ResetResponse,
    TelemetryPayload,
};

const EVENT_QUEUE_DEPTH: usize = 64;
const SELF_TEST_MS: u64 = 1_000;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<SignalEngine>>,
    link: Arc<AtomicBool>,
    topics: Arc<HeadTopics>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

struct ConsoleOutput;

impl SignalOutput for ConsoleOutput {
    fn show(&mut self, frame: &Frame) {
        info!(
            lamps = %describe_lamps(frame),
            display = %describe_display(frame),
            "frame"
        );
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let topics = HeadTopics::new(&runtime.device.team_id, &runtime.device.light_id);
    info!(
        "signal head {}/{} on `{}`",
        runtime.device.team_id,
        runtime.device.light_id,
        topics.base()
    );

    let client_id = format!(
        "traffic-light-{}-{}",
        runtime.device.team_id, runtime.device.light_id
    );
    let mut mqtt_options = MqttOptions::new(
        client_id,
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    mqtt_options.set_last_will(LastWill::new(
        topics.online(),
        "false",
        QoS::AtLeastOnce,
        true,
    ));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(SignalEngine::new(runtime.signal.clone()))),
        link: Arc::new(AtomicBool::new(false)),
        topics: Arc::new(topics),
        mqtt,
        store,
    };

    spawn_mqtt_loop(
        app_state.clone(),
        eventloop,
        event_tx,
        runtime.signal.max_payload_bytes,
    );
    let control = spawn_control_loop(app_state.clone(), event_rx, ConsoleOutput);
    spawn_heartbeat_loop(app_state.clone(), runtime.signal.heartbeat_interval_ms);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route("/api/reset", post(handle_post_reset))
        .with_state(app_state);

    let port = std::env::var("SIGNAL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind signal server at {addr}"))?;

    info!("signal controller listening on http://{addr}");
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = control => info!("control loop stopped; shutting down"),
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
    }
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Ok(team_id) = std::env::var("TEAM_ID") {
        runtime.device.team_id = team_id;
    }
    if let Ok(light_id) = std::env::var("LIGHT_ID") {
        runtime.device.light_id = light_id;
    }
}

fn subscribe_topics(mqtt: &AsyncClient, topics: &HeadTopics) {
    for topic in topics.subscriptions() {
        // Called from the event loop task, so it must not wait on the
        // request queue that task drains.
        if let Err(err) = mqtt.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            warn!("mqtt subscribe to {topic} failed: {err}");
        }
    }
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
    events: mpsc::Sender<InboundEvent>,
    max_payload_bytes: usize,
) {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match inbound_field_event(
                        &app_state.topics,
                        &message.topic,
                        &message.payload,
                        max_payload_bytes,
                    ) {
                        Ok(event) => event,
                        Err(reason) => {
                            warn!("dropping MQTT message on {}: {reason}", message.topic);
                            continue;
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.link.store(true, Ordering::Relaxed);
                    subscribe_topics(&app_state.mqtt, &app_state.topics);
                    continue;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    app_state.link.store(false, Ordering::Relaxed);
                    continue;
                }
                Ok(_) => continue,
                Err(err) => {
                    app_state.link.store(false, Ordering::Relaxed);
                    let code = transport_error_code(&err);
                    let message = err.to_string();
                    if events
                        .send(InboundEvent::TransportError { message, code })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("mqtt loop stopped; control loop is gone");
    });
}

fn transport_error_code(err: &ConnectionError) -> i32 {
    match err {
        ConnectionError::Io(io) => io.raw_os_error().unwrap_or(-1),
        _ => -1,
    }
}

fn spawn_control_loop<O>(
    app_state: AppState,
    mut events: mpsc::Receiver<InboundEvent>,
    mut output: O,
) -> JoinHandle<()>
where
    O: SignalOutput + Send + 'static,
{
    tokio::spawn(async move {
        output.show(&Frame::self_test());
        tokio::time::sleep(Duration::from_millis(SELF_TEST_MS)).await;

        let loop_interval_ms = {
            let mut engine = app_state.engine.lock().await;
            let actions = engine.start(monotonic_ms());
            execute_engine_actions(&mut output, actions);
            engine.config.loop_interval_ms
        };

        let mut interval = tokio::time::interval(Duration::from_millis(loop_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let mut pending = Vec::new();
            while let Ok(event) = events.try_recv() {
                pending.push(event);
            }

            // No operator button on a workstation.
            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.run_iteration(now_ms, pending, app_state.link.as_ref(), false)
            };

            if execute_engine_actions(&mut output, actions) {
                warn!("restart requested");
                break;
            }
        }
    })
}

fn execute_engine_actions<O: SignalOutput>(output: &mut O, actions: Vec<EngineAction>) -> bool {
    let mut restart = false;
    for action in actions {
        match action {
            EngineAction::Render(frame) => output.show(&frame),
            EngineAction::Restart => restart = true,
        }
    }
    restart
}

fn spawn_heartbeat_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            if !app_state.link.load(Ordering::Relaxed) {
                continue;
            }

            if let Err(err) = app_state
                .mqtt
                .publish(app_state.topics.online(), QoS::AtLeastOnce, true, "true")
                .await
            {
                warn!("heartbeat publish failed: {err}");
                continue;
            }

            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&TelemetryPayload::new(engine.snapshot(), monotonic_ms()))
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(app_state.topics.telemetry(), QoS::AtMostOnce, false, body)
                        .await
                    {
                        warn!("telemetry publish failed: {err}");
                    }
                }
                Err(err) => warn!("telemetry serialization failed: {err}"),
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.snapshot();
    Json(status)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load config from store: {err:#}");
            RuntimeConfig::default()
        });
    Json(ConfigView::from_runtime(&runtime))
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let mut runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load existing config for update: {err:#}");
            RuntimeConfig::default()
        });

    let response = match update.apply(&mut runtime) {
        Ok(response) => response,
        Err(err) => return config_error_response(&err),
    };

    if let Err(err) = state.store.save_runtime_config(&runtime).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        );
    }

    Json(response).into_response()
}

async fn handle_post_reset(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(err) = state.store.clear().await {
        warn!("failed to clear stored settings: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear settings",
        );
    }

    info!("stored settings cleared");
    Json(ResetResponse {
        reset: true,
        restart_required: true,
    })
    .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("SIGNAL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.signal"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.runtime_path.as_ref()).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn describe_lamps(frame: &Frame) -> String {
    let lamp = |lit: bool, name: char| if lit { name } else { '.' };
    [
        lamp(frame.lamps.red, 'R'),
        lamp(frame.lamps.yellow, 'Y'),
        lamp(frame.lamps.green, 'G'),
    ]
    .iter()
    .collect()
}

fn describe_display(frame: &Frame) -> String {
    frame
        .display
        .glyphs()
        .iter()
        .map(|glyph| match glyph {
            Glyph::Blank => ' ',
            Glyph::Dash => '-',
            Glyph::Digit(digit) => char::from(b'0' + digit),
        })
        .collect()
}

fn config_error_response(err: &ConfigUpdateError) -> axum::response::Response {
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
