use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use signal_common::{
    config::{DeviceConfig, NetworkConfig, PinConfig},
    EngineAction, Frame, HeadTopics, InboundEvent, Reachability, RuntimeConfig, SignalConfig,
    SignalEngine, SignalOutput,
};

use crate::{
    api::{
        inbound_field_event, ConfigUpdate, ConfigView, HeartbeatSchedule, ResetResponse,
        TelemetryPayload,
    },
    tm1637::Tm1637,
};

const NVS_NAMESPACE: &str = "traffic-light";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 2048;
const EVENT_QUEUE_DEPTH: usize = 32;
const PROVISIONING_AP_PASSWORD: &str = "config123";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SELF_TEST_MS: u64 = 1_000;
const PROVISIONING_RESTART_DELAY_MS: u64 = 3_000;
const PUBLISHER_POLL_MS: u64 = 100;

const PROVISIONING_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Traffic Light Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:8px;padding:1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}.muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Traffic Light Setup</h1>
  <p class="muted">Saving restarts the device with the new settings.</p>
  <div class="card">
    <div class="row">
      <div><label>Team ID</label><input id="teamId" type="text"></div>
      <div><label>Light ID</label><input id="lightId" type="text"></div>
    </div>
    <label>WiFi SSID</label><input id="wifiSsid" type="text">
    <label>WiFi Password (leave blank to keep current)</label><input id="wifiPass" type="password">
    <div class="row">
      <div><label>MQTT Host</label><input id="mqttHost" type="text"></div>
      <div><label>MQTT Port</label><input id="mqttPort" type="number" min="1" max="65535"></div>
    </div>
    <label>MQTT Username</label><input id="mqttUser" type="text">
    <label>MQTT Password (leave blank to keep current)</label><input id="mqttPass" type="password">
    <button id="save">Save</button>
    <button id="reset">Factory Reset</button>
    <div id="status" class="muted"></div>
  </div>
  <script>
    const q=(id)=>document.getElementById(id);
    const say=(cls,text)=>{q('status').className=cls;q('status').textContent=text;};
    async function api(path,opt){const r=await fetch(path,opt);let b={};try{b=await r.json();}catch(_){}if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));return b;}
    async function load(){
      const c=await api('/api/config');
      for(const k of ['teamId','lightId','wifiSsid','mqttHost','mqttUser'])q(k).value=c[k]||'';
      q('mqttPort').value=c.mqttPort||1883;
    }
    q('save').addEventListener('click', async ()=>{
      say('muted','Saving...');
      try{
        const payload={
          teamId:q('teamId').value.trim(),
          lightId:q('lightId').value.trim(),
          wifiSsid:q('wifiSsid').value.trim(),
          wifiPass:q('wifiPass').value||undefined,
          mqttHost:q('mqttHost').value.trim(),
          mqttPort:Number(q('mqttPort').value||1883),
          mqttUser:q('mqttUser').value.trim(),
          mqttPass:q('mqttPass').value||undefined,
        };
        await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        say('ok','Saved. Restarting...');
      }catch(err){say('err',err.message);}
    });
    q('reset').addEventListener('click', async ()=>{
      if(!confirm('Erase all settings?'))return;
      try{await api('/api/reset',{method:'POST'});say('ok','Settings erased. Restarting...');}
      catch(err){say('err',err.message);}
    });
    load().catch((err)=>say('err',err.message));
  </script>
</body>
</html>
"#;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<SignalEngine>>,
    topics: Arc<HeadTopics>,
    mqtt_connected: Arc<AtomicBool>,
    resubscribe: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspLink {
    mqtt_connected: Arc<AtomicBool>,
}

impl Reachability for EspLink {
    fn is_reachable(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed) && is_wifi_station_connected()
    }
}

type Lamp = PinDriver<'static, AnyOutputPin, Output>;
type Button = PinDriver<'static, AnyIOPin, Input>;

struct HeadOutput {
    red: Option<Lamp>,
    yellow: Option<Lamp>,
    green: Option<Lamp>,
    display: Option<Tm1637>,
    display_faulted: bool,
}

impl HeadOutput {
    fn new(pins: &PinConfig) -> Self {
        let display = match Tm1637::new(pins.display_clk, pins.display_dio, pins.display_brightness)
        {
            Ok(display) => {
                info!(
                    "TM1637 display on CLK GPIO{} / DIO GPIO{}",
                    pins.display_clk, pins.display_dio
                );
                Some(display)
            }
            Err(err) => {
                warn!("segment display unavailable, running lamps only: {err:#}");
                None
            }
        };

        Self {
            red: init_lamp("red", pins.red),
            yellow: init_lamp("yellow", pins.yellow),
            green: init_lamp("green", pins.green),
            display,
            display_faulted: false,
        }
    }
}

impl SignalOutput for HeadOutput {
    fn show(&mut self, frame: &Frame) {
        drive_lamp(&mut self.red, "red", frame.lamps.red);
        drive_lamp(&mut self.yellow, "yellow", frame.lamps.yellow);
        drive_lamp(&mut self.green, "green", frame.lamps.green);

        let Some(display) = self.display.as_mut() else {
            return;
        };
        match display.show(&frame.display.glyphs()) {
            Ok(()) => {
                if self.display_faulted {
                    info!("segment display responding again");
                }
                self.display_faulted = false;
            }
            Err(err) => {
                if !self.display_faulted {
                    warn!("segment display write failed: {err:#}");
                }
                self.display_faulted = true;
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: head={}/{}, ssid=`{}`, mqtt=`{}:{}`",
        runtime.device.team_id,
        runtime.device.light_id,
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut output = HeadOutput::new(&runtime.pins);
    let button = init_button(runtime.pins.button);

    output.show(&Frame::self_test());
    thread::sleep(Duration::from_millis(SELF_TEST_MS));
    let config_requested = button.as_ref().is_some_and(|button| button.is_low());

    let wifi = match connect_wifi(
        modem,
        sys_loop.clone(),
        nvs_partition,
        &runtime,
        config_requested,
    )
    .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi) => {
            output.show(&Frame::offline_lit());
            let server = create_provisioning_http_server(nvs_store.clone())?;

            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let topics = HeadTopics::new(&runtime.device.team_id, &runtime.device.light_id);
    let shared_state = SharedState {
        engine: Arc::new(Mutex::new(SignalEngine::new(runtime.signal.clone()))),
        topics: Arc::new(topics),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        resubscribe: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) =
        create_mqtt_client(&runtime.network, &runtime.device, &shared_state.topics)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let (event_tx, event_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);

    spawn_mqtt_receiver(
        shared_state.clone(),
        mqtt_conn,
        event_tx,
        runtime.signal.max_payload_bytes,
    );
    spawn_mqtt_publisher(
        shared_state.clone(),
        mqtt_client,
        runtime.signal.heartbeat_interval_ms,
    );
    spawn_control_loop(
        shared_state.clone(),
        event_rx,
        output,
        button,
        runtime.signal.clone(),
    );

    let server = create_http_server(shared_state, nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler("/api/status", Method::Get, move |req| {
        let status = state.engine.lock().unwrap().snapshot();
        write_json(req, &status)
    })?;

    register_config_handlers(&mut server, nvs_store, false)?;
    Ok(server)
}

fn create_provisioning_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PROVISIONING_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    register_config_handlers(&mut server, nvs_store, true)?;
    Ok(server)
}

// Provisioning mode restarts after a successful write.
fn register_config_handlers(
    server: &mut EspHttpServer<'static>,
    nvs_store: NvsStore,
    restart_after_write: bool,
) -> anyhow::Result<()> {
    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            write_json(req, &ConfigView::from_runtime(&runtime))
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("invalid config payload: {err}")),
            };

            let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
            let response = match update.apply(&mut runtime) {
                Ok(response) => response,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            nvs_store.save_runtime_config(&runtime)?;
            info!("settings updated (restart required: {})", response.restart_required);

            if restart_after_write {
                schedule_restart(PROVISIONING_RESTART_DELAY_MS)?;
            }
            write_json(req, &response)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/reset", Method::Post, move |req| {
        nvs_store.clear()?;
        warn!("stored settings cleared");

        if restart_after_write {
            schedule_restart(PROVISIONING_RESTART_DELAY_MS)?;
        }
        write_json(
            req,
            &ResetResponse {
                reset: true,
                restart_required: true,
            },
        )
    })?;

    Ok(())
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn schedule_restart(delay_ms: u64) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn provisioning_ap_ssid(esp_wifi: &EspWifi<'static>, device: &DeviceConfig) -> String {
    match esp_wifi.ap_netif().get_mac() {
        Ok(mac) => format!(
            "TrafficLight-{}-{:02X}{:02X}",
            device.light_id, mac[4], mac[5]
        ),
        Err(err) => {
            warn!("failed to read AP MAC address: {err}");
            format!("TrafficLight-{}", device.light_id)
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    runtime: &RuntimeConfig,
    config_requested: bool,
) -> anyhow::Result<WifiStartup> {
    let network = &runtime.network;
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let ap_ssid = provisioning_ap_ssid(&esp_wifi, &runtime.device);
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if config_requested {
        warn!("config button held at boot; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi, &ap_ssid)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi, &ap_ssid)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi, &ap_ssid)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        ssid, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
    device: &DeviceConfig,
    topics: &HeadTopics,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let client_id = format!("traffic-light-{}-{}", device.team_id, device.light_id);
    let online_topic = topics.online();

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(15)),
        lwt: Some(LwtConfiguration {
            topic: online_topic.as_str(),
            payload: b"false",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    topics: &HeadTopics,
) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in topics.subscriptions() {
        mqtt.subscribe(&topic, QoS::AtLeastOnce)
            .with_context(|| format!("subscribe to {topic} failed"))?;
    }

    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    events: SyncSender<InboundEvent>,
    max_payload_bytes: usize,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            loop {
                let event = match conn.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("mqtt connected");
                            state.mqtt_connected.store(true, Ordering::Relaxed);
                            // Subscribing from this thread would block the
                            // connection; the publisher thread does it.
                            state.resubscribe.store(true, Ordering::Relaxed);
                            continue;
                        }
                        EventPayload::Disconnected => {
                            warn!("mqtt disconnected");
                            state.mqtt_connected.store(false, Ordering::Relaxed);
                            continue;
                        }
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details: Details::Complete,
                            ..
                        } => match inbound_field_event(&state.topics, topic, data, max_payload_bytes)
                        {
                            Ok(event) => event,
                            Err(reason) => {
                                warn!("dropping MQTT message on {topic}: {reason}");
                                continue;
                            }
                        },
                        EventPayload::Error(err) => InboundEvent::TransportError {
                            message: err.to_string(),
                            code: err.code(),
                        },
                        _ => continue,
                    },
                    Err(err) => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        thread::sleep(Duration::from_secs(2));
                        InboundEvent::TransportError {
                            message: err.to_string(),
                            code: err.code(),
                        }
                    }
                };

                if events.send(event).is_err() {
                    warn!("control loop is gone; stopping mqtt receiver");
                    break;
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_control_loop(
    state: SharedState,
    events: Receiver<InboundEvent>,
    mut output: HeadOutput,
    button: Option<Button>,
    signal: SignalConfig,
) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let link = EspLink {
                mqtt_connected: state.mqtt_connected.clone(),
            };
            let loop_interval = Duration::from_millis(signal.loop_interval_ms);

            {
                let mut engine = state.engine.lock().unwrap();
                let actions = engine.start(monotonic_ms());
                execute_engine_actions(&mut output, actions);
            }

            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if is_wifi_station_connected() {
                    wifi_disconnected_since_ms = None;
                } else if let Some(disconnected_since_ms) = wifi_disconnected_since_ms {
                    if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
                        warn!(
                            "wifi disconnected for {}s; restarting device for recovery",
                            WIFI_RESTART_GRACE_MS / 1000
                        );
                        restart_now();
                    }
                } else {
                    wifi_disconnected_since_ms = Some(now_ms);
                }

                let pending: Vec<InboundEvent> = events.try_iter().collect();
                let pressed = button.as_ref().is_some_and(|button| button.is_low());

                let actions = {
                    let mut engine = state.engine.lock().unwrap();
                    engine.run_iteration(now_ms, pending, &link, pressed)
                };

                if execute_engine_actions(&mut output, actions) {
                    warn!("override button held; restarting");
                    restart_now();
                }

                thread::sleep(loop_interval);
            }
        })
        .expect("failed to spawn control loop thread");
}

fn execute_engine_actions(output: &mut HeadOutput, actions: Vec<EngineAction>) -> bool {
    let mut restart = false;
    for action in actions {
        match action {
            EngineAction::Render(frame) => output.show(&frame),
            EngineAction::Restart => restart = true,
        }
    }
    restart
}

// Client calls can stall for the network timeout, so they stay off the
// control loop.
fn spawn_mqtt_publisher(
    state: SharedState,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    heartbeat_interval_ms: u64,
) {
    thread::Builder::new()
        .name("mqtt-tx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let link = EspLink {
                mqtt_connected: state.mqtt_connected.clone(),
            };
            let mut heartbeat = HeartbeatSchedule::new(heartbeat_interval_ms);

            loop {
                if state.resubscribe.swap(false, Ordering::Relaxed) {
                    if let Err(err) = subscribe_topics(&mqtt, &state.topics) {
                        warn!("mqtt subscribe failed: {err:#}");
                        state.resubscribe.store(true, Ordering::Relaxed);
                    }
                }

                if heartbeat.due(monotonic_ms(), link.is_reachable()) {
                    if let Err(err) = publish_heartbeat(&state, &mqtt) {
                        warn!("heartbeat publish failed: {err:#}");
                    }
                }

                thread::sleep(Duration::from_millis(PUBLISHER_POLL_MS));
            }
        })
        .expect("failed to spawn mqtt publisher thread");
}

fn publish_heartbeat(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let payload = {
        let engine = state.engine.lock().unwrap();
        serde_json::to_vec(&TelemetryPayload::new(engine.snapshot(), monotonic_ms()))?
    };

    let mut client = mqtt.lock().unwrap();
    client.publish(&state.topics.online(), QoS::AtLeastOnce, true, b"true")?;
    client.publish(&state.topics.telemetry(), QoS::AtMostOnce, false, &payload)?;
    Ok(())
}

fn init_lamp(name: &str, pin: i32) -> Option<Lamp> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut lamp) => {
            let _ = lamp.set_low();
            Some(lamp)
        }
        Err(err) => {
            warn!("{name} lamp unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn drive_lamp(lamp: &mut Option<Lamp>, name: &str, lit: bool) {
    let Some(lamp) = lamp.as_mut() else {
        return;
    };

    let result = if lit { lamp.set_high() } else { lamp.set_low() };
    if let Err(err) = result {
        warn!("failed to drive {name} lamp: {err}");
    }
}

fn init_button(pin: i32) -> Option<Button> {
    let driver = unsafe { PinDriver::input(AnyIOPin::new(pin)) };
    match driver {
        Ok(mut button) => {
            if let Err(err) = button.set_pull(Pull::Up) {
                warn!("failed to enable pull-up on button GPIO{pin}: {err}");
            }
            Some(button)
        }
        Err(err) => {
            warn!("override button unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.remove(NVS_RUNTIME_KEY)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn restart_now() -> ! {
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
    unreachable!("esp_restart returned")
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
