use std::{
    cell::{Cell, RefCell},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use bulb_common::{
    ConfigOverrides, DeviceConfig, HeartbeatPayload, LedLevels, SunriseRamp, SystemClock,
    TaskContext, TaskId, TimeSpec, TimerConfig, TimerError, TimerSystem, STATUS_OFFLINE,
    TOPIC_HEARTBEAT, TOPIC_LED, TOPIC_STATUS, TOPIC_SUNRISE,
};
use chrono::{SecondsFormat, Utc};
use tokio::{net::TcpListener, runtime::Handle, sync::mpsc};
use tracing::{info, warn};

use crate::{
    leds::{SimulatedLeds, LED_MAX},
    mqtt::{self, MqttClient, MqttPublisher},
    web::{self, WebServer, REQUEST_QUEUE},
};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("config.json"),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("BULB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.bulb"));
        Self::new(data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<DeviceConfig> {
        match std::fs::read(&self.path) {
            Ok(raw) => DeviceConfig::from_json(&raw)
                .with_context(|| format!("invalid config in {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = config.to_json()?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Provisioning values taken from the environment.
fn overrides_from(lookup: impl Fn(&str) -> Option<String>) -> ConfigOverrides {
    let port = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u16>().ok());
    ConfigOverrides {
        device_name: lookup("BULB_DEVICE_NAME"),
        mqtt_server: lookup("MQTT_HOST"),
        mqtt_port: port("MQTT_PORT"),
        http_port: port("BULB_HTTP_PORT"),
    }
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::from_env();
    let mut config = store.load().unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        DeviceConfig::default()
    });
    if overrides_from(|key| std::env::var(key).ok()).apply(&mut config) {
        if let Err(err) = store.save(&config) {
            warn!("failed to persist provisioning values: {err:#}");
        }
    }
    let timing = config.timers.clone();

    let leds = Rc::new(RefCell::new(SimulatedLeds::new()));
    LedLevels::parse(&config.state).apply(&mut *leds.borrow_mut());

    let config = Rc::new(RefCell::new(config));
    let restart = Rc::new(Cell::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to start network runtime")?;
    spawn_shutdown_listener(runtime.handle(), shutdown.clone());

    let mut timers = TimerSystem::with_capacity(SystemClock::new(), timing.max_tasks);

    let (web_tx, web_rx) = mpsc::channel(REQUEST_QUEUE);
    let http_port = config.borrow().http_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = runtime
        .block_on(TcpListener::bind(addr))
        .with_context(|| format!("failed to bind config server at {addr}"))?;
    info!("config server listening on http://{addr}");
    let app = web::router(web_tx);
    runtime.spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("config server stopped: {err}");
        }
    });
    timers
        .add(
            WebServer::new(web_rx, config.clone(), store.clone(), restart.clone()),
            period(timing.web_poll_ms),
        )
        .context("failed to register web server")?;

    let mqtt = if config.borrow().is_mqtt_configured() {
        let client = Rc::new(RefCell::new(build_mqtt(
            runtime.handle(),
            &config,
            &leds,
            &store,
            &timing,
        )?));
        timers
            .add_shared(&client, period(timing.mqtt_poll_ms))
            .context("failed to register mqtt client")?;

        let publisher = client.borrow().publisher().clone();
        let heartbeat_config = config.clone();
        let booted = Instant::now();
        timers
            .add_fn(
                move || publish_heartbeat(&publisher, &heartbeat_config.borrow(), booted),
                period(timing.heartbeat_ms),
            )
            .context("failed to register heartbeat")?;
        Some(client)
    } else {
        info!("mqtt not configured; set device name and server on the config page");
        None
    };

    let tick = Duration::from_millis(u64::from(timing.tick_ms));
    while !shutdown.load(Ordering::Relaxed) && !restart.get() {
        timers.tick();
        std::thread::sleep(tick);
    }

    if let Some(client) = &mqtt {
        client.borrow().publisher().publish(TOPIC_STATUS, STATUS_OFFLINE);
        if let Err(err) = timers.remove_shared(client) {
            warn!("failed to remove mqtt client: {err}");
        }
    }
    timers.reset();
    runtime.shutdown_timeout(Duration::from_secs(1));

    if restart.get() {
        info!("restart requested; exiting");
    }
    Ok(())
}

fn period(millis: u32) -> TimeSpec {
    TimeSpec::from_millis(u64::from(millis))
}

fn spawn_shutdown_listener(runtime: &Handle, shutdown: Arc<AtomicBool>) {
    runtime.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.store(true, Ordering::Relaxed);
            }
            Err(err) => warn!("failed to listen for ctrl-c: {err}"),
        }
    });
}

fn build_mqtt(
    runtime: &Handle,
    config: &Rc<RefCell<DeviceConfig>>,
    leds: &Rc<RefCell<SimulatedLeds>>,
    store: &ConfigStore,
    timing: &TimerConfig,
) -> anyhow::Result<MqttClient> {
    let (device_name, server, port) = {
        let config = config.borrow();
        (config.device_name.clone(), config.mqtt_server.clone(), config.mqtt_port)
    };
    info!("mqtt broker {server}:{port}");
    let mut client = mqtt::connect(runtime, &device_name, &server, port);
    let publisher = client.publisher().clone();

    {
        let publisher = publisher.clone();
        let leds = leds.clone();
        let config = config.clone();
        let store = store.clone();
        client.subscribe(TOPIC_LED, move |message, _| {
            let state = apply_led_command(message, &leds, &config, &store);
            publisher.publish(TOPIC_STATUS, state);
        })?;
    }

    {
        let publisher = publisher.clone();
        let leds = leds.clone();
        let active = Rc::new(Cell::new(None));
        let step = period(timing.sunrise_step_ms);
        client.subscribe(TOPIC_SUNRISE, move |message, ctx| {
            start_sunrise(message, ctx, &active, step, &leds, &publisher);
        })?;
    }

    let config = config.clone();
    client.on_connected(move |publisher| {
        let state = config.borrow().state.clone();
        publisher.publish(TOPIC_STATUS, state);
    });

    Ok(client)
}

/// Drives the LEDs from a `c,w,r,g,b` command and persists it as the boot
/// state. Returns the command as the LEDs show it, clamped to their range.
fn apply_led_command(
    message: &str,
    leds: &RefCell<SimulatedLeds>,
    config: &RefCell<DeviceConfig>,
    store: &ConfigStore,
) -> String {
    let levels = LedLevels::parse(message).clamped(LED_MAX);
    levels.apply(&mut *leds.borrow_mut());

    let state = levels.to_message();
    let mut config = config.borrow_mut();
    if config.state != state {
        config.set_state(&state);
        if let Err(err) = store.save(&config) {
            warn!("failed to persist led state: {err:#}");
        }
    }
    state
}

/// Replaces any running sunrise with a new ramp lasting `message` seconds.
fn start_sunrise(
    message: &str,
    ctx: &mut TaskContext<'_>,
    active: &Cell<Option<TaskId>>,
    step: TimeSpec,
    leds: &Rc<RefCell<SimulatedLeds>>,
    publisher: &MqttPublisher,
) {
    let Ok(seconds) = message.trim().parse::<u32>() else {
        warn!("ignoring sunrise request {message:?}");
        return;
    };

    if let Some(previous) = active.take() {
        match ctx.remove(previous) {
            Ok(()) | Err(TimerError::NotFound) => {}
            Err(err) => warn!("failed to stop previous sunrise: {err}"),
        }
    }

    let leds = leds.clone();
    let publisher = publisher.clone();
    let ramp = SunriseRamp::new(TimeSpec::from_secs(u64::from(seconds)), LED_MAX, move |level| {
        let levels = LedLevels {
            warm: level,
            ..LedLevels::default()
        };
        levels.apply(&mut *leds.borrow_mut());
        if level == LED_MAX {
            publisher.publish(TOPIC_STATUS, levels.to_message());
        }
    });

    match ctx.add(ramp, step) {
        Ok(id) => {
            info!("sunrise over {seconds}s started as {id}");
            active.set(Some(id));
        }
        Err(err) => warn!("failed to start sunrise: {err}"),
    }
}

fn publish_heartbeat(publisher: &MqttPublisher, config: &DeviceConfig, booted: Instant) {
    let payload = HeartbeatPayload {
        device_name: config.device_name.clone(),
        uptime_ms: booted.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
        state: config.state.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    match serde_json::to_vec(&payload) {
        Ok(body) => {
            publisher.publish(TOPIC_HEARTBEAT, body);
        }
        Err(err) => warn!("heartbeat serialization failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bulb_common::ManualClock;
    use pretty_assertions::assert_eq;
    use rumqttc::{AsyncClient, MqttOptions};

    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested"));

        assert_eq!(store.load().unwrap(), DeviceConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested"));
        let mut config = DeviceConfig::default();
        config.set_device_name("office");
        config.set_state("0,255,0,0,0");

        store.save(&config).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn corrupt_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.path(), b"{ nope").unwrap();

        assert!(store.load().is_err());
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BULB_DEVICE_NAME", "attic"),
            ("MQTT_PORT", "1884"),
            ("BULB_HTTP_PORT", "not-a-port"),
        ]);
        let overrides = overrides_from(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(overrides.device_name.as_deref(), Some("attic"));
        assert_eq!(overrides.mqtt_server, None);
        assert_eq!(overrides.mqtt_port, Some(1884));
        assert_eq!(overrides.http_port, None);
    }

    #[test]
    fn led_command_persists_the_clamped_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let leds = RefCell::new(SimulatedLeds::new());
        let config = RefCell::new(DeviceConfig::default());

        let state = apply_led_command("0,300,1", &leds, &config, &store);

        assert_eq!(state, "0,255,1,0,0");
        assert_eq!(leds.borrow().channels(), [0, LED_MAX, 0, 0, 1, 0]);
        assert_eq!(store.load().unwrap().state, "0,255,1,0,0");
        assert_eq!(config.borrow().state, "0,255,1,0,0");
    }

    #[test]
    fn new_sunrise_replaces_running_one() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("desk", "localhost", 1883), 16);
        let publisher = MqttPublisher::new("desk", client);
        let leds = Rc::new(RefCell::new(SimulatedLeds::new()));
        let active = Rc::new(Cell::new(None));

        let clock = ManualClock::new(0);
        let mut timers = TimerSystem::new(clock.clone());
        let trigger = {
            let leds = leds.clone();
            let active = active.clone();
            let publisher = publisher.clone();
            move |message: &'static str| {
                let leds = leds.clone();
                let active = active.clone();
                let publisher = publisher.clone();
                move |ctx: &mut TaskContext<'_>| {
                    start_sunrise(message, ctx, &active, TimeSpec::from_millis(100), &leds, &publisher)
                }
            }
        };

        timers.add(OneShot::new(trigger("60")), TimeSpec::from_millis(1)).unwrap();
        timers.tick();
        let first = active.get().unwrap();

        clock.advance(1);
        timers.add(OneShot::new(trigger("2")), TimeSpec::from_millis(1)).unwrap();
        timers.tick();
        let second = active.get().unwrap();

        assert_ne!(first, second);
        assert_eq!(timers.next_due(first), None);
        assert!(timers.next_due(second).is_some());

        clock.advance(100);
        timers.tick();
        clock.advance(2_000);
        timers.tick();
        assert_eq!(leds.borrow().channels()[1], LED_MAX);
        assert_eq!(timers.next_due(second), None);
    }

    #[test]
    fn bad_sunrise_payload_is_ignored() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("desk", "localhost", 1883), 16);
        let publisher = MqttPublisher::new("desk", client);
        let leds = Rc::new(RefCell::new(SimulatedLeds::new()));
        let active = Rc::new(Cell::new(None));

        let mut timers = TimerSystem::new(ManualClock::new(0));
        let (a, l, p) = (active.clone(), leds.clone(), publisher.clone());
        timers
            .add(
                OneShot::new(move |ctx: &mut TaskContext<'_>| {
                    start_sunrise("soon", ctx, &a, TimeSpec::from_millis(100), &l, &p)
                }),
                TimeSpec::from_millis(1),
            )
            .unwrap();
        timers.tick();

        assert_eq!(active.get(), None);
        assert_eq!(timers.count(), 0);
    }

    /// Runs a closure with the task context once, then unregisters.
    struct OneShot<F>(F);

    impl<F: FnMut(&mut TaskContext<'_>)> OneShot<F> {
        fn new(f: F) -> Self {
            Self(f)
        }
    }

    impl<F: FnMut(&mut TaskContext<'_>)> bulb_common::Task for OneShot<F> {
        fn execute(&mut self, ctx: &mut TaskContext<'_>) {
            (self.0)(ctx);
            ctx.remove_self();
        }
    }
}
