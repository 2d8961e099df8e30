use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use bulb_common::{ConfigOverrides, DeviceConfig, Task, TaskContext, TimeSpec};
use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::host::ConfigStore;

pub const REQUEST_QUEUE: usize = 8;
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRequest {
    Status,
    Save {
        device_name: Option<String>,
        mqtt_server: Option<String>,
    },
    Reset,
}

/// A request waiting for the main loop, with the channel its page goes back on.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: WebRequest,
    pub reply: oneshot::Sender<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SaveParams {
    #[serde(rename = "deviceName")]
    device_name: Option<String>,
    #[serde(rename = "mqttServer")]
    mqtt_server: Option<String>,
}

#[derive(Clone)]
struct WebState {
    requests: mpsc::Sender<PendingRequest>,
    timeout: Duration,
}

pub fn router(requests: mpsc::Sender<PendingRequest>) -> Router {
    Router::new()
        .route("/", get(handle_status))
        .route("/save", get(handle_save))
        .route("/reset", get(handle_reset))
        .with_state(WebState {
            requests,
            timeout: REPLY_TIMEOUT,
        })
}

async fn handle_status(State(state): State<WebState>) -> Response {
    forward(&state, WebRequest::Status).await
}

async fn handle_save(State(state): State<WebState>, Query(params): Query<SaveParams>) -> Response {
    let request = WebRequest::Save {
        device_name: params.device_name,
        mqtt_server: params.mqtt_server,
    };
    forward(&state, request).await
}

async fn handle_reset(State(state): State<WebState>) -> Response {
    forward(&state, WebRequest::Reset).await
}

async fn forward(state: &WebState, request: WebRequest) -> Response {
    let (reply, page) = oneshot::channel();
    if let Err(err) = state.requests.try_send(PendingRequest { request, reply }) {
        warn!("web request rejected: {err}");
        return (StatusCode::SERVICE_UNAVAILABLE, "device busy").into_response();
    }

    match tokio::time::timeout(state.timeout, page).await {
        Ok(Ok(page)) => Html(page).into_response(),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "device shutting down").into_response(),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "device did not answer").into_response(),
    }
}

/// Serves queued web requests from inside the timer system, one per run.
pub struct WebServer {
    requests: mpsc::Receiver<PendingRequest>,
    config: Rc<RefCell<DeviceConfig>>,
    store: ConfigStore,
    restart: Rc<Cell<bool>>,
}

impl WebServer {
    pub fn new(
        requests: mpsc::Receiver<PendingRequest>,
        config: Rc<RefCell<DeviceConfig>>,
        store: ConfigStore,
        restart: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            requests,
            config,
            store,
            restart,
        }
    }

    fn save(&self, device_name: Option<String>, mqtt_server: Option<String>) -> String {
        let overrides = ConfigOverrides {
            device_name,
            mqtt_server,
            ..ConfigOverrides::default()
        };

        let mut config = self.config.borrow_mut();
        if !overrides.apply(&mut config) {
            return render_saved(&config, None);
        }

        info!(
            "web save: device {:?}, mqtt server {:?}",
            config.device_name, config.mqtt_server
        );
        match self.store.save(&config) {
            Ok(()) => render_saved(&config, None),
            Err(err) => {
                warn!("failed to persist config: {err:#}");
                render_saved(&config, Some("saving to flash failed"))
            }
        }
    }
}

impl Task for WebServer {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        let pending = match self.requests.try_recv() {
            Ok(pending) => pending,
            Err(_) => return,
        };

        let page = match pending.request {
            WebRequest::Status => render_status(&self.config.borrow(), ctx.now(), ctx.count()),
            WebRequest::Save {
                device_name,
                mqtt_server,
            } => self.save(device_name, mqtt_server),
            WebRequest::Reset => {
                info!("restart requested over http");
                self.restart.set(true);
                render_reset()
            }
        };

        if pending.reply.send(page).is_err() {
            debug!("web client left before the reply was ready");
        }
    }

    fn release(&mut self) {
        self.requests.close();
    }
}

const PAGE_HEAD: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width\"><title>Bulb</title></head><body>";
const PAGE_TAIL: &str = "</body></html>";

pub fn render_status(config: &DeviceConfig, uptime: TimeSpec, tasks: usize) -> String {
    let state = if config.state.is_empty() {
        "off"
    } else {
        config.state.as_str()
    };

    format!(
        "{PAGE_HEAD}<h1>{name}</h1>\
<p>MQTT server: {server}</p>\
<p>LED state: {state}</p>\
<p>Uptime: {uptime}s, {tasks} tasks</p>\
<form action=\"/save\" method=\"get\">\
<label>Device name <input name=\"deviceName\" maxlength=\"39\" value=\"{name_attr}\"></label>\
<label>MQTT server <input name=\"mqttServer\" maxlength=\"39\" value=\"{server_attr}\"></label>\
<button type=\"submit\">Save</button></form>\
<p><a href=\"/reset\">Restart</a></p>{PAGE_TAIL}",
        name = encode_text(display_name(config)),
        server = encode_text(&config.mqtt_server),
        state = encode_text(state),
        uptime = uptime.secs(),
        name_attr = encode_double_quoted_attribute(&config.device_name),
        server_attr = encode_double_quoted_attribute(&config.mqtt_server),
    )
}

pub fn render_saved(config: &DeviceConfig, error: Option<&str>) -> String {
    let notice = match error {
        Some(error) => format!("<p>Error: {}</p>", encode_text(error)),
        None => "<p>Saved. Restart the device to apply.</p>".to_string(),
    };
    format!(
        "{PAGE_HEAD}<h1>{name}</h1>{notice}<p><a href=\"/reset\">Restart now</a> \
<a href=\"/\">Back</a></p>{PAGE_TAIL}",
        name = encode_text(display_name(config)),
    )
}

pub fn render_reset() -> String {
    format!("{PAGE_HEAD}<p>Restarting...</p>{PAGE_TAIL}")
}

fn display_name(config: &DeviceConfig) -> &str {
    if config.device_name.is_empty() {
        "Unconfigured bulb"
    } else {
        &config.device_name
    }
}
