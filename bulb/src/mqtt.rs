use std::time::Duration;

use anyhow::bail;
use bulb_common::{device_topic, strip_device_prefix, Task, TaskContext};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

pub const MAX_SUBSCRIPTIONS: usize = 5;
pub const MAX_TOPIC_LEN: usize = 19;
pub const MAX_PAYLOAD_BYTES: usize = 256;

/// Upper bound on link events handled per scheduler run, so a burst of
/// messages cannot starve the other tasks.
const EVENTS_PER_EXECUTE: usize = 8;
const REQUEST_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// What the network side reports back to the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

type MessageHandler = Box<dyn FnMut(&str, &mut TaskContext<'_>)>;
type ConnectedHook = Box<dyn FnMut(&MqttPublisher)>;

struct Subscription {
    topic: String,
    handler: MessageHandler,
}

/// Cheap handle for publishing device-relative topics.
#[derive(Clone)]
pub struct MqttPublisher {
    device_name: String,
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(device_name: impl Into<String>, client: AsyncClient) -> Self {
        Self {
            device_name: device_name.into(),
            client,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Queues a publish without waiting for the network. Returns false when
    /// the request queue is full or closed.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let full_topic = device_topic(&self.device_name, topic);
        match self
            .client
            .try_publish(full_topic.as_str(), QoS::AtMostOnce, false, payload)
        {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt publish to {full_topic} failed: {err}");
                false
            }
        }
    }
}

/// MQTT session driven by the timer system.
///
/// Register it as a shared task. Each run drains a handful of link events:
/// on (re)connect every subscription is renewed and the connected hook runs,
/// inbound messages are dispatched by device-relative topic.
pub struct MqttClient {
    publisher: MqttPublisher,
    events: UnboundedReceiver<LinkEvent>,
    subscriptions: Vec<Subscription>,
    on_connected: Option<ConnectedHook>,
    connected: bool,
}

impl MqttClient {
    pub fn new(publisher: MqttPublisher, events: UnboundedReceiver<LinkEvent>) -> Self {
        Self {
            publisher,
            events,
            subscriptions: Vec::new(),
            on_connected: None,
            connected: false,
        }
    }

    pub fn publisher(&self) -> &MqttPublisher {
        &self.publisher
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscribe<F>(&mut self, topic: &str, handler: F) -> anyhow::Result<()>
    where
        F: FnMut(&str, &mut TaskContext<'_>) + 'static,
    {
        if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
            bail!("topic {topic:?} must be 1..={MAX_TOPIC_LEN} characters");
        }
        if self.subscriptions.iter().any(|sub| sub.topic == topic) {
            bail!("topic {topic:?} is already subscribed");
        }
        if self.subscriptions.len() >= MAX_SUBSCRIPTIONS {
            bail!("no room for more than {MAX_SUBSCRIPTIONS} subscriptions");
        }

        self.subscriptions.push(Subscription {
            topic: topic.to_string(),
            handler: Box::new(handler),
        });
        if self.connected {
            self.request_subscription(topic);
        }
        Ok(())
    }

    pub fn on_connected<F>(&mut self, hook: F)
    where
        F: FnMut(&MqttPublisher) + 'static,
    {
        self.on_connected = Some(Box::new(hook));
    }

    fn request_subscription(&self, topic: &str) {
        let full_topic = device_topic(self.publisher.device_name(), topic);
        if let Err(err) = self
            .publisher
            .client
            .try_subscribe(full_topic.as_str(), QoS::AtMostOnce)
        {
            warn!("mqtt subscribe to {full_topic} failed: {err}");
        }
    }

    fn handle_connected(&mut self) {
        info!("mqtt connected as {}", self.publisher.device_name());
        self.connected = true;
        for sub in &self.subscriptions {
            self.request_subscription(&sub.topic);
        }
        if let Some(hook) = self.on_connected.as_mut() {
            hook(&self.publisher);
        }
    }

    fn dispatch(&mut self, topic: &str, payload: Vec<u8>, ctx: &mut TaskContext<'_>) {
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(
                "dropping oversized mqtt payload on {topic} ({} bytes)",
                payload.len()
            );
            return;
        }
        let Ok(message) = String::from_utf8(payload) else {
            warn!("dropping non utf8 mqtt payload on {topic}");
            return;
        };
        let Some(relative) = strip_device_prefix(self.publisher.device_name(), topic) else {
            debug!("ignoring message on foreign topic {topic}");
            return;
        };

        match self.subscriptions.iter_mut().find(|sub| sub.topic == relative) {
            Some(sub) => (sub.handler)(&message, ctx),
            None => debug!("no subscriber for {topic}"),
        }
    }
}

impl Task for MqttClient {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        for _ in 0..EVENTS_PER_EXECUTE {
            match self.events.try_recv() {
                Ok(LinkEvent::Connected) => self.handle_connected(),
                Ok(LinkEvent::Disconnected(reason)) => {
                    if self.connected {
                        warn!("mqtt connection lost: {reason}");
                    }
                    self.connected = false;
                }
                Ok(LinkEvent::Message { topic, payload }) => self.dispatch(&topic, payload, ctx),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.connected {
                        warn!("mqtt event loop stopped");
                    }
                    self.connected = false;
                    break;
                }
            }
        }
    }

    fn release(&mut self) {
        if let Err(err) = self.publisher.client.try_disconnect() {
            debug!("mqtt disconnect failed: {err}");
        }
        self.connected = false;
    }
}

/// Opens a session for `device_name` and spawns its network loop on `runtime`.
pub fn connect(runtime: &Handle, device_name: &str, host: &str, port: u16) -> MqttClient {
    let mut options = MqttOptions::new(device_name, host, port);
    options.set_keep_alive(Duration::from_secs(15));

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    spawn_event_loop(runtime, eventloop, events_tx);

    MqttClient::new(MqttPublisher::new(device_name, client), events_rx)
}

fn spawn_event_loop(runtime: &Handle, mut eventloop: EventLoop, events: UnboundedSender<LinkEvent>) {
    runtime.spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => LinkEvent::Connected,
                Ok(Event::Incoming(Incoming::Publish(message))) => LinkEvent::Message {
                    topic: message.topic,
                    payload: message.payload.to_vec(),
                },
                Ok(_) => continue,
                Err(err) => {
                    if events.send(LinkEvent::Disconnected(err.to_string())).is_err() {
                        break;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if events.send(event).is_err() {
                break;
            }
        }
        debug!("mqtt event loop finished");
    });
}
