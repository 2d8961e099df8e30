pub const TOPIC_LED: &str = "led";
pub const TOPIC_SUNRISE: &str = "sunrise";
pub const TOPIC_STATUS: &str = "status";
pub const TOPIC_HEARTBEAT: &str = "heartbeat";

/// Payload published on `status` when the device goes away cleanly.
pub const STATUS_OFFLINE: &str = "offline";

pub fn device_topic(device: &str, topic: &str) -> String {
    format!("{device}/{topic}")
}

/// Inverse of [`device_topic`]: `bedroom/led` -> `led` for device `bedroom`.
pub fn strip_device_prefix<'a>(device: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(device)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}
