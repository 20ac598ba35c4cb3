use rumqttc::{AsyncClient, QoS};
use tracing::warn;

use crate::control::{Command, DEFAULT_HISTORY_LIMIT};
use crate::notify::{Notification, Notifier};

// ---------------------------------------------------------------------------
// Telemetry publisher
// ---------------------------------------------------------------------------

/// Publishes every notification as JSON on `<prefix>/<event>`.
pub struct MqttNotifier {
    client: AsyncClient,
    prefix: String,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }
}

impl Notifier for MqttNotifier {
    fn notify(&self, note: Notification) {
        let topic = format!("{}/{}", self.prefix, note.kind());
        let payload = match serde_json::to_vec(&note) {
            Ok(p) => p,
            Err(e) => {
                warn!(%topic, "mqtt: failed to serialise notification: {e}");
                return;
            }
        };
        // Never wait on the broker; a full request queue drops the message.
        if let Err(e) = self
            .client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, payload)
        {
            warn!(%topic, "mqtt: publish dropped: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Command topics
// ---------------------------------------------------------------------------

/// Topic filters the controller subscribes to for commands and queries.
pub(crate) fn command_subscriptions(prefix: &str) -> [String; 5] {
    [
        format!("{prefix}/pump/set"),
        format!("{prefix}/pump/get"),
        format!("{prefix}/presets/get"),
        format!("{prefix}/logs/get"),
        format!("{prefix}/preset/+/+"),
    ]
}

/// Split `<prefix>/<rest>` and return the segments of `rest`.
fn segments_after<'a>(topic: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    Some(rest.split('/').collect())
}

/// Extract (preset id, action) from "<prefix>/preset/<id>/<action>".
pub(crate) fn extract_preset_action<'a>(topic: &'a str, prefix: &str) -> Option<(i64, &'a str)> {
    match segments_after(topic, prefix)?.as_slice() {
        ["preset", id, action] => Some((id.parse().ok()?, *action)),
        _ => None,
    }
}

/// Parse "ON", "ON <seconds>" or "OFF" (case-insensitive, trims whitespace).
pub(crate) fn parse_pump_command(payload: &[u8]) -> Result<Command, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    let mut words = s.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("ON"), None, None) => Ok(Command::PumpOn(None)),
        (Some("ON"), Some(secs), None) => match secs.parse::<u64>() {
            Ok(n) if n > 0 => Ok(Command::PumpOn(Some(n))),
            _ => Err(format!("invalid pump duration '{secs}'")),
        },
        (Some("OFF"), None, None) => Ok(Command::PumpOff),
        _ => Err(format!("unknown pump command '{s}'")),
    }
}

/// Empty payload = default limit, otherwise a positive entry count.
pub(crate) fn parse_history_limit(payload: &[u8]) -> Result<Command, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    if s.is_empty() {
        return Ok(Command::RecentLogs(DEFAULT_HISTORY_LIMIT));
    }
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Command::RecentLogs(n)),
        _ => Err(format!("invalid history limit '{s}'")),
    }
}

/// Map an incoming publish to a command. `None` means the topic is not a
/// command topic at all.
pub(crate) fn parse_command(topic: &str, payload: &[u8], prefix: &str) -> Option<Result<Command, String>> {
    if let Some((id, action)) = extract_preset_action(topic, prefix) {
        return Some(match action {
            "activate" => Ok(Command::ActivatePreset(id)),
            "run" => Ok(Command::RunPreset(id)),
            other => Err(format!("unknown preset action '{other}'")),
        });
    }
    match segments_after(topic, prefix)?.as_slice() {
        ["pump", "set"] => Some(parse_pump_command(payload)),
        ["pump", "get"] => Some(Ok(Command::QueryPump)),
        ["presets", "get"] => Some(Ok(Command::ListPresets)),
        ["logs", "get"] => Some(parse_history_limit(payload)),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
