mod config;
mod control;
mod csv_log;
mod db;
mod monitor;
mod mqtt;
mod notify;
mod pump;
mod readings;
mod registry;
mod relay;
mod scheduler;
mod sensor;
mod store;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use control::Controller;
use csv_log::CsvLogger;
use db::Db;
use mqtt::{command_subscriptions, parse_command, MqttNotifier};
use notify::{ChannelNotifier, Fanout, SharedNotifier};
use pump::PumpController;
use readings::ReadingsCache;
use relay::PumpRelay;
use scheduler::Scheduler;
use store::{Persistence, PresetStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        simulation = cfg.simulation,
        mqtt = cfg.mqtt.is_some(),
        "config loaded"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    let presets = db.list_presets().await?;
    match presets.iter().find(|p| p.active) {
        Some(p) => info!(preset = %p.name, total = presets.len(), "db ready"),
        None => warn!(total = presets.len(), "db ready, no active preset"),
    }

    // ── Notifications ───────────────────────────────────────────────
    let channel = ChannelNotifier::new();
    tokio::spawn(notify::log_events(channel.subscribe()));
    let mut sinks: Vec<SharedNotifier> = vec![Arc::new(channel.clone())];

    let mqtt = match &cfg.mqtt {
        Some(m) => {
            let mut opts = MqttOptions::new(&m.client_id, &m.host, m.port);
            opts.set_keep_alive(Duration::from_secs(30));
            let (client, eventloop) = AsyncClient::new(opts, 64);
            sinks.push(Arc::new(MqttNotifier::new(client.clone(), &m.topic_prefix)));
            Some((client, eventloop, m.topic_prefix.clone()))
        }
        None => None,
    };
    let notifier: SharedNotifier = Arc::new(Fanout::new(sinks));

    // ── Pump ────────────────────────────────────────────────────────
    let gpio_pin = u8::try_from(cfg.pump.gpio_pin).context("pump.gpio_pin out of range")?;
    let relay = PumpRelay::new(gpio_pin, cfg.pump.active_low)?;
    let store: Arc<dyn Persistence> = Arc::new(db.clone());
    let preset_store: Arc<dyn PresetStore> = Arc::new(db.clone());
    let pump = Arc::new(PumpController::new(relay, store.clone(), notifier.clone()));
    let controller = Controller::new(pump.clone(), preset_store.clone(), store.clone(), notifier.clone());

    // ── Background loops ────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let cache = Arc::new(ReadingsCache::new());

    let registry = cfg.sensor_registry();
    info!(sensors = registry.metrics().len(), "starting sensor tasks");
    registry.spawn(cache.clone(), running.clone());

    tokio::spawn(monitor::broadcast_loop(
        cache.clone(),
        notifier.clone(),
        cfg.ui_interval(),
        running.clone(),
    ));
    tokio::spawn(monitor::persistence_loop(
        cache.clone(),
        store,
        notifier.clone(),
        cfg.db_interval(),
        running.clone(),
    ));

    if cfg.csv.enabled {
        let folder = cfg.csv.folder.clone().unwrap_or_default();
        let logger = CsvLogger::new(folder, &cfg.csv.timestamp_format, cfg.validation_ranges());
        tokio::spawn(csv_log::run(
            logger,
            cache.clone(),
            cfg.csv_interval(),
            running.clone(),
        ));
    }

    let scheduler = Scheduler::new(pump.clone(), preset_store);
    tokio::spawn(scheduler.run(cfg.scheduler_interval(), running.clone()));

    // ── Command loop until ctrl-c ───────────────────────────────────
    match mqtt {
        Some((client, eventloop, prefix)) => {
            tokio::select! {
                _ = mqtt_loop(client, eventloop, &prefix, &controller) => {}
                res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    // Fail-safe: never leave the pump running unattended.
    if pump.is_running().await {
        if let Err(e) = pump.stop().await {
            warn!("shutdown: pump stop: {e}");
        }
    }
    Ok(())
}

/// Drive the MQTT connection and dispatch command topics. Subscriptions are
/// renewed on every (re)connect.
async fn mqtt_loop(client: AsyncClient, mut eventloop: EventLoop, prefix: &str, controller: &Controller) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match parse_command(&p.topic, &p.payload, prefix) {
                    Some(Ok(cmd)) => {
                        info!(topic = %p.topic, ?cmd, "command received");
                        controller.execute(cmd).await;
                    }
                    Some(Err(msg)) => warn!(topic = %p.topic, "rejected command: {msg}"),
                    None => {}
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(prefix, "mqtt connected");
                for filter in command_subscriptions(prefix) {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!(%filter, "mqtt: subscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
