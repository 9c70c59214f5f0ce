mod auth;
mod autopilot;
mod broadcast;
mod config;
mod db;
mod mqtt;
mod phase;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use auth::Authorizer;
use autopilot::Autopilot;
use broadcast::Broadcaster;
use db::{now_unix, Db};
use mqtt::{extract_data_node, extract_log_node, NodeLogMsg, TelemetryMsg};
use state::{HubState, SharedState, TelemetrySnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:hydro.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (operator account + grow recipe overrides) ──────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let phases = Arc::new(cfg.build_table());

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared: SharedState = Arc::new(RwLock::new(HubState::new()));
    if let Some(cycle) = db.current_cycle().await? {
        let mut st = shared.write().await;
        st.phase = Some(cycle.phase.clone());
        st.autopilot_active = cycle.autopilot_active;
        st.record_system(format!(
            "resuming cycle #{} in phase {} (autopilot {})",
            cycle.id,
            cycle.phase,
            if cycle.autopilot_active { "on" } else { "off" }
        ));
    } else {
        let mut st = shared.write().await;
        st.record_system("hub started, no growth cycle yet".to_string());
    }

    // ── Controller ──────────────────────────────────────────────────
    let events = Broadcaster::new(32);
    let controller = Arc::new(Autopilot::new(
        db.clone(),
        Arc::clone(&phases),
        Authorizer::new(db.clone(), cfg.operator.username.clone()),
        events.clone(),
        Arc::clone(&shared),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        db: db.clone(),
        controller,
        shared: Arc::clone(&shared),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            eprintln!("web server error: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("hydro-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe("esp32/+/data", QoS::AtLeastOnce).await?;
    client.subscribe("esp32/+/log", QoS::AtLeastOnce).await?;
    eprintln!("hub subscribed to esp32/+/data and esp32/+/log");

    // Outbound bridge: controller events -> broker topics.
    tokio::spawn(mqtt::bridge_outbound(events.subscribe(), client.clone()));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();
                let payload = p.payload.to_vec();

                if let Some(node_id) = extract_data_node(&topic) {
                    match serde_json::from_slice::<TelemetryMsg>(&payload) {
                        Ok(msg) => {
                            if let Err(e) = db
                                .insert_reading(
                                    msg.ts,
                                    msg.ph,
                                    msg.tds,
                                    msg.water_temp,
                                    msg.air_temp,
                                    msg.humidity,
                                )
                                .await
                            {
                                eprintln!("db: insert_reading failed node={node_id}: {e}");
                            }

                            let mut st = shared.write().await;
                            st.record_telemetry(
                                node_id,
                                TelemetrySnapshot {
                                    ts: msg.ts,
                                    ph: msg.ph,
                                    tds: msg.tds,
                                    water_temp: msg.water_temp,
                                    air_temp: msg.air_temp,
                                    humidity: msg.humidity,
                                },
                            );
                        }
                        Err(e) => {
                            eprintln!("bad telemetry json: {e} topic={topic}");
                            let mut st = shared.write().await;
                            st.record_error(format!("bad telemetry json: {e}"));
                        }
                    }
                } else if let Some(node_id) = extract_log_node(&topic) {
                    match serde_json::from_slice::<NodeLogMsg>(&payload) {
                        Ok(msg) => {
                            if let Err(e) = db
                                .append_log(&msg.level, &msg.message, &msg.source, now_unix())
                                .await
                            {
                                eprintln!("db: append_log failed node={node_id}: {e}");
                            }
                        }
                        Err(e) => {
                            eprintln!("bad node log json: {e} topic={topic}");
                            let mut st = shared.write().await;
                            st.record_error(format!("bad node log json: {e}"));
                        }
                    }
                } else {
                    eprintln!("unhandled topic={topic}");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                eprintln!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                eprintln!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
