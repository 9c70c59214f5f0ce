mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{ReservoirSim, Scenario, Targets};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Telemetry frame published to `esp32/<node_id>/data`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorFrame {
    ts: i64,
    ph: f64,
    tds: f64,
    water_temp: f64,
    air_temp: f64,
    humidity: f64,
}

/// Log line published to `esp32/<node_id>/log`.
#[derive(Debug, Serialize)]
struct LogFrame {
    level: &'static str,
    message: String,
    source: &'static str,
}

/// Command received on `esp32/command`.
#[derive(Debug, Deserialize)]
struct CommandMsg {
    settings: CommandSettings,
}

#[derive(Debug, Deserialize)]
struct CommandSettings {
    autopilot: bool,
    #[serde(rename = "targetPH")]
    target_ph: Option<f64>,
    #[serde(rename = "targetTDS")]
    target_tds: Option<f64>,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
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
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "tent-1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let scenario = Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_default(),
    );

    let sim = Arc::new(Mutex::new(ReservoirSim::new(scenario)));

    let client_id = format!("hydro-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Event loop task: keeps the connection alive, (re)subscribes on
    // connect, and steers the simulator when commands arrive.
    {
        let client = client.clone();
        let sim = Arc::clone(&sim);
        let node_id = node_id.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("node connected to mqtt");
                        if let Err(e) = client.subscribe("esp32/command", QoS::AtLeastOnce).await {
                            warn!("subscribe failed: {e}");
                        }
                        let boot = LogFrame {
                            level: "INFO",
                            message: format!("node {node_id} online"),
                            source: "esp32",
                        };
                        let payload = serde_json::to_vec(&boot).unwrap_or_default();
                        if let Err(e) = client
                            .publish(format!("esp32/{node_id}/log"), QoS::AtLeastOnce, false, payload)
                            .await
                        {
                            warn!("boot log publish failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == "esp32/command" => {
                        match serde_json::from_slice::<CommandMsg>(&p.payload) {
                            Ok(cmd) => apply_command(&sim, cmd.settings).await,
                            Err(e) => warn!("bad command json: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let topic = format!("esp32/{node_id}/data");
    info!(%topic, %scenario, sample_every_s, "publishing telemetry");

    loop {
        let frame = {
            let mut s = sim.lock().await;
            s.tick();
            s.sample()
        };

        let msg = SensorFrame {
            ts: now_unix(),
            ph: frame.ph,
            tds: frame.tds,
            water_temp: frame.water_temp,
            air_temp: frame.air_temp,
            humidity: frame.humidity,
        };
        let payload = serde_json::to_vec(&msg).unwrap_or_default();

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            warn!("publish error: {e}");
        } else {
            info!(ts = msg.ts, ph = format!("{:.2}", msg.ph), tds = format!("{:.0}", msg.tds), "published frame");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

async fn apply_command(sim: &Arc<Mutex<ReservoirSim>>, settings: CommandSettings) {
    let mut s = sim.lock().await;
    if settings.autopilot {
        match (settings.target_ph, settings.target_tds) {
            (Some(ph), Some(tds)) => {
                info!(target_ph = ph, target_tds = tds, "autopilot engaged, dosing toward targets");
                s.engage(Targets { ph, tds });
            }
            _ => warn!("autopilot engage without targets — ignored"),
        }
    } else {
        info!("autopilot disengaged");
        s.disengage();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
