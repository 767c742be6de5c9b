use std::collections::HashMap;
use std::error::Error;
use std::io::{self, Read};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{error, info};

use iec101_bridge::agent::LocalClock;
use iec101_bridge::bus::{self, MqttBus};
use iec101_bridge::config::{Config, PortRole};
use iec101_bridge::router::{Router, RouterPort};
use iec101_bridge::store::ResourceStore;
use iec101_bridge::supervisor::{Iec101Handler, PortHandler};
use iec101_bridge::{transport, Agent, Shutdown, Supervisor};

const DEFAULT_CONFIG: &str = "/etc/serial-bridge.yaml";

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_owned());
    let config = Config::load(&path)?;
    info!("Loaded {} with {} ports", path, config.ports.len());

    let shutdown = Shutdown::new();
    let store = Arc::new(ResourceStore::new());

    let mut outboxes = HashMap::new();
    let mut inboxes = HashMap::new();
    for port in config.bridge_ports() {
        let (tx, rx) = mpsc::channel();
        outboxes.insert(port.name.clone(), tx);
        inboxes.insert(port.name.clone(), rx);
    }

    let mqtt = if inboxes.is_empty() {
        None
    } else {
        let (mqtt, connection) = MqttBus::new(&config.mqtt);
        let router = Router::from_config(&config, |port| outboxes.get(port).cloned());
        let topics: Vec<String> = router.topics().map(str::to_owned).collect();
        let pump_bus = mqtt.clone();
        let pump_shutdown = shutdown.clone();
        let backoff = config.reconnect_backoff();
        thread::Builder::new()
            .name("mqtt".to_owned())
            .spawn(move || {
                bus::pump(
                    connection,
                    &pump_bus,
                    &topics,
                    &pump_shutdown,
                    backoff,
                    |topic, message| {
                        router.dispatch(topic, message);
                    },
                )
            })?;
        Some(mqtt)
    };
    drop(outboxes);

    let mut workers = Vec::new();
    for port in &config.ports {
        let transport = transport::build(port)?;
        let handler: Box<dyn PortHandler> = match (port.role, &mqtt) {
            (PortRole::Iec101, _) => Box::new(Iec101Handler::new(Agent::new(
                (&config.iec101).into(),
                LocalClock,
            ))),
            (PortRole::Bridge, Some(mqtt)) => Box::new(RouterPort::from_config(
                &config,
                &port.name,
                mqtt.clone(),
                store.clone(),
            )?),
            (PortRole::Bridge, None) => continue,
        };
        let mut supervisor = Supervisor::new(transport, handler, shutdown.clone())
            .with_backoff(config.reconnect_backoff());
        if let Some(inbox) = inboxes.remove(&port.name) {
            supervisor = supervisor.with_outbox(inbox);
        }
        workers.push(
            thread::Builder::new()
                .name(port.name.clone())
                .spawn(move || {
                    supervisor.run();
                })?,
        );
    }

    // Runs until stdin is closed.
    let mut sink = [0; 64];
    while io::stdin().read(&mut sink)? > 0 {}

    info!("Shutting down");
    shutdown.trigger();
    if let Some(mqtt) = &mqtt {
        mqtt.disconnect();
    }
    for worker in workers {
        if worker.join().is_err() {
            error!("A port thread panicked");
        }
    }
    Ok(())
}
