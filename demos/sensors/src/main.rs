use clap::{Arg, Command};
use futures::{executor::block_on, StreamExt};
use iotsim_engine::{
    endpoints::Endpoints,
    message::{Kind, Message},
    network::{self, Network},
    scheduler::{self, Options, Scheduler},
};
use iotsim_sensors::Config;
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    thread,
};
use tracing::{debug, info, warn, Level};

fn main() {
    // Parse arguments
    let matches = Command::new("sensors")
        .about("simulate a sensor fleet reporting to a gateway")
        .arg(Arg::new("config").long("config").required(true))
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info"),
        )
        .get_matches();

    // Create logger
    let level = matches.get_one::<String>("log-level").unwrap();
    let level: Level = level.parse().expect("Could not parse log level");
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load config
    let config_file = matches.get_one::<String>("config").unwrap();
    let config_file = std::fs::read_to_string(config_file).expect("Could not read config file");
    let config: Config = serde_yaml::from_str(&config_file).expect("Could not parse config file");
    let seed = config.seed.unwrap_or_else(rand::random);
    info!(
        seed,
        sensors = config.sensors.len(),
        speed = config.speed,
        duration = ?config.duration(),
        "loaded config"
    );

    // Register endpoints
    let registry = Arc::new(Mutex::new(Registry::default()));
    let endpoints = Arc::new(Endpoints::default());
    let gateway = endpoints
        .register(config.gateway.clone())
        .expect("Could not register gateway");
    let mut inboxes = BTreeMap::new();
    for sensor in &config.sensors {
        let inbox = endpoints
            .register(sensor.id.clone())
            .expect("Could not register sensor");
        inboxes.insert(sensor.id.clone(), inbox);
    }

    // Create network
    let network = Arc::new(Network::new(
        endpoints.clone(),
        network::Config {
            registry: registry.clone(),
            seed: Some(seed),
            conditions: config.conditions(),
        },
    ));

    // Schedule readings
    let scheduler = Scheduler::new(scheduler::Config {
        registry: registry.clone(),
        time_step: config.time_step(),
        speed: config.speed,
    });
    for (index, sensor) in config.sensors.iter().enumerate() {
        let protocol = sensor.protocol().expect("Could not parse sensor protocol");
        network.set_protocol(sensor.id.clone(), protocol);

        let sensor = sensor.clone();
        let gateway = config.gateway.clone();
        let network = network.clone();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64 + 1));
        scheduler
            .schedule_repeating_with(
                sensor.interval(),
                Options::default().with_id(sensor.id.clone()),
                move || {
                    let reading = sensor.read(&mut rng);
                    let mut message = Message::new(
                        sensor.id.as_str(),
                        gateway.as_str(),
                        format!("{reading:.2}"),
                        Kind::Data,
                    );
                    message.add_header("protocol", protocol.to_string());
                    if !network.send(message) {
                        debug!(sensor = %sensor.id, "reading lost");
                    }
                },
            )
            .expect("Could not schedule sensor");
    }
    if let (Some(at), Some(command)) = (config.command_at(), config.command.clone()) {
        let gateway = config.gateway.clone();
        let network = network.clone();
        scheduler.schedule_with(at, Options::default().with_priority(1), move || {
            let message = Message::new(gateway.as_str(), "*", command.payload, Kind::Command);
            let reached = network.broadcast(message);
            info!(reached, "broadcast command");
        });
    }

    // Collect readings at the gateway
    let collector = thread::Builder::new()
        .name("gateway".into())
        .spawn(move || {
            let mut gateway = gateway;
            let mut readings: BTreeMap<String, u64> = BTreeMap::new();
            while let Some(message) = block_on(gateway.next()) {
                debug!(
                    source = message.source(),
                    payload = %String::from_utf8_lossy(message.payload()),
                    protocol = ?message.header("protocol"),
                    "received reading"
                );
                *readings.entry(message.source().to_string()).or_default() += 1;
            }
            readings
        })
        .expect("Could not spawn gateway");

    // Run for the configured virtual duration
    network.start().expect("Could not start network");
    scheduler.start().expect("Could not start scheduler");
    thread::sleep(config.duration().div_f64(scheduler.speed()));
    scheduler.stop();
    network.stop();
    endpoints.unregister(&config.gateway);
    let readings = collector.join().expect("Gateway panicked");

    // Report
    for sensor in &config.sensors {
        let received = readings.get(&sensor.id).copied().unwrap_or_default();
        let mut commands = 0;
        if let Some(inbox) = inboxes.get_mut(&sensor.id) {
            while let Ok(Some(message)) = inbox.try_next() {
                if message.kind() == Kind::Command {
                    commands += 1;
                }
            }
        }
        info!(sensor = %sensor.id, received, commands, "sensor summary");
    }
    let stats = network.stats();
    let events = scheduler.stats();
    info!(
        sent = stats.sent,
        received = stats.received,
        dropped = stats.dropped,
        errors = stats.errors,
        delivery_rate = ?stats.delivery_rate(),
        uptime = ?stats.uptime(),
        steps = events.steps,
        fired = events.fired,
        "simulation finished"
    );
    if events.faults > 0 {
        warn!(faults = events.faults, "sensor callbacks panicked");
    }

    let mut buffer = String::new();
    encode(&mut buffer, &registry.lock().unwrap()).expect("Could not encode metrics");
    println!("{buffer}");
}
