//! Drive a network from scheduler callbacks.

use futures::StreamExt;
use iotsim_engine::{
    endpoints::Endpoints,
    message::{Kind, Message},
    network::{self, Conditions, Network, Protocol},
    scheduler::{self, Options, Scheduler},
};
use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn traced() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_sensors_report_to_gateway() {
    traced();
    let endpoints = Arc::new(Endpoints::default());
    let mut gateway = endpoints.register("gateway").unwrap();
    let sensors = ["sensor_1", "sensor_2", "sensor_3"];
    let mut inboxes: Vec<_> = sensors
        .iter()
        .map(|id| endpoints.register(*id).unwrap())
        .collect();

    let network = Arc::new(Network::new(
        endpoints,
        network::Config {
            seed: Some(7),
            conditions: Conditions {
                packet_loss: 0.0,
                delay_min: Duration::from_millis(1),
                delay_max: Duration::from_millis(2),
            },
            ..network::Config::default()
        },
    ));
    network.start().unwrap();

    let scheduler = Scheduler::new(scheduler::Config {
        time_step: Duration::from_millis(10),
        speed: 10.0,
        ..scheduler::Config::default()
    });
    for (index, sensor) in sensors.into_iter().enumerate() {
        network.set_protocol(sensor, Protocol::Zigbee);
        let network = network.clone();
        let mut reading = 20.0 + index as f64;
        scheduler
            .schedule_repeating_with(
                Duration::from_millis(50),
                Options::default().with_id(sensor),
                move || {
                    reading += 0.5;
                    let payload = format!("{reading:.1}");
                    network.send(Message::new(sensor, "gateway", payload, Kind::Data));
                },
            )
            .unwrap();
    }

    let (sender, receiver) = mpsc::channel();
    let controller = network.clone();
    scheduler.schedule_with(
        Duration::from_millis(120),
        Options::default().with_priority(10),
        move || {
            let command = Message::new("gateway", "*", "sleep", Kind::Command);
            sender.send(controller.broadcast(command)).unwrap();
        },
    );
    scheduler.start().unwrap();

    // The broadcast reaches every sensor but not the gateway itself
    assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap(), 3);
    for inbox in inboxes.iter_mut() {
        let command = futures::executor::block_on(inbox.next()).unwrap();
        assert_eq!(command.kind(), Kind::Command);
        assert_eq!(command.payload().as_ref(), b"sleep");
    }

    // Each sensor reports at least twice
    let mut reports = Vec::new();
    while reports.len() < 6 {
        reports.push(futures::executor::block_on(gateway.next()).unwrap());
    }
    assert!(reports.iter().all(|report| report.kind() == Kind::Data));
    for sensor in sensors {
        assert!(reports.iter().any(|report| report.source() == sensor));
    }

    scheduler.stop();
    wait_until(|| network.queued() == 0);
    network.stop();

    let stats = network.stats();
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.errors, 0);
    // Broadcast fan-out counts as sent but bypasses the queue
    assert_eq!(stats.sent, stats.received + 3);
    assert_eq!(stats.delivery_rate(), Some(100.0));
    assert_eq!(network.protocol("sensor_2"), Protocol::Zigbee);
    assert_eq!(network.protocol("gateway"), Protocol::Custom);
}

#[test]
fn test_lossy_link_loses_readings() {
    traced();
    let endpoints = Arc::new(Endpoints::default());
    let _gateway = endpoints.register("gateway").unwrap();
    let _sensor = endpoints.register("sensor").unwrap();

    let network = Arc::new(Network::new(
        endpoints,
        network::Config {
            seed: Some(42),
            conditions: Conditions {
                packet_loss: 0.5,
                ..Conditions::default()
            },
            ..network::Config::default()
        },
    ));
    network.start().unwrap();

    let scheduler = Scheduler::new(scheduler::Config {
        time_step: Duration::from_millis(10),
        speed: 100.0,
        ..scheduler::Config::default()
    });
    let sender = network.clone();
    scheduler
        .schedule_repeating(Duration::from_millis(10), move || {
            sender.send(Message::new("sensor", "gateway", "1", Kind::Data));
        })
        .unwrap();
    scheduler.start().unwrap();
    wait_until(|| network.stats().sent >= 200);
    scheduler.stop();
    wait_until(|| network.queued() == 0);
    network.stop();

    let stats = network.stats();
    assert!(stats.dropped > 0);
    assert!(stats.received > 0);
    assert_eq!(stats.sent, stats.received + stats.errors);
    let rate = stats.delivery_rate().unwrap();
    assert!((30.0..70.0).contains(&rate), "delivery rate {rate}");
}
