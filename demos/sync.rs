use std::{error::Error, sync::Arc, thread, time::Duration};

use mqtt_engine::{
    sync::{Client, Message, Options},
    v3::QoS,
};
use tracing::info;

type DynError = Box<dyn Error + Send + Sync + 'static>;

const TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<(), DynError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:1883".to_string());

    let mut opts = Options::new("mqtt-engine-sync-client");

    opts.server_url(&url)?
        .keep_alive(Duration::from_secs(10))
        .will("demo/status", b"offline".to_vec(), QoS::AtLeastOnce, false);

    let client = Client::new(opts);

    let conn_ack = client.connect(TIMEOUT)?;
    info!(session_present = conn_ack.session_present(), "connected");

    let granted = client.subscribe(
        "demo/#",
        QoS::AtLeastOnce,
        Some(Arc::new(|msg: &Message| {
            info!(
                topic = msg.topic(),
                payload = %String::from_utf8_lossy(msg.payload()),
                qos = %msg.qos(),
                "received message"
            );
        })),
        TIMEOUT,
    )?;
    info!(%granted, "subscribed");

    client.publish("demo/status", QoS::AtLeastOnce, true, b"online".to_vec(), TIMEOUT)?;

    for i in 0..5 {
        let payload = format!("message {i}");

        client.publish("demo/counter", QoS::AtMostOnce, false, payload, TIMEOUT)?;

        thread::sleep(Duration::from_millis(500));
    }

    client.unsubscribe(&["demo/#"], TIMEOUT)?;

    client.disconnect(TIMEOUT)?;

    Ok(())
}
