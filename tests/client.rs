use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Barrier, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use color_eyre::eyre::ensure;
use mqtt_engine::{
    sync::{Client, ClientError, ConnectionState, Message, MessageHandler},
    v3::{connect::ConnectReturnCode, header::ControlPacketType, topic::TopicError, QoS},
};
use pretty_assertions::assert_eq;

use self::common::{Broker, Config, BATCH_PREFIX, BURST_PREFIX, NO_ACK_PREFIX, REJECT_PREFIX};

mod common;

const TIMEOUT: Duration = Duration::from_secs(5);

fn counter() -> (Arc<AtomicUsize>, MessageHandler) {
    let count = Arc::new(AtomicUsize::new(0));

    let handler: MessageHandler = {
        let count = Arc::clone(&count);

        Arc::new(move |_msg: &Message| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    (count, handler)
}

fn connected(broker: &Broker, client_id: &str) -> color_eyre::Result<Client> {
    let client = Client::new(broker.options(client_id));

    client.connect(TIMEOUT)?;

    Ok(client)
}

#[test]
fn should_connect_and_disconnect() -> color_eyre::Result<()> {
    let broker = Broker::start();

    let client = Client::new(broker.options("connect"));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let conn_ack = client.connect(TIMEOUT)?;

    assert!(!conn_ack.session_present());
    assert!(client.is_connected());

    let err = client.connect(TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected), "{err:?}");

    client.disconnect(TIMEOUT)?;

    assert!(!client.is_connected());
    assert!(broker.wait_for(ControlPacketType::Disconnect, TIMEOUT));

    // Idempotent
    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_fail_on_refused_connection() {
    let broker = Broker::with_config(Config {
        return_code: ConnectReturnCode::IdentifierRejected,
        ..Config::default()
    });

    let client = Client::new(broker.options("refused"));

    let err = client.connect(TIMEOUT).unwrap_err();

    assert!(
        matches!(
            err,
            ClientError::Handshake(ConnectReturnCode::IdentifierRejected)
        ),
        "{err:?}"
    );
    assert_eq!(
        err.to_string(),
        "connection refused: Client Identifier Rejected"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn should_not_try_other_servers_after_refusal() {
    let refusing = Broker::with_config(Config {
        return_code: ConnectReturnCode::NotAuthorized,
        ..Config::default()
    });
    let accepting = Broker::start();

    let mut opts = refusing.options("refused");
    opts.server(accepting.server());

    let client = Client::new(opts);

    let err = client.connect(TIMEOUT).unwrap_err();
    assert!(
        matches!(err, ClientError::Handshake(ConnectReturnCode::NotAuthorized)),
        "{err:?}"
    );

    assert_eq!(accepting.count(ControlPacketType::Connect), 0);
}

#[test]
fn should_fall_back_to_the_next_server() -> color_eyre::Result<()> {
    let broker = Broker::start();

    let mut opts = mqtt_engine::sync::Options::new("fallback");
    opts.server(common::closed_server())
        .server(broker.server())
        .connect_timeout(Duration::from_secs(1));

    let client = Client::new(opts);

    client.connect(TIMEOUT)?;

    ensure!(client.is_connected(), "client should be connected");

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_return_the_last_dial_error() {
    let mut opts = mqtt_engine::sync::Options::new("unreachable");
    opts.server(common::closed_server())
        .server(common::closed_server());

    let client = Client::new(opts);

    let err = client.connect(TIMEOUT).unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)), "{err:?}");
    assert!(!client.is_connected());
}

#[test]
fn should_publish_qos0_without_waiting() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "qos0")?;

    // Never acknowledged, but QoS 0 doesn't wait
    let start = Instant::now();
    client.publish(
        &format!("{NO_ACK_PREFIX}qos0"),
        QoS::AtMostOnce,
        false,
        b"data".to_vec(),
        TIMEOUT,
    )?;
    assert!(start.elapsed() < TIMEOUT);

    assert!(broker.wait_for(ControlPacketType::Publish, TIMEOUT));

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_time_out_and_keep_the_connection() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "timeout")?;

    let err = client
        .publish(
            &format!("{NO_ACK_PREFIX}qos1"),
            QoS::AtLeastOnce,
            false,
            b"data".to_vec(),
            Duration::from_millis(200),
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout), "{err:?}");

    assert!(client.is_connected());

    client.publish("acked", QoS::AtLeastOnce, false, b"data".to_vec(), TIMEOUT)?;

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_correlate_concurrent_publishes() -> color_eyre::Result<()> {
    const PUBLISHERS: usize = 8;

    let broker = Broker::with_config(Config {
        batch: PUBLISHERS,
        ..Config::default()
    });
    let client = Arc::new(connected(&broker, "concurrent")?);

    let barrier = Arc::new(Barrier::new(PUBLISHERS));

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|i| {
            let client = Arc::clone(&client);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                client.publish(
                    &format!("{BATCH_PREFIX}{i}"),
                    QoS::AtLeastOnce,
                    false,
                    i.to_be_bytes().to_vec(),
                    TIMEOUT,
                )
            })
        })
        .collect();

    for publisher in publishers {
        publisher.join().unwrap()?;
    }

    assert_eq!(broker.count(ControlPacketType::Publish), PUBLISHERS);

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_route_messages_once() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "route")?;

    let (count, handler) = counter();

    let granted = client.subscribe("a/b", QoS::AtLeastOnce, Some(handler), TIMEOUT)?;
    assert_eq!(granted, QoS::AtLeastOnce);

    client.publish("a/b", QoS::AtLeastOnce, false, b"hello".to_vec(), TIMEOUT)?;

    assert!(common::wait_until(TIMEOUT, || count.load(Ordering::SeqCst) == 1));

    // Acknowledged back to the broker
    assert!(broker.wait_for(ControlPacketType::PubAck, TIMEOUT));

    client.publish("a/c", QoS::AtLeastOnce, false, b"other".to_vec(), TIMEOUT)?;

    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_route_wildcard_subscriptions() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "wildcards")?;

    let topics = Arc::new(Mutex::new(Vec::new()));

    {
        let topics = Arc::clone(&topics);

        client.set_route("a/+", move |msg: &Message| {
            topics.lock().unwrap().push(msg.topic().to_string());
        })?;
    }

    client.subscribe("a/+", QoS::AtMostOnce, None, TIMEOUT)?;

    for topic in ["a/b", "a/x", "a/b/c"] {
        client.publish(topic, QoS::AtMostOnce, false, b"data".to_vec(), TIMEOUT)?;
    }

    // The broker only echoes the matching ones
    assert!(common::wait_until(TIMEOUT, || topics.lock().unwrap().len() == 2));

    assert_eq!(*topics.lock().unwrap(), ["a/b", "a/x"]);

    client.unsubscribe(&["a/+"], TIMEOUT)?;

    client.publish("a/b", QoS::AtLeastOnce, false, b"data".to_vec(), TIMEOUT)?;

    thread::sleep(Duration::from_millis(200));
    assert_eq!(topics.lock().unwrap().len(), 2);

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_report_rejected_subscriptions() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "rejected")?;

    let (count, handler) = counter();

    let rejected = format!("{REJECT_PREFIX}b");

    let err = client
        .subscribe_multiple(
            &[("ok/a", QoS::AtLeastOnce), (rejected.as_str(), QoS::AtMostOnce)],
            Some(handler),
            TIMEOUT,
        )
        .unwrap_err();

    match err {
        ClientError::SubscribeRejected { filters } => assert_eq!(filters, [rejected]),
        err => panic!("unexpected error {err:?}"),
    }

    // The granted one is routed
    client.publish("ok/a", QoS::AtMostOnce, false, b"data".to_vec(), TIMEOUT)?;

    assert!(common::wait_until(TIMEOUT, || count.load(Ordering::SeqCst) == 1));

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_send_keep_alive_pings() -> color_eyre::Result<()> {
    let broker = Broker::start();

    let mut opts = broker.options("keep-alive");
    opts.keep_alive(Duration::from_secs(1));

    let client = Client::new(opts);
    client.connect(TIMEOUT)?;

    assert!(broker.wait_for(ControlPacketType::PingReq, Duration::from_secs(3)));

    // Answered by the broker, the connection stays up
    thread::sleep(Duration::from_millis(500));
    assert!(client.is_connected());

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_detect_server_close() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "server-close")?;

    broker.close_connections();

    assert!(common::wait_until(TIMEOUT, || !client.is_connected()));

    let err = client
        .publish("a/b", QoS::AtMostOnce, false, b"data".to_vec(), TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected), "{err:?}");

    // Reconnecting reaps the closed connection
    client.connect(TIMEOUT)?;
    assert!(client.is_connected());

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_disconnect_from_a_handler() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = Arc::new(connected(&broker, "handler-disconnect")?);

    {
        let weak = Arc::downgrade(&client);

        client.set_route("stop", move |_msg: &Message| {
            if let Some(client) = weak.upgrade() {
                client.disconnect(TIMEOUT).unwrap();
            }
        })?;
    }

    client.subscribe("stop", QoS::AtMostOnce, None, TIMEOUT)?;
    client.publish("stop", QoS::AtMostOnce, false, Vec::new(), TIMEOUT)?;

    assert!(common::wait_until(TIMEOUT, || !client.is_connected()));
    assert!(broker.wait_for(ControlPacketType::Disconnect, TIMEOUT));

    Ok(())
}

#[test]
fn should_keep_the_connection_on_invalid_topics() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = connected(&broker, "invalid-topic")?;

    let err = client
        .publish("a\u{1}b", QoS::AtMostOnce, false, b"data".to_vec(), TIMEOUT)
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Topic(TopicError::InvalidChar)),
        "{err:?}"
    );

    let long = "a".repeat(usize::from(u16::MAX) + 1);
    let err = client
        .publish(&long, QoS::AtLeastOnce, false, b"data".to_vec(), TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, ClientError::Topic(TopicError::TooLong)), "{err:?}");

    let err = client
        .subscribe("a/\0", QoS::AtMostOnce, None, TIMEOUT)
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Topic(TopicError::InvalidChar)),
        "{err:?}"
    );

    assert!(client.is_connected());

    client.publish("a/b", QoS::AtLeastOnce, false, b"data".to_vec(), TIMEOUT)?;

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_not_try_other_servers_after_a_wrong_reply() {
    let wrong = Broker::with_config(Config {
        ping_on_connect: true,
        ..Config::default()
    });
    let accepting = Broker::start();

    let mut opts = wrong.options("wrong-reply");
    opts.server(accepting.server());

    let client = Client::new(opts);

    let err = client.connect(TIMEOUT).unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::UnexpectedPacket(ControlPacketType::PingResp)
        ),
        "{err:?}"
    );

    assert!(!client.is_connected());
    assert_eq!(accepting.count(ControlPacketType::Connect), 0);
}

#[test]
fn should_close_when_the_server_is_silent() -> color_eyre::Result<()> {
    let broker = Broker::with_config(Config {
        mute: true,
        ..Config::default()
    });

    let mut opts = broker.options("silent");
    opts.keep_alive(Duration::from_secs(1));

    let client = Client::new(opts);
    client.connect(TIMEOUT)?;

    let start = Instant::now();

    // Pending until the read deadline of two keep alive intervals
    let err = client
        .publish("a/b", QoS::AtLeastOnce, false, b"data".to_vec(), TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost), "{err:?}");

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
    assert!(elapsed < TIMEOUT, "{elapsed:?}");

    assert!(!client.is_connected());
    assert!(broker.count(ControlPacketType::PingReq) >= 1);

    Ok(())
}

#[test]
fn should_not_ping_while_traffic_is_acknowledged() -> color_eyre::Result<()> {
    let broker = Broker::start();

    let mut opts = broker.options("busy");
    opts.keep_alive(Duration::from_secs(1));

    let client = Client::new(opts);
    client.connect(TIMEOUT)?;

    for i in 0..10u8 {
        client.publish("busy", QoS::AtLeastOnce, false, vec![i], TIMEOUT)?;

        thread::sleep(Duration::from_millis(250));
    }

    assert_eq!(broker.count(ControlPacketType::PingReq), 0);
    assert!(client.is_connected());

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_ping_when_only_sending() -> color_eyre::Result<()> {
    let broker = Broker::start();

    let mut opts = broker.options("sender");
    opts.keep_alive(Duration::from_secs(1));

    let client = Client::new(opts);
    client.connect(TIMEOUT)?;

    // Nothing comes back for these, the server could be gone
    for i in 0..12u8 {
        client.publish(
            &format!("{NO_ACK_PREFIX}sender"),
            QoS::AtMostOnce,
            false,
            vec![i],
            TIMEOUT,
        )?;

        thread::sleep(Duration::from_millis(250));
    }

    assert!(broker.count(ControlPacketType::PingReq) >= 1);
    assert!(client.is_connected());

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_acknowledge_inbound_messages_in_order() -> color_eyre::Result<()> {
    const MESSAGES: u16 = 6;

    let broker = Broker::with_config(Config {
        burst: MESSAGES,
        ..Config::default()
    });
    let client = connected(&broker, "burst")?;

    let (count, handler) = counter();

    client.subscribe(
        &format!("{BURST_PREFIX}#"),
        QoS::AtLeastOnce,
        Some(handler),
        TIMEOUT,
    )?;

    assert!(common::wait_until(TIMEOUT, || {
        count.load(Ordering::SeqCst) == usize::from(MESSAGES)
    }));
    assert!(common::wait_until(TIMEOUT, || {
        broker.pub_acks().len() == usize::from(MESSAGES)
    }));

    assert_eq!(broker.pub_acks(), (1..=MESSAGES).collect::<Vec<_>>());

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_time_out_subscriptions_and_keep_the_connection() -> color_eyre::Result<()> {
    let broker = Broker::with_config(Config {
        mute: true,
        ..Config::default()
    });
    let client = connected(&broker, "sub-timeout")?;

    let timeout = Duration::from_millis(200);

    let err = client
        .subscribe("a/b", QoS::AtLeastOnce, None, timeout)
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout), "{err:?}");

    let err = client.unsubscribe(&["a/b"], timeout).unwrap_err();
    assert!(matches!(err, ClientError::Timeout), "{err:?}");

    assert!(client.is_connected());
    assert_eq!(broker.count(ControlPacketType::Subscribe), 1);
    assert_eq!(broker.count(ControlPacketType::Unsubscribe), 1);

    client.disconnect(TIMEOUT)?;

    Ok(())
}

#[test]
fn should_reconnect_while_a_handler_uses_the_client() -> color_eyre::Result<()> {
    let broker = Broker::start();
    let client = Arc::new(connected(&broker, "reap")?);

    let (entered, wait_entered) = mpsc::channel();
    let handler_result = Arc::new(Mutex::new(None));

    {
        let weak = Arc::downgrade(&client);
        let handler_result = Arc::clone(&handler_result);

        client.set_route("reap", move |_msg: &Message| {
            let Some(client) = weak.upgrade() else {
                return;
            };

            entered.send(()).unwrap();

            common::wait_until(TIMEOUT, || !client.is_connected());

            // The reconnect is joining this thread
            thread::sleep(Duration::from_millis(200));

            let res = client.publish("reap", QoS::AtMostOnce, false, Vec::new(), TIMEOUT);

            *handler_result.lock().unwrap() = Some(res);
        })?;
    }

    client.subscribe("reap", QoS::AtMostOnce, None, TIMEOUT)?;
    client.publish("reap", QoS::AtMostOnce, false, Vec::new(), TIMEOUT)?;

    wait_entered.recv_timeout(TIMEOUT)?;

    broker.close_connections();

    // The inbound thread is busy, a failed write detects the close
    assert!(common::wait_until(TIMEOUT, || {
        client
            .publish("other", QoS::AtMostOnce, false, Vec::new(), TIMEOUT)
            .is_err()
    }));

    client.connect(TIMEOUT)?;
    assert!(client.is_connected());

    let res = handler_result.lock().unwrap().take();
    assert!(matches!(res, Some(Err(ClientError::NotConnected))), "{res:?}");

    client.disconnect(TIMEOUT)?;

    Ok(())
}
