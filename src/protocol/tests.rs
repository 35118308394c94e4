use super::*;
use crate::broker::Broker;
use crate::broker::subscriber::Subscriber;
use crate::config::Settings;
use crate::core::SubscriptionService;
use crate::core::service::Service;
use chrono::{TimeDelta, Utc};
use std::time::Duration;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.broker.default_subscription_ttl_secs = 0;
    settings.broker.default_publisher_ttl_secs = 0;
    settings.broker.expiry_sweep_interval_ms = 3_600_000;
    settings
}

async fn settle(broker: &Broker) {
    broker.subscriptions().flush().await.unwrap();
    broker.messages().flush().await.unwrap();
}

async fn next(session: &mut LocalSession) -> Message {
    tokio::time::timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("session closed")
}

#[test]
fn test_stats_counters_and_snapshot() {
    let stats = ProtocolStats::default();
    stats.record_request();
    stats.record_request();
    stats.record_message();
    stats.record_bad_request();
    stats.record_error();

    assert_eq!(
        stats.snapshot("mqtt"),
        ProtocolStatsSnapshot {
            protocol: "mqtt".to_string(),
            total_requests: 2,
            total_messages: 1,
            total_bad_requests: 1,
            total_errors: 1,
        }
    );
}

#[tokio::test]
async fn test_registry_lookup_and_duplicates() {
    let broker = Broker::new(&test_settings()).unwrap();
    let registry = ProtocolRegistry::default();
    registry
        .register(Arc::new(LocalServer::new("mqtt", broker.handles())))
        .unwrap();
    registry
        .register(Arc::new(LocalServer::new("stomp", broker.handles())))
        .unwrap();

    let err = registry
        .register(Arc::new(LocalServer::new("mqtt", broker.handles())))
        .unwrap_err();
    assert!(matches!(err, BrokerError::DuplicateProtocol(_)));

    assert_eq!(registry.len(), 2);
    let names: Vec<String> = registry
        .all()
        .iter()
        .map(|s| s.protocol_server_type().to_string())
        .collect();
    assert_eq!(names, vec!["mqtt", "stomp"]);
    assert!(registry.get("stomp").is_some());
    assert!(registry.get("amqp").is_none());
}

#[tokio::test]
async fn test_recipient_endpoints_filtering() {
    let settings = test_settings();
    let subscriptions = SubscriptionService::new(&settings.broker);
    subscriptions.boot().unwrap();

    let paused = Subscriber::new("p", 1, "alerts", "mqtt");
    for subscriber in [
        Subscriber::new("a", 1, "alerts", "mqtt"),
        Subscriber::new("a", 2, "alerts", "mqtt"),
        Subscriber::new("b", 1, "alerts", "stomp"),
        Subscriber::new("c", 1, "other", "mqtt"),
        Subscriber::new("old", 1, "alerts", "mqtt")
            .with_timeout(Utc::now() - TimeDelta::seconds(5)),
        paused.clone(),
    ] {
        subscriptions.add_subscriber(subscriber).await.unwrap();
    }
    subscriptions.pause_subscriber(&paused).await.unwrap();
    subscriptions.flush().await.unwrap();

    let message = Message::new("x", "alerts", None, "stomp");
    let endpoints = recipient_endpoints(&subscriptions.view(), "mqtt", &message);
    assert_eq!(
        endpoints.into_iter().collect::<Vec<_>>(),
        vec![("a".to_string(), 1), ("a".to_string(), 2)]
    );

    let system = Message::system("hello", "Crossbar System");
    let endpoints = recipient_endpoints(&subscriptions.view(), "mqtt", &system);
    assert_eq!(endpoints.len(), 3);
}

#[tokio::test]
async fn test_cross_adapter_delivery() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    let stomp = LocalServer::new("stomp", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.add_protocol_server(Arc::new(stomp.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut sensor = mqtt.attach("10.0.0.1", 1883);
    let mut console = stomp.attach("10.0.0.2", 61613);
    let mut bystander = stomp.attach("10.0.0.3", 61613);
    sensor.subscribe("alerts").await.unwrap();
    console.subscribe("alerts").await.unwrap();
    bystander.subscribe("weather").await.unwrap();
    settle(&broker).await;

    sensor.publish("alerts", "smoke detected").await.unwrap();
    settle(&broker).await;

    let got = next(&mut console).await;
    assert_eq!(got.content(), "smoke detected");
    assert_eq!(got.origin_protocol(), "mqtt");
    assert_eq!(got.publisher().unwrap().host(), "10.0.0.1");
    assert_eq!(next(&mut sensor).await.content(), "smoke detected");
    assert!(bystander.try_recv().is_none());

    assert_eq!(mqtt.stats().total_requests(), 2);
    assert_eq!(stomp.stats().total_messages(), 1);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_paused_session_receives_nothing() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut session = mqtt.attach("10.0.0.1", 1883);
    session.subscribe("weather").await.unwrap();
    session.pause("weather").await.unwrap();
    settle(&broker).await;

    session.publish("weather", "23C").await.unwrap();
    settle(&broker).await;
    assert!(session.try_recv().is_none());
    broker.shutdown().await;
}

#[tokio::test]
async fn test_close_drops_subscriptions() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut session = mqtt.attach("10.0.0.1", 1883);
    session.subscribe("a").await.unwrap();
    session.subscribe("b").await.unwrap();
    settle(&broker).await;
    assert_eq!(broker.subscriptions().all_subscribers().len(), 2);

    session.close().await.unwrap();
    settle(&broker).await;
    assert!(broker.subscriptions().all_subscribers().is_empty());
    assert_eq!(mqtt.session_count(), 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_dropped_session_releases_subscriptions() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut session = mqtt.attach("10.0.0.1", 1883);
    session.subscribe("weather").await.unwrap();
    settle(&broker).await;
    broker.topics().flush().await.unwrap();
    assert_eq!(broker.subscriptions().all_subscribers().len(), 1);

    drop(session);
    settle(&broker).await;
    assert_eq!(mqtt.session_count(), 0);
    assert!(broker.subscriptions().all_subscribers().is_empty());

    let deleted = broker.topics().delete_topic("weather").await.unwrap();
    assert_eq!(deleted.full_path(), "weather");
    broker.shutdown().await;
}

#[tokio::test]
async fn test_replaced_session_drop_keeps_new_subscriptions() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut old = mqtt.attach("10.0.0.1", 1883);
    old.subscribe("weather").await.unwrap();
    let mut new = mqtt.attach("10.0.0.1", 1883);
    new.subscribe("weather").await.unwrap();
    settle(&broker).await;

    drop(old);
    settle(&broker).await;
    assert_eq!(mqtt.session_count(), 1);
    assert!(broker.subscriptions().subscriber("10.0.0.1", 1883, "weather").is_some());

    new.publish("weather", "23C").await.unwrap();
    settle(&broker).await;
    assert_eq!(next(&mut new).await.content(), "23C");
    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_topic_counts_as_bad_request() {
    let broker = Broker::new(&test_settings()).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    let mut session = mqtt.attach("10.0.0.1", 1883);

    let err = session.subscribe("//").await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTopic(_)));
    assert_eq!(mqtt.stats().total_bad_requests(), 1);
    assert_eq!(mqtt.stats().total_requests(), 1);
}

#[tokio::test]
async fn test_system_message_broadcast() {
    let mut settings = test_settings();
    settings.broker.broadcast_system_messages = true;
    let broker = Broker::new(&settings).unwrap();
    let mqtt = LocalServer::new("mqtt", broker.handles());
    broker.add_protocol_server(Arc::new(mqtt.clone())).unwrap();
    broker.boot().await.unwrap();

    let mut session = mqtt.attach("10.0.0.1", 1883);
    session.subscribe("a").await.unwrap();
    session.subscribe("b").await.unwrap();
    settle(&broker).await;

    broker.system_message("maintenance at noon").await.unwrap();
    settle(&broker).await;

    let got = next(&mut session).await;
    assert!(got.is_system_message());
    assert_eq!(got.origin_protocol(), "Crossbar System");
    // one copy per endpoint, not per subscription
    assert!(session.try_recv().is_none());
    broker.shutdown().await;
}
