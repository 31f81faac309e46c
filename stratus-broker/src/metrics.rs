//! Prometheus instrumentation for the broker.
//!
//! All collectors are registered with the default registry so the daemon can
//! serve them with `prometheus::gather()`.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    pub static ref CLIENTS_CONNECTED: IntGauge = register_int_gauge!(
        "mqtt_clients_connected",
        "Number of currently connected MQTT clients"
    )
    .expect("metric can be registered");

    pub static ref MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "mqtt_messages_received_total",
        "Total number of MQTT messages received by type",
        &["type"]
    )
    .expect("metric can be registered");

    pub static ref MESSAGES_SENT: IntCounterVec = register_int_counter_vec!(
        "mqtt_messages_sent_total",
        "Total number of MQTT messages sent by type",
        &["type"]
    )
    .expect("metric can be registered");

    pub static ref BYTES_RECEIVED: IntCounter = register_int_counter!(
        "mqtt_bytes_received_total",
        "Total bytes received from MQTT clients"
    )
    .expect("metric can be registered");

    pub static ref BYTES_SENT: IntCounter = register_int_counter!(
        "mqtt_bytes_sent_total",
        "Total bytes sent to MQTT clients"
    )
    .expect("metric can be registered");

    pub static ref CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        "mqtt_connections_total",
        "Total number of connection attempts"
    )
    .expect("metric can be registered");

    pub static ref SUBSCRIPTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "mqtt_subscriptions_active",
        "Number of active subscriptions"
    )
    .expect("metric can be registered");

    pub static ref RETAINED_MESSAGES: IntGauge = register_int_gauge!(
        "mqtt_retained_messages",
        "Number of retained messages"
    )
    .expect("metric can be registered");

    pub static ref QOS_MESSAGES_INFLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "mqtt_qos_messages_inflight",
        "Number of in-flight QoS 1 messages",
        &["qos"]
    )
    .expect("metric can be registered");

    pub static ref MESSAGES_DROPPED: IntCounter = register_int_counter!(
        "mqtt_messages_dropped_total",
        "Deliveries dropped because a subscriber's inflight window or packet \
         identifier space was full"
    )
    .expect("metric can be registered");
}

/// Forces registration of every collector so they all appear in the first
/// scrape, before any traffic has touched them.
pub fn init() {
    lazy_static::initialize(&CLIENTS_CONNECTED);
    lazy_static::initialize(&MESSAGES_RECEIVED);
    lazy_static::initialize(&MESSAGES_SENT);
    lazy_static::initialize(&BYTES_RECEIVED);
    lazy_static::initialize(&BYTES_SENT);
    lazy_static::initialize(&CONNECTIONS_TOTAL);
    lazy_static::initialize(&SUBSCRIPTIONS_ACTIVE);
    lazy_static::initialize(&RETAINED_MESSAGES);
    lazy_static::initialize(&QOS_MESSAGES_INFLIGHT);
    lazy_static::initialize(&MESSAGES_DROPPED);
}
