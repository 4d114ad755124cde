use prometheus::{IntCounter, IntGauge};
use std::sync::LazyLock;

pub static CONNECTION_GAUGE: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "mailgate_connection_count",
        "number of connections currently being served"
    )
    .unwrap()
});

pub static TOTAL_CONNECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "mailgate_total_connections",
        "total number of connections accepted since startup"
    )
    .unwrap()
});

pub static TOTAL_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "mailgate_total_messages_received",
        "total number of messages that completed the DATA phase"
    )
    .unwrap()
});
