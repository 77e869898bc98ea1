//! # Integration Tests
//!
//! Every test spins up its own [`TestBroker`](courier_testkit::TestBroker) on
//! a fresh in-memory transport, so tests never share queues.

pub mod heartbeat;
pub mod lifecycle;
pub mod request_response;

#[cfg(test)]
pub(crate) mod fixtures {
    use courier_client::{
        bus_message, BusConfig, BusProfile, MessageBus, StaticHostIdentity, TimeoutConfig,
    };
    use courier_testkit::TestBroker;
    use serde::{Deserialize, Serialize};
    use shared_bus::InMemoryQueueFactory;
    use std::sync::Arc;
    use std::time::Duration;

    pub const WAIT: Duration = Duration::from_secs(3);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrderLine {
        pub sku: String,
        pub quantity: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrderPlaced {
        pub id: u64,
        pub customer: String,
        pub lines: Vec<OrderLine>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GetOrder {
        pub id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Order {
        pub id: u64,
        pub status: String,
    }

    bus_message! {
        OrderPlaced => "orders.OrderPlaced",
        GetOrder => "orders.GetOrder",
        Order => "orders.Order",
    }

    pub fn order_placed(id: u64) -> OrderPlaced {
        OrderPlaced {
            id,
            customer: format!("customer-{id}"),
            lines: vec![
                OrderLine {
                    sku: "apple".into(),
                    quantity: 3,
                },
                OrderLine {
                    sku: "pear".into(),
                    quantity: 1,
                },
            ],
        }
    }

    /// Subscription callback that accepts and drops every order.
    pub async fn ignore(_: OrderPlaced) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn config(profile: BusProfile) -> BusConfig {
        BusConfig {
            timeouts: TimeoutConfig {
                service_register: Duration::from_millis(500),
                handshake: Duration::from_millis(500),
                handler_register: Duration::from_millis(500),
                publish_reply: Duration::from_millis(500),
            },
            handshake_interval: Duration::from_millis(100),
            handshake_failure_threshold: 3,
            receive_poll: Duration::from_millis(20),
            profile,
            ..BusConfig::default()
        }
    }

    pub async fn broker() -> TestBroker {
        TestBroker::start(InMemoryQueueFactory::new())
            .await
            .expect("test broker")
    }

    /// A bus for `service` on `host`, wired to the broker's transport.
    pub fn bus(broker: &TestBroker, service: &str, host: &str, profile: BusProfile) -> MessageBus {
        MessageBus::builder()
            .with_service_name(service)
            .with_config(config(profile))
            .with_queue_factory(Arc::new(broker.factory().clone()))
            .with_host_identity(Arc::new(StaticHostIdentity::new(host, service)))
            .build()
            .expect("bus")
    }
}
