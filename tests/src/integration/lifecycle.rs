//! # Lifecycle Tests
//!
//! Start, stop and registration rules of the bus as seen by the broker.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{broker, bus, ignore, order_placed, WAIT};
    use courier_client::{
        BusError, BusProfile, BusState, PublishConfig, SubscribeOptions, MAX_QUEUE_NAME_LENGTH,
    };
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_empty_bus_registers_and_handshakes_once() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);

        bus.start(&CancellationToken::new()).await.unwrap();

        assert_eq!(bus.state(), BusState::Running);
        let records = broker.records();
        assert_eq!(records.service_registers.len(), 1);
        assert_eq!(records.service_registers[0].origin.service_name, "orders");
        assert_eq!(records.handshakes.len(), 1);
        assert!(records.handshakes[0].subscribe_handlers.is_empty());
        assert!(records.handshakes[0].request_handlers.is_empty());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_announces_every_handler() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.subscribe_handler("orders.placed", SubscribeOptions::named("audit"), ignore)
            .unwrap();
        bus.subscribe_handler("orders.placed", SubscribeOptions::default(), ignore)
            .unwrap();
        bus.request_handler("Ping", false, |n: u32| async move { anyhow::Ok(n) })
            .unwrap();

        bus.start(&CancellationToken::new()).await.unwrap();

        let records = broker.records();
        let handshake = &records.handshakes[0];
        assert_eq!(handshake.subscribe_handlers.len(), 2);
        assert_eq!(handshake.request_handlers.len(), 1);
        assert_eq!(records.request_registers.len(), 1);

        let audit = handshake
            .subscribe_handlers
            .iter()
            .find(|h| h.name == "audit")
            .unwrap();
        assert!(audit.durable);
        assert_eq!(audit.queue_name, "orders.orders.placed.audit");
        assert!(handshake
            .subscribe_handlers
            .iter()
            .all(|h| h.queue_name.chars().count() <= MAX_QUEUE_NAME_LENGTH));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_deregisters_with_empty_handshake() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.request_handler("Ping", false, |n: u32| async move { anyhow::Ok(n) })
            .unwrap();
        bus.start(&CancellationToken::new()).await.unwrap();

        bus.stop().await;
        bus.stop().await;

        let records = broker.records();
        assert_eq!(records.handshakes.len(), 2);
        let last = records.handshakes.last().unwrap();
        assert!(last.subscribe_handlers.is_empty() && last.request_handlers.is_empty());
        assert_eq!(bus.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_start() {
        let broker = broker().await;
        broker.shutdown().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);

        let err = bus.start(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BusError::MessageBrokerUnavailable { .. }));
        assert!(broker.records().service_registers.is_empty());
    }

    #[tokio::test]
    async fn test_silent_broker_times_out_registration() {
        let broker = broker().await;
        broker.set_auto_reply(false);
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);

        let err = bus.start(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BusError::ServiceRegisterTimeout { .. }));
        assert!(err.is_timeout());
        assert_ne!(bus.state(), BusState::Running);
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);

        bus.subscribe_handler("orders.placed", SubscribeOptions::named("audit"), ignore)
            .unwrap();
        let duplicate = bus.subscribe_handler("orders.placed", SubscribeOptions::named("audit"), ignore);
        assert!(matches!(duplicate, Err(BusError::DoubleRegistration { .. })));

        assert!(matches!(
            bus.subscribe_handler("", SubscribeOptions::default(), ignore),
            Err(BusError::InvalidArgument(_))
        ));

        bus.start(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            bus.request_handler("Late", false, |n: u32| async move { anyhow::Ok(n) }),
            Err(BusError::InvalidState(_))
        ));
        assert!(matches!(
            bus.start(&CancellationToken::new()).await,
            Err(BusError::InvalidState(_))
        ));
        bus.stop().await;

        assert!(matches!(
            bus.publish(&PublishConfig::new("orders.placed"), &order_placed(1)).await,
            Err(BusError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_stops_bus() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::Production);
        let shutdown = CancellationToken::new();
        bus.start(&shutdown).await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(WAIT, bus.wait()).await.unwrap().unwrap();

        assert_eq!(bus.state(), BusState::Stopped);
        let last = broker.records().handshakes.last().cloned().unwrap();
        assert!(last.subscribe_handlers.is_empty() && last.request_handlers.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_releases_queues() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.request_handler("Ping", false, |n: u32| async move { anyhow::Ok(n) })
            .unwrap();
        bus.start(&CancellationToken::new()).await.unwrap();
        let queue = bus.request_handlers()[0].queue_name.clone();
        assert!(broker.factory().exists(&queue));

        bus.dispose().await;

        assert!(!broker.factory().exists(&queue));
    }

    #[tokio::test]
    async fn test_sent_messages_are_counted() {
        courier_telemetry::register_metrics().unwrap();
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);

        bus.start(&CancellationToken::new()).await.unwrap();
        bus.stop().await;

        let text = courier_telemetry::gather_text().unwrap();
        assert!(text.contains("courier_messages_sent_total{kind=\"ServiceRegister\"}"));
        assert!(text.contains("courier_messages_sent_total{kind=\"Handshake\"}"));
    }
}
