//! # Heartbeat Tests
//!
//! Periodic handshakes, the failure threshold and the broker send retry.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{broker, bus, order_placed, WAIT};
    use courier_client::{BusError, BusProfile, BusState, PublishConfig, DEFAULT_BROKER_QUEUE};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_production_bus_handshakes_periodically() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::Production);
        bus.start(&CancellationToken::new()).await.unwrap();

        let records = broker
            .wait_for(|r| r.handshakes.len() >= 3, WAIT)
            .await
            .unwrap();

        assert!(records
            .handshakes
            .iter()
            .all(|h| h.origin.service_name == "orders"));
        assert_eq!(records.service_registers.len(), 1);
        assert_eq!(bus.state(), BusState::Running);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_test_profile_only_handshakes_on_demand() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.start(&CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(broker.records().handshakes.len(), 1);

        bus.handshake_now().await.unwrap();
        assert_eq!(broker.records().handshakes.len(), 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_lost_broker_stops_bus() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::Production);
        bus.start(&CancellationToken::new()).await.unwrap();

        broker.shutdown().await;
        let err = tokio::time::timeout(WAIT, bus.wait())
            .await
            .unwrap()
            .unwrap_err();

        let BusError::HandshakeFailed { failures, trigger } = &err else {
            panic!("expected a fatal handshake failure, got {err:?}");
        };
        assert_eq!(*failures, 4);
        assert!(matches!(**trigger, BusError::MessageBrokerUnavailable { .. }));
        assert_eq!(bus.state(), BusState::Stopped);
        assert!(bus.fatal_error().is_some());

        assert!(matches!(
            bus.publish(&PublishConfig::new("orders.placed"), &order_placed(1)).await,
            Err(BusError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.start(&CancellationToken::new()).await.unwrap();

        // Each failed handshake consumes the send and its one retry.
        broker.factory().fail_next_sends(DEFAULT_BROKER_QUEUE, 6);
        for _ in 0..3 {
            let err = bus.handshake_now().await.unwrap_err();
            assert!(matches!(err, BusError::MessageBrokerUnavailable { .. }));
        }
        bus.handshake_now().await.unwrap();

        broker.factory().fail_next_sends(DEFAULT_BROKER_QUEUE, 6);
        for _ in 0..3 {
            assert!(bus.handshake_now().await.is_err());
        }
        assert!(bus.fatal_error().is_none());
        assert_eq!(bus.state(), BusState::Running);

        broker.factory().fail_next_sends(DEFAULT_BROKER_QUEUE, 2);
        let err = bus.handshake_now().await.unwrap_err();
        assert!(matches!(err, BusError::HandshakeFailed { failures: 4, .. }));
        assert_eq!(bus.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn test_send_is_retried_once_after_reconnect() {
        let broker = broker().await;
        let bus = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        bus.start(&CancellationToken::new()).await.unwrap();
        let publish = PublishConfig::new("orders.placed");

        broker.factory().fail_next_sends(DEFAULT_BROKER_QUEUE, 1);
        bus.publish(&publish, &order_placed(1)).await.unwrap();
        assert_eq!(broker.factory().reconnect_count(DEFAULT_BROKER_QUEUE), 1);
        broker
            .wait_for(|r| r.published.len() == 1, WAIT)
            .await
            .unwrap();

        broker.factory().fail_next_sends(DEFAULT_BROKER_QUEUE, 2);
        let err = bus.publish(&publish, &order_placed(2)).await.unwrap_err();
        let BusError::MessageBrokerUnavailable { queue, source } = &err else {
            panic!("expected the broker to be unavailable, got {err:?}");
        };
        assert_eq!(queue, DEFAULT_BROKER_QUEUE);
        assert!(source.is_some());
        assert_eq!(broker.factory().reconnect_count(DEFAULT_BROKER_QUEUE), 2);
        assert_eq!(bus.state(), BusState::Running);
        bus.stop().await;
    }
}
