//! # Request / Response Tests
//!
//! Routed and same-host responses, remote failures, typing and timeouts.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{broker, bus, GetOrder, Order, WAIT};
    use courier_client::{BusError, BusProfile, MessageBus, RequestConfig};
    use courier_testkit::TestBroker;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn get_order() -> RequestConfig {
        RequestConfig::new("GetOrder", Duration::from_secs(2))
    }

    /// An "orders" service on `host` answering `GetOrder`.
    async fn order_service(broker: &TestBroker, host: &str) -> MessageBus {
        let service = bus(broker, "orders", host, BusProfile::SynchronousTest);
        service
            .request_handler("GetOrder", false, |request: GetOrder| async move {
                anyhow::ensure!(request.id != 404, "order {} not found", request.id);
                Ok(Order {
                    id: request.id,
                    status: "shipped".into(),
                })
            })
            .unwrap();
        service.start(&CancellationToken::new()).await.unwrap();
        service
    }

    async fn client(broker: &TestBroker, host: &str) -> MessageBus {
        let client = bus(broker, "storefront", host, BusProfile::SynchronousTest);
        client.start(&CancellationToken::new()).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_cross_host_response_goes_through_broker() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-b").await;

        let order: Order = client.request(&get_order(), &GetOrder { id: 12 }).await.unwrap();

        assert_eq!(
            order,
            Order {
                id: 12,
                status: "shipped".into()
            }
        );
        let records = broker.records();
        assert_eq!(records.requests.len(), 1);
        assert_eq!(records.responses.len(), 1);
        assert_eq!(records.responses[0].correlation_id, records.requests[0].correlation_id);
        assert_eq!(records.responses[0].responder.server_name, "host-a");

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_same_host_response_bypasses_broker() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-a").await;

        let order: Order = client.request(&get_order(), &GetOrder { id: 3 }).await.unwrap();

        assert_eq!(order.id, 3);
        let records = broker.records();
        assert_eq!(records.requests.len(), 1);
        assert!(records.responses.is_empty());

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_request_times_out_within_bound() {
        let broker = broker().await;
        let client = client(&broker, "host-b").await;
        broker.set_auto_reply(false);

        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        let err = client
            .request::<GetOrder, Order>(&RequestConfig::new("GetOrder", timeout), &GetOrder { id: 1 })
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BusError::RequestResponseTimeout { .. }));
        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(1), "returned after {elapsed:?}");
        let Some(shared_types::ProtocolMessage::Request(request)) = err.timed_out_message() else {
            panic!("timeout should carry the request, got {err:?}");
        };
        assert_eq!(request.name, "GetOrder");

        client.stop().await;
    }

    #[tokio::test]
    async fn test_missing_handler_reports_remote_failure() {
        let broker = broker().await;
        let client = client(&broker, "host-b").await;

        let err = client
            .request::<GetOrder, Order>(&get_order(), &GetOrder { id: 1 })
            .await
            .unwrap_err();

        let BusError::RequestHandlerFailed { request, error } = err else {
            panic!("expected a handler failure, got {err:?}");
        };
        assert_eq!(error.kind, "no_handler");
        assert_eq!(request.name, "GetOrder");
        client.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_reaches_requester() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-a").await;

        let err = client
            .request::<GetOrder, Order>(&get_order(), &GetOrder { id: 404 })
            .await
            .unwrap_err();

        let BusError::RequestHandlerFailed { error, .. } = &err else {
            panic!("expected a handler failure, got {err:?}");
        };
        assert_eq!(error.kind, "handler_error");
        assert_eq!(error.message, "order 404 not found");
        assert_eq!(broker.records().response_errors.len(), 1);

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_response_of_wrong_type_is_rejected() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-b").await;

        let err = client
            .request::<GetOrder, String>(&get_order(), &GetOrder { id: 1 })
            .await
            .unwrap_err();

        let BusError::InvalidMessageType { expected, actual } = err else {
            panic!("expected a type mismatch, got {err:?}");
        };
        assert_eq!(expected, "string");
        assert_eq!(actual, "orders.Order");

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_null_response_decodes_as_none() {
        let broker = broker().await;
        let service = bus(&broker, "orders", "host-a", BusProfile::SynchronousTest);
        service
            .request_handler("FindOrder", false, |request: GetOrder| async move {
                anyhow::Ok((request.id == 1).then(|| Order {
                    id: 1,
                    status: "open".into(),
                }))
            })
            .unwrap();
        service.start(&CancellationToken::new()).await.unwrap();
        let client = client(&broker, "host-b").await;
        let find = RequestConfig::new("FindOrder", Duration::from_secs(2));

        let found: Option<Order> = client.request(&find, &GetOrder { id: 1 }).await.unwrap();
        let missing: Option<Order> = client.request(&find, &GetOrder { id: 2 }).await.unwrap();

        assert_eq!(found.map(|o| o.status), Some("open".to_string()));
        assert_eq!(missing, None);
        let records = broker.records();
        assert_eq!(records.responses[1].message_type, None);

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_mocked_response_skips_handlers() {
        let broker = broker().await;
        broker
            .mock_response(
                "GetOrder",
                |request: &GetOrder| request.id == 77,
                Order {
                    id: 77,
                    status: "mocked".into(),
                },
            )
            .unwrap();
        let client = client(&broker, "host-b").await;

        let order: Order = client.request(&get_order(), &GetOrder { id: 77 }).await.unwrap();
        assert_eq!(order.status, "mocked");

        let err = client
            .request::<GetOrder, Order>(&get_order(), &GetOrder { id: 78 })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestHandlerFailed { .. }));
        client.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_request_from_sync_code() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-b").await;

        let caller = client.clone();
        let order = tokio::task::spawn_blocking(move || {
            caller.request_blocking::<GetOrder, Order>(&get_order(), &GetOrder { id: 5 })
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(order.id, 5);
        client.stop().await;
        service.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_request_from_async_context() {
        let broker = broker().await;
        let service = order_service(&broker, "host-a").await;
        let client = client(&broker, "host-b").await;

        let order = client
            .request_blocking::<GetOrder, Order>(&get_order(), &GetOrder { id: 6 })
            .unwrap();
        assert_eq!(order.id, 6);

        let unstarted = bus(&broker, "storefront", "host-c", BusProfile::SynchronousTest);
        assert!(matches!(
            unstarted.request_blocking::<GetOrder, Order>(&get_order(), &GetOrder { id: 6 }),
            Err(BusError::InvalidState(_))
        ));

        client.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_request_returns_promptly() {
        let broker = broker().await;
        let client = client(&broker, "host-b").await;
        broker.set_auto_reply(false);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = client
            .request_cancellable::<GetOrder, Order>(&get_order(), &GetOrder { id: 1 }, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Cancelled));
        assert!(started.elapsed() < WAIT);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_request_requires_running_bus() {
        let broker = broker().await;
        let client = bus(&broker, "storefront", "host-b", BusProfile::SynchronousTest);

        let err = client
            .request::<GetOrder, Order>(&get_order(), &GetOrder { id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidState(_)));

        client.start(&CancellationToken::new()).await.unwrap();
        let err = client
            .request::<GetOrder, Order>(&RequestConfig::new("", Duration::from_secs(1)), &GetOrder { id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
        client.stop().await;
    }
}
