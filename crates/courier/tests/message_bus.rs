use std::time::Duration;

use courier::prelude::*;
use courier::runtime::BrokerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(kind = "event")]
struct OrderEvent {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
struct OrderShipped {
    #[message(parent)]
    order: OrderEvent,
    carrier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(kind = "command")]
struct ShipOrder {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(kind = "query")]
struct GetStock {
    sku: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(kind = "command")]
struct Stock {
    available: u32,
}

fn with_memory_broker() -> CourierConfig {
    let mut config = CourierConfig::default();
    config.brokers.insert("main".into(), BrokerConfig::default());
    config
}

#[tokio::test]
async fn derived_event_reaches_parent_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runtime = MessagingRuntime::builder()
        .config(CourierConfig::default())
        .without_logging()
        .routes(
            MessageRoutes::new("audit").dispatcher(
                Dispatcher::on::<OrderEvent>()
                    .include_derived(true)
                    .handle(move |event| {
                        let tx = tx.clone();
                        async move {
                            tx.send(event.order_id.clone()).ok();
                            Ok(())
                        }
                    }),
            ),
        )
        .build()
        .unwrap();

    runtime.start().await.unwrap();
    runtime
        .publish(OrderShipped {
            order: OrderEvent {
                order_id: "o-17".into(),
            },
            carrier: "post".into(),
        })
        .await
        .unwrap();

    assert_eq!(rx.recv().await.as_deref(), Some("o-17"));
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn derived_event_crosses_broker_as_its_parent() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runtime = MessagingRuntime::builder()
        .config(with_memory_broker())
        .without_logging()
        .topology(topology_registry("orders", "main", move |t| {
            let tx = tx.clone();
            t.define_queue::<OrderEvent>("order-events");
            t.route_to_queue::<OrderEvent>(
                "order-events",
                Dispatcher::on::<OrderEvent>()
                    .include_derived(true)
                    .handle(move |event| {
                        let tx = tx.clone();
                        async move {
                            tx.send(event.into_inner()).ok();
                            Ok(())
                        }
                    }),
            );
        }))
        .build()
        .unwrap();

    runtime.start().await.unwrap();
    runtime
        .publish(OrderShipped {
            order: OrderEvent {
                order_id: "o-21".into(),
            },
            carrier: "post".into(),
        })
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(received.map(|event| event.order_id).as_deref(), Some("o-21"));
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn command_travels_through_work_queue() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runtime = MessagingRuntime::builder()
        .config(with_memory_broker())
        .without_logging()
        .topology(topology_registry("shipping", "main", move |t| {
            let tx = tx.clone();
            t.define_queue::<ShipOrder>("shipping");
            t.route_to_queue::<ShipOrder>(
                "shipping",
                Dispatcher::on::<ShipOrder>().handle(move |command| {
                    let tx = tx.clone();
                    async move {
                        tx.send(command.into_inner().order_id).ok();
                        Ok(())
                    }
                }),
            );
        }))
        .build()
        .unwrap();

    runtime.start().await.unwrap();
    runtime
        .publish(ShipOrder {
            order_id: "o-3".into(),
        })
        .await
        .unwrap();

    let shipped = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(shipped.as_deref(), Some("o-3"));
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn query_is_answered_over_rpc() {
    let runtime = MessagingRuntime::builder()
        .config(with_memory_broker())
        .without_logging()
        .topology(topology_registry("inventory", "main", |t| {
            t.define_queue_with_response::<GetStock, Stock>("inventory")
                .rpc_timeout(Duration::from_secs(2));
            t.route_to_queue_with_response::<GetStock, Stock>(
                "inventory",
                Dispatcher::on::<GetStock>().handle(|query| async move {
                    if query.sku.is_empty() {
                        return Err::<Reply<Stock>, BoxError>("sku required".into());
                    }
                    Ok(Reply(Stock { available: 12 }))
                }),
            );
        }))
        .build()
        .unwrap();

    runtime.start().await.unwrap();

    let stock: Stock = runtime
        .send(GetStock { sku: "tea".into() })
        .await
        .unwrap();
    assert_eq!(stock.available, 12);

    let failed = runtime.send::<Stock, _>(GetStock { sku: String::new() }).await;
    assert!(failed.unwrap_err().to_string().contains("sku required"));

    runtime.stop().await.unwrap();
}
