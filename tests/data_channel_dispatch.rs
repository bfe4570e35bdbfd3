//! Exercises the control handler's `DATA:<conn_id>` dispatch path
//! directly, without a database: pairing delivery never touches the
//! Store.

mod support;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;

use tunnelbroker_core::{handle_control_connection, PairingTable, Registry};
use tunnelbroker_store::Store;

fn unconnected_store() -> Arc<Store> {
    Arc::new(Store::from_pool(
        PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction does not touch the network"),
    ))
}

#[tokio::test]
async fn data_line_delivers_socket_to_reserved_slot() {
    let (listener, port) = support::ephemeral_listener().await;
    let registry = Arc::new(Registry::new());
    let pairing = Arc::new(PairingTable::new());
    let store = unconnected_store();
    let (shutdown, _rx) = broadcast::channel(1);

    let rx = pairing.reserve("conn-under-test".to_string()).unwrap();

    let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tunnelbroker_shared::write_line(&mut client, "DATA:conn-under-test")
        .await
        .unwrap();

    let (socket, addr) = listener.accept().await.unwrap();
    let bind_addr: std::net::IpAddr = [127, 0, 0, 1].into();
    handle_control_connection(socket, addr, registry, pairing, store, bind_addr, shutdown)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
        .await
        .expect("delivery should not time out")
        .expect("slot should receive the socket");
    drop(delivered);
}

#[tokio::test]
async fn data_line_for_unknown_slot_is_a_no_op() {
    let (listener, port) = support::ephemeral_listener().await;
    let registry = Arc::new(Registry::new());
    let pairing = Arc::new(PairingTable::new());
    let store = unconnected_store();
    let (shutdown, _rx) = broadcast::channel(1);

    let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tunnelbroker_shared::write_line(&mut client, "DATA:nobody-reserved-this")
        .await
        .unwrap();

    let (socket, addr) = listener.accept().await.unwrap();
    let bind_addr: std::net::IpAddr = [127, 0, 0, 1].into();
    let result =
        handle_control_connection(socket, addr, registry.clone(), pairing.clone(), store, bind_addr, shutdown).await;
    assert!(result.is_ok());
    assert_eq!(pairing.len(), 0);
    assert!(registry.is_empty());
}
