//! End-to-end scenarios against a real Postgres database and real TCP
//! sockets: open a tunnel, bridge a connection, and detach an agent.
//!
//! Requires `TUNNELBROKER_TEST_DATABASE_URL` pointing at a scratch
//! Postgres database; migrations run automatically. Skipped otherwise.

mod support;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnelbroker_core::Lifecycle;
use uuid::Uuid;

async fn seed_token(pool: &sqlx::PgPool, port: u16) -> String {
    let team_id = Uuid::new_v4();
    let token_id = Uuid::new_v4();
    let secret = format!("tok_{}", Uuid::new_v4().simple());

    sqlx::query("INSERT INTO teams (id, name, deleted, created_at, updated_at) VALUES ($1, $2, false, now(), now())")
        .bind(team_id)
        .bind(format!("team-{team_id}"))
        .execute(pool)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO tokens (id, secret, team_id, active, created_at) VALUES ($1, $2, $3, true, now())",
    )
    .bind(token_id)
    .bind(&secret)
    .bind(team_id)
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO port_assignments (id, port, protocol, token_id, created_at) VALUES ($1, $2, 'tcp', $3, now())",
    )
    .bind(Uuid::new_v4())
    .bind(i32::from(port))
    .bind(token_id)
    .execute(pool)
    .await
    .unwrap();

    secret
}

fn test_database_url() -> Option<String> {
    std::env::var("TUNNELBROKER_TEST_DATABASE_URL").ok()
}

async fn find_free_port() -> u16 {
    let (listener, port) = support::ephemeral_listener().await;
    drop(listener);
    port
}

#[tokio::test]
#[ignore = "requires TUNNELBROKER_TEST_DATABASE_URL"]
async fn s1_bridges_a_connection_and_echoes_data() {
    let Some(database_url) = test_database_url() else { return };
    let lifecycle = Lifecycle::bootstrap(&database_url, [127, 0, 0, 1].into()).await.unwrap();
    lifecycle.restore(Duration::from_secs(300)).await.unwrap();

    let control_port = find_free_port().await;
    let control_addr: SocketAddr = ([127, 0, 0, 1], control_port).into();
    let public_port = find_free_port().await;
    let secret = seed_token(lifecycle.store().pool(), public_port).await;

    tokio::spawn(async move {
        lifecycle
            .run_control_listener(control_addr, Duration::from_secs(5))
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The fake agent stands in for both the real agent process and the
    // local service it would forward to: it echoes whatever arrives on
    // the data channel, the same way a local TCP echo service would.
    let (mut agent, reply) = support::FakeAgent::connect(control_addr, &secret, 9).await;
    assert!(reply.starts_with("SUCCESS:"));

    let mut external = tokio::net::TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let conn_id = agent.wait_for_connect().await;
    let data_socket = support::FakeAgent::open_data_channel(control_addr, &conn_id).await;
    let echo_task = tokio::spawn(support::run_echo(data_socket));

    external.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    external.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    drop(external);
    let _ = echo_task.await;
}

#[tokio::test]
#[ignore = "requires TUNNELBROKER_TEST_DATABASE_URL"]
async fn s3_detached_agent_serves_503_to_new_connections() {
    let Some(database_url) = test_database_url() else { return };
    let lifecycle = Lifecycle::bootstrap(&database_url, [127, 0, 0, 1].into()).await.unwrap();
    lifecycle.restore(Duration::from_secs(300)).await.unwrap();

    let control_port = find_free_port().await;
    let control_addr: SocketAddr = ([127, 0, 0, 1], control_port).into();
    let public_port = find_free_port().await;
    let secret = seed_token(lifecycle.store().pool(), public_port).await;

    tokio::spawn(async move {
        lifecycle
            .run_control_listener(control_addr, Duration::from_secs(5))
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (agent, reply) = support::FakeAgent::connect(control_addr, &secret, 9).await;
    assert!(reply.starts_with("SUCCESS:"));
    agent.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut external = tokio::net::TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let mut response = Vec::new();
    external.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 503"));
}
