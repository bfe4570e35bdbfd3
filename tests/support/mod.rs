//! Shared fixtures for the integration suite: a fake agent that speaks
//! the control protocol over a real `TcpStream`, and a disposable
//! listener on an ephemeral port.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tunnelbroker_shared::protocol::{format_conn_id, format_connect, parse_data_line};
use tunnelbroker_shared::{read_line, write_line};

/// Bind an ephemeral listener and report its port, for tests that need a
/// free TCP port without racing against another test for it.
pub async fn ephemeral_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A fake agent: dials the control port, authenticates, and can then
/// wait for `CONNECT` announcements and open the matching data channel.
pub struct FakeAgent {
    control: TcpStream,
}

impl FakeAgent {
    /// Connect to the control port and run the two-line auth handshake.
    /// Returns the agent once `SUCCESS` (or `ERROR`) has been read.
    pub async fn connect(control_addr: std::net::SocketAddr, secret: &str, local_port: u16) -> (Self, String) {
        let mut control = TcpStream::connect(control_addr).await.unwrap();
        write_line(&mut control, secret).await.unwrap();
        write_line(&mut control, &local_port.to_string()).await.unwrap();
        let reply = read_line(&mut control).await.unwrap();
        (FakeAgent { control }, reply)
    }

    /// Wait for the next `CONNECT` + `CONN_ID` pair on the control
    /// socket and return the connection id.
    pub async fn wait_for_connect(&mut self) -> String {
        let connect_line = read_line(&mut self.control).await.unwrap();
        assert_eq!(connect_line, format_connect());
        let conn_id_line = read_line(&mut self.control).await.unwrap();
        conn_id_line
            .strip_prefix("CONN_ID:")
            .expect("expected a CONN_ID line after CONNECT")
            .to_string()
    }

    /// Open the data channel for `conn_id` against the control port and
    /// return the connected data socket.
    pub async fn open_data_channel(control_addr: std::net::SocketAddr, conn_id: &str) -> TcpStream {
        let mut data = TcpStream::connect(control_addr).await.unwrap();
        write_line(&mut data, &format!("DATA:{conn_id}")).await.unwrap();
        data
    }

    /// Drop the control connection, simulating the agent process exiting.
    pub fn disconnect(self) {
        drop(self.control);
    }
}

/// Echo every byte read back to the writer, until EOF. Stands in for a
/// local service on the other side of the agent.
pub async fn run_echo(mut socket: TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if socket.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[allow(dead_code)]
pub fn is_data_line(line: &str) -> bool {
    parse_data_line(line).is_some()
}

/// Shortcut for a `conn_id -> format_conn_id` round trip, used by tests
/// that build a CONN_ID line by hand.
#[allow(dead_code)]
pub fn conn_id_line(conn_id: &str) -> String {
    format_conn_id(conn_id)
}
