#![allow(dead_code)]

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

pub const STATUS: &str = "aa22ac00000000000303c00048667f7f0030000000675300000000000000000040a5f1";
pub const CAPABILITIES: &str = "aa29ac00000000000303b5071202010013020101140201011502010116020101170201001a0201018c2e";
pub const NOTIFY_ACK: &str = "aa1fac0000000000030d0101040405a8c0ff0001010100000000000000007b31";

/// Logs through the test harness; filter with `RUST_LOG=midea_ac=trace`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reads one appliance frame as written by the serial bridge transport.
pub async fn read_frame(peer: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = [0u8; 2];
    peer.read_exact(&mut head).await.ok()?;
    let mut rest = vec![0u8; head[1] as usize - 1];
    peer.read_exact(&mut rest).await.ok()?;
    Some([&head[..], &rest[..]].concat())
}
