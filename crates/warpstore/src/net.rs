//! Networked store client.
//!
//! One command connection lives behind a mutex and is (re)established
//! lazily; an I/O failure drops it so the next call reconnects. Each
//! subscription gets its own dedicated connection because a RESP connection
//! in subscribe mode can carry nothing else.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::resp::{Value, encode_command, read_value};
use crate::{StoreError, StoreOps};

#[derive(Debug, Clone)]
pub struct NetStoreConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub database: u32,
    pub timeout_ms: u64,
}

impl Default for NetStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            database: 0,
            timeout_ms: 5000,
        }
    }
}

struct Conn {
    rd: BufReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
}

impl Conn {
    async fn open(cfg: &NetStoreConfig) -> Result<Self, StoreError> {
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        let (rd, wr) = stream.into_split();
        let mut conn = Self {
            rd: BufReader::new(rd),
            wr,
        };

        if !cfg.password.is_empty() {
            conn.command(&["AUTH", &cfg.password]).await?;
        }
        if cfg.database != 0 {
            conn.command(&["SELECT", &cfg.database.to_string()]).await?;
        }
        Ok(conn)
    }

    async fn command(&mut self, args: &[&str]) -> Result<Value, StoreError> {
        self.wr.write_all(&encode_command(args)).await?;
        let v = read_value(&mut self.rd).await?;
        if let Value::Error(e) = v {
            return Err(StoreError::Server(e));
        }
        Ok(v)
    }
}

pub struct NetStore {
    cfg: NetStoreConfig,
    conn: Mutex<Option<Conn>>,
}

impl NetStore {
    pub fn new(cfg: NetStoreConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms.max(1))
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        let fut = async {
            let mut slot = self.conn.lock().await;
            if slot.is_none() {
                debug!(host = %self.cfg.host, port = self.cfg.port, "store connecting");
                *slot = Some(Conn::open(&self.cfg).await?);
            }
            let conn = slot.as_mut().unwrap();
            match conn.command(args).await {
                Ok(v) => Ok(v),
                Err(e) => {
                    // Drop the connection on any failure; next call reconnects.
                    *slot = None;
                    Err(e)
                }
            }
        };

        match tokio::time::timeout(self.timeout(), fut).await {
            Ok(res) => res,
            Err(_) => {
                *self.conn.lock().await = None;
                Err(StoreError::Timeout)
            }
        }
    }
}

#[async_trait]
impl StoreOps for NetStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Value::Bulk(b) => Ok(b),
            v => Err(StoreError::Protocol(format!("GET returned {v:?}"))),
        }
    }

    async fn setex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError> {
        self.command(&["SETEX", key, &seconds.to_string(), value])
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        match self.command(&["TTL", key]).await? {
            Value::Int(n) => Ok(n),
            v => Err(StoreError::Protocol(format!("TTL returned {v:?}"))),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.command(&["PUBLISH", channel, message]).await?;
        Ok(())
    }

    async fn subscribe_once(
        &self,
        channel: &str,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), StoreError> {
        let connect = Conn::open(&self.cfg);
        let mut conn = match tokio::time::timeout(self.timeout(), connect).await {
            Ok(res) => res?,
            Err(_) => return Err(StoreError::Timeout),
        };

        conn.wr
            .write_all(&encode_command(&["SUBSCRIBE", channel]))
            .await?;

        loop {
            let v = read_value(&mut conn.rd).await?;
            let Value::Array(Some(items)) = v else {
                continue;
            };
            let kind = items.first().cloned().and_then(Value::into_bulk);
            match kind.as_deref() {
                Some("message") => {
                    let Some(payload) = items.get(2).cloned().and_then(Value::into_bulk) else {
                        continue;
                    };
                    if tx.send(payload).await.is_err() {
                        // Consumer is gone; clean shutdown.
                        return Ok(());
                    }
                }
                // subscribe/unsubscribe acks and anything else are ignored.
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn fake_server_once(reply: &'static [u8]) -> (NetStore, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            buf.truncate(n);
            sock.write_all(reply).await.unwrap();
            buf
        });
        let store = NetStore::new(NetStoreConfig {
            port,
            timeout_ms: 2000,
            ..Default::default()
        });
        (store, handle)
    }

    #[tokio::test]
    async fn get_hits_the_wire() {
        let (store, server) = fake_server_once(b"$2\r\nhi\r\n").await;
        assert_eq!(store.get("some:key").await.unwrap().as_deref(), Some("hi"));
        let sent = server.await.unwrap();
        assert_eq!(sent, encode_command(&["GET", "some:key"]));
    }

    #[tokio::test]
    async fn error_reply_surfaces_and_drops_conn() {
        let (store, _server) = fake_server_once(b"-ERR busted\r\n").await;
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Server(ref m)) if m.contains("busted")
        ));
        assert!(store.conn.lock().await.is_none());
    }

    #[tokio::test]
    async fn connect_failure_is_io_error() {
        let store = NetStore::new(NetStoreConfig {
            port: 1, // nothing listens here
            timeout_ms: 500,
            ..Default::default()
        });
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Io(_) | StoreError::Timeout)
        ));
    }
}
