//! Redis-backed broker: `LPUSH`/`BRPOP` lists and `PUBLISH` channels.
//!
//! Short commands share one multiplexed connection that is reopened after a
//! failure. Blocking pops run on dedicated connections, because `BRPOP`
//! would otherwise stall every other command pipelined on the same socket.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncConnectionConfig, Client, Cmd, FromRedisValue};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Broker;
use crate::error::BrokerError;

/// Extra time the client waits on a blocking pop beyond the server timeout.
const RESPONSE_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

pub struct RedisBroker {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    /// Idle connections reserved for blocking pops.
    blocking: StdMutex<Vec<MultiplexedConnection>>,
    /// Client-side timeout for blocking pops.
    block_response_timeout: Duration,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Open a broker and check the server is reachable. `max_block` is the
    /// longest pop timeout callers will ask for.
    pub async fn connect(url: &str, max_block: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url)
            .map_err(|e| BrokerError::Connection(format!("invalid redis url {url}: {e}")))?;
        let broker = Self {
            client,
            connection: Mutex::new(None),
            blocking: StdMutex::new(Vec::new()),
            block_response_timeout: max_block.saturating_add(RESPONSE_TIMEOUT_GRACE),
            closed: AtomicBool::new(false),
        };
        let pong: String = broker.run_command("PING", || ::redis::cmd("PING")).await?;
        debug!(reply = %pong, "Redis broker connected");
        Ok(broker)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<MultiplexedConnection>,
    ) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = connection.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        *connection = Some(conn.clone());
        Ok(conn)
    }

    /// Run a command on the shared connection, reconnecting and retrying once.
    async fn run_command<T, F>(&self, command: &'static str, build: F) -> Result<T, BrokerError>
    where
        T: FromRedisValue + Send,
        F: Fn() -> Cmd,
    {
        self.ensure_open()?;
        let mut last_err = None;
        for attempt in 0..2 {
            let mut conn = {
                let mut guard = self.connection.lock().await;
                self.ensure_connection(&mut guard).await?
            };
            let result: ::redis::RedisResult<T> = build().query_async(&mut conn).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(command, attempt = attempt + 1, error = %err, "Redis command failed; reconnecting");
                    *self.connection.lock().await = None;
                    last_err = Some(err);
                }
            }
        }
        Err(BrokerError::Command {
            command,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, BrokerError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                let config = AsyncConnectionConfig::new()
                    .set_response_timeout(Some(self.block_response_timeout));
                self.client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))
            }
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let _: i64 = self
            .run_command("LPUSH", || {
                let mut cmd = ::redis::cmd("LPUSH");
                cmd.arg(topic).arg(payload);
                cmd
            })
            .await?;
        Ok(())
    }

    async fn pop(&self, topic: &str, timeout: Duration) -> Result<Option<String>, BrokerError> {
        self.ensure_open()?;
        let mut conn = self.checkout_blocking().await?;

        let mut cmd = ::redis::cmd("BRPOP");
        // Zero would block forever.
        cmd.arg(topic).arg(timeout.as_secs_f64().max(0.01));

        let reply: ::redis::RedisResult<Option<(String, String)>> =
            cmd.query_async(&mut conn).await;
        match reply {
            Ok(reply) => {
                self.checkin_blocking(conn);
                Ok(reply.map(|(_, message)| message))
            }
            // A failed connection is dropped rather than returned to the pool.
            Err(err) => Err(BrokerError::Command {
                command: "BRPOP",
                reason: err.to_string(),
            }),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let receivers: i64 = self
            .run_command("PUBLISH", || {
                let mut cmd = ::redis::cmd("PUBLISH");
                cmd.arg(channel).arg(payload);
                cmd
            })
            .await?;
        debug!(channel, receivers, "Published job update");
        Ok(())
    }

    async fn depth(&self, topic: &str) -> Result<usize, BrokerError> {
        self.run_command("LLEN", || {
            let mut cmd = ::redis::cmd("LLEN");
            cmd.arg(topic);
            cmd
        })
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        *self.connection.lock().await = None;
        self.blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        debug!("Redis broker closed");
        Ok(())
    }
}
