/// Key-value store access for Nexus Deploy
///
/// Wraps a multiplexed Redis connection for the state that lives outside the
/// relational store: OAuth states, bearer revocation entries, analysis
/// caches, and the queue's idempotency guards. Pub/sub uses its own
/// dedicated connection (see `pubsub` and `hub::consumer`).
use crate::error::NexusResult;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

#[derive(Clone)]
pub struct Kv {
    conn: ConnectionManager,
    client: redis::Client,
}

impl Kv {
    /// Connect and verify with a ping
    pub async fn connect(url: &str) -> NexusResult<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone()).await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self { conn, client })
    }

    /// The underlying client, for callers that need a dedicated connection
    /// (pattern subscription, blocking queue pops).
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub async fn get(&self, key: &str) -> NexusResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> NexusResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    /// SET NX EX; returns true when the key was newly set
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> NexusResult<bool> {
        let mut conn = self.conn.clone();
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;
        Ok(set)
    }

    /// DEL; returns the number of keys removed. The return value is the
    /// single-use guarantee for OAuth states: 0 means expired or replayed.
    pub async fn del(&self, key: &str) -> NexusResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.del(key).await?)
    }

    pub async fn exists(&self, key: &str) -> NexusResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> NexusResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    pub async fn lpush(&self, key: &str, value: &str) -> NexusResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    /// BRPOP with a timeout; None when the timeout elapses
    pub async fn brpop(&self, key: &str, timeout: Duration) -> NexusResult<Option<String>> {
        let mut conn = self.conn.clone();
        let res: Option<(String, String)> = conn.brpop(key, timeout.as_secs() as f64).await?;
        Ok(res.map(|(_, v)| v))
    }
}
