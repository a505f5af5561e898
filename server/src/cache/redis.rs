// party_sync/server/src/cache/redis.rs
use super::snapshot::Snapshot;
use super::{Cache, HandlerSet, MessageHandler};
use crate::core::config::{CacheType, RedisConfig};
use crate::core::constants::SUBSCRIBED_CHANNELS;
use crate::core::error::{PartyError, PartyResult};
use crate::operational::monitoring::metrics;
use ::redis::{Client, Commands, Connection, RedisResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared Redis store. Commands go through a small pool of idle
/// connections; a dedicated thread owns the subscription.
pub struct RedisCache {
    client: Client,
    config: RedisConfig,
    idle: Mutex<Vec<Connection>>,
    handlers: Arc<HandlerSet>,
    subscriber_started: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl RedisCache {
    /// Opens the client and checks reachability. An unreachable server is
    /// logged, not fatal: every later call retries the connection.
    pub fn connect(config: RedisConfig) -> PartyResult<Self> {
        let client = Client::open(config.connection_url().as_str())
            .map_err(|e| PartyError::ConfigError(format!("invalid redis settings: {}", e)))?;

        let cache = RedisCache {
            client,
            config,
            idle: Mutex::new(Vec::new()),
            handlers: Arc::new(HandlerSet::new()),
            subscriber_started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        info!("Attempting to connect to Redis at {}:{}", cache.config.host, cache.config.port);
        match cache.with_connection("ping", |conn| ::redis::cmd("PING").query::<String>(conn)) {
            Ok(_) => info!("Connected to Redis."),
            Err(e) => warn!("Redis not reachable yet ({}); synchronization stays local until it is.", e),
        }
        Ok(cache)
    }

    fn open_connection(&self) -> PartyResult<Connection> {
        let timeout = Duration::from_millis(self.config.read_timeout_ms.max(1));
        self.client.get_connection_with_timeout(timeout).map_err(|e| {
            warn!("Could not open Redis connection to {}:{}: {}", self.config.host, self.config.port, e);
            metrics::record_backend_error("connect");
            PartyError::from(e)
        })
    }

    fn with_connection<T>(&self, op: &str, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> PartyResult<T> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.open_connection()?,
        };

        match f(&mut conn) {
            Ok(value) => {
                let mut idle = self.idle.lock();
                if idle.len() < self.config.max_idle_connections {
                    idle.push(conn);
                }
                Ok(value)
            }
            Err(e) => {
                // the connection may be poisoned, let it drop
                warn!("Redis {} failed: {}", op, e);
                metrics::record_backend_error(op);
                Err(e.into())
            }
        }
    }

    fn start_subscriber(&self) -> PartyResult<()> {
        let client = self.client.clone();
        let handlers = self.handlers.clone();
        let shutdown = self.shutdown.clone();
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms.max(1));

        thread::Builder::new()
            .name("party-subscriber".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match listen(&client, &handlers, &shutdown, read_timeout) {
                        Ok(()) => break,
                        Err(e) => {
                            error!("Redis subscription lost: {}. Retrying in {:?}.", e, reconnect_delay);
                            metrics::record_backend_error("subscribe");
                            thread::sleep(reconnect_delay);
                        }
                    }
                }
                debug!("Redis subscriber stopped.");
            })
            .map(|_| ())
            .map_err(|e| PartyError::ThreadingError(format!("failed to spawn redis subscriber: {}", e)))
    }
}

fn listen(client: &Client, handlers: &HandlerSet, shutdown: &AtomicBool, read_timeout: Duration) -> RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.set_read_timeout(Some(read_timeout))?;
    for channel in SUBSCRIBED_CHANNELS {
        pubsub.subscribe(channel)?;
    }
    info!("Subscribed to Redis channels {:?}.", SUBSCRIBED_CHANNELS);

    while !shutdown.load(Ordering::Relaxed) {
        let msg = match pubsub.get_message() {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        };
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping non-text message on '{}': {}", channel, e);
                continue;
            }
        };
        debug!("[REDIS SUB] {} {}", channel, payload);

        handlers.dispatch(&channel, &payload);
    }
    Ok(())
}

/// KEYS treats `*?[]\` as glob syntax.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

impl Cache for RedisCache {
    fn get(&self, key: &str) -> PartyResult<Option<Snapshot>> {
        let raw: Option<String> = self.with_connection("get", |conn| conn.get(key))?;
        raw.map(|json| Snapshot::parse(&json)).transpose()
    }

    fn set(&self, key: &str, snapshot: &Snapshot) -> PartyResult<()> {
        let json = snapshot.to_json()?;
        self.with_connection("set", |conn| conn.set::<_, _, ()>(key, json))
    }

    fn delete(&self, key: &str) -> PartyResult<()> {
        self.with_connection("del", |conn| conn.del::<_, ()>(key))
    }

    fn scan(&self, prefix: &str) -> PartyResult<Vec<Snapshot>> {
        let pattern = escape_glob(prefix);
        let raw: Vec<Option<String>> = self.with_connection("scan", |conn| {
            let keys: Vec<String> = conn.keys(&pattern)?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            ::redis::cmd("MGET").arg(&keys).query(conn)
        })?;

        let mut snapshots = Vec::with_capacity(raw.len());
        // keys deleted between KEYS and MGET come back as nil
        for json in raw.into_iter().flatten() {
            match Snapshot::parse(&json) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping unreadable snapshot under '{}': {}", prefix, e),
            }
        }
        Ok(snapshots)
    }

    fn publish(&self, channel: &str, message: &str) -> PartyResult<()> {
        self.with_connection("publish", |conn| conn.publish::<_, _, ()>(channel, message))
    }

    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> PartyResult<()> {
        self.handlers.add(&handler);
        if !self.subscriber_started.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.start_subscriber() {
                self.subscriber_started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Redis
    }
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
