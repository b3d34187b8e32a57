use crate::storage::KeyValueStore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::borrow::Cow;

/// A [KeyValueStore] kept in Redis.
///
/// Each entry is a plain string key. With a key prefix set, only keys under the prefix are
/// enumerated, measured and evicted, so the rest of the database is left alone.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisStore {
    /// # Examples
    ///
    /// ```no_run
    /// # use analysis_gateway::storage::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).key_prefix(Some("history:")).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }

    /// The stored key without the prefix, or None for a key outside the namespace.
    fn strip_key(&self, key: String) -> Option<String> {
        match &self.key_prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str()).map(ToOwned::to_owned),
            None => Some(key),
        }
    }

    fn match_pattern(&self) -> String {
        format!("{}*", escape_glob(self.key_prefix.as_deref().unwrap_or_default()))
    }
}

/// Escape the characters Redis treats specially in a `MATCH` pattern.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply a prefix to every key, used as a namespace inside a shared Redis instance.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
        }
    }
}

impl KeyValueStore for RedisStore {
    type Error = redis::RedisError;

    async fn list_keys(&self) -> Result<Vec<String>, Self::Error> {
        let mut con = self.connection.clone();
        let mut keys = Vec::new();
        {
            // SCAN rather than KEYS, so a large database is not blocked
            let mut iter = con.scan_match::<_, String>(self.match_pattern()).await?;
            while let Some(key) = iter.next_item().await {
                keys.extend(self.strip_key(key));
            }
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        con.get(key.as_ref()).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = con.set(key.as_ref(), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Self::Error> {
        let key = self.make_key(key);
        let mut con = self.connection.clone();
        let () = con.del(key.as_ref()).await?;
        Ok(())
    }
}
