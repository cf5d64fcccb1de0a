use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Context};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::config::*;
use crate::core::helpers::{hash_password, new_id, now_iso};
use crate::models::{Post, User};

type Documents = BTreeMap<String, Value>;
type Staged = BTreeMap<String, Option<Value>>;

/// A transaction whose watched keys keep changing underneath it gives up
/// after this many attempts.
const MAX_TX_ATTEMPTS: usize = 16;

/// Password given to the demo accounts.
pub const DEMO_PASSWORD: &str = "password123";

/// JSON document store.
///
/// Every document lives under a string key (`user:{id}`, `post:{id}`, ...)
/// and is stored as a JSON string. Every mutation goes through
/// [`Store::transaction`], which stages writes and commits them all-or-nothing.
/// Multi-document updates and read-modify-write toggles are therefore atomic.
///
/// The production backend is Redis: a transaction `WATCH`es every key it
/// reads, commits with `MULTI`/`EXEC`, and runs again when a watched key was
/// changed by someone else. `memory://` selects a process-local map used by
/// tests and local runs.
pub struct Store {
    backend: Backend,
}

enum Backend {
    Redis(redis::Client),
    Memory(RwLock<Documents>),
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(Documents::new())),
        }
    }

    /// Opens a store from a connection string: `redis://host[:port][/db]`,
    /// `rediss://...` or `memory://`. Redis connections are checked with a
    /// `PING` before the store is handed out.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        if url.is_empty() || url == "memory://" {
            tracing::warn!("using the in-memory document store, data is lost on exit");
            return Ok(Self::in_memory());
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(anyhow!("unsupported DATABASE_URL scheme: {url}"));
        }

        let client = redis::Client::open(url).context("parsing DATABASE_URL")?;
        let mut con = connect(&client)?;
        redis::cmd("PING")
            .query::<String>(&mut con)
            .context("pinging redis")?;

        tracing::info!(url = %url, "opened document store");
        Ok(Self {
            backend: Backend::Redis(client),
        })
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match &self.backend {
            Backend::Memory(docs) => decode(key, read(docs)?.get(key)),
            Backend::Redis(client) => {
                let raw: Option<String> = redis::cmd("GET")
                    .arg(key)
                    .query(&mut connect(client)?)
                    .with_context(|| format!("reading {key}"))?;
                parse(key, raw)
            }
        }
    }

    /// Loads several documents in one round trip, skipping missing keys.
    pub fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> anyhow::Result<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = Vec::with_capacity(keys.len());
        match &self.backend {
            Backend::Memory(docs) => {
                let docs = read(docs)?;
                for key in keys {
                    if let Some(doc) = decode(key, docs.get(key))? {
                        found.push(doc);
                    }
                }
            }
            Backend::Redis(client) => {
                let raws: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(keys)
                    .query(&mut connect(client)?)
                    .context("reading documents")?;
                for (key, raw) in keys.iter().zip(raws) {
                    if let Some(doc) = parse(key, raw)? {
                        found.push(doc);
                    }
                }
            }
        }
        Ok(found)
    }

    pub fn exists(&self, key: &str) -> anyhow::Result<bool> {
        match &self.backend {
            Backend::Memory(docs) => Ok(read(docs)?.contains_key(key)),
            Backend::Redis(client) => redis::cmd("EXISTS")
                .arg(key)
                .query(&mut connect(client)?)
                .with_context(|| format!("checking {key}")),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        self.transaction(|tx| tx.set_json(key, value))
    }

    /// Runs `f` against a staged view of the store and commits its writes
    /// only if it returns `Ok`. On Redis `f` runs again whenever a key it read
    /// changed before the commit, so it must not have side effects outside
    /// the transaction.
    pub fn transaction<R, E, F>(&self, mut f: F) -> Result<R, E>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<R, E>,
        E: From<anyhow::Error>,
    {
        match &self.backend {
            Backend::Memory(docs) => {
                let mut docs = write(docs)?;
                let mut tx = Transaction::new(Source::Memory(&*docs));
                let result = f(&mut tx)?;
                let staged = tx.staged;

                for (key, value) in staged {
                    match value {
                        Some(v) => docs.insert(key, v),
                        None => docs.remove(&key),
                    };
                }
                Ok(result)
            }
            Backend::Redis(client) => {
                // Watches belong to the connection, so each transaction gets its own.
                let mut con = connect(client)?;

                for attempt in 1..=MAX_TX_ATTEMPTS {
                    let mut tx = Transaction::new(Source::Redis(&mut con));
                    let result = f(&mut tx)?;
                    let staged = tx.staged;

                    if staged.is_empty() || commit(&mut con, staged)? {
                        return Ok(result);
                    }
                    tracing::debug!(attempt, "watched key changed, retrying transaction");
                }

                Err(anyhow!("transaction aborted after {MAX_TX_ATTEMPTS} attempts").into())
            }
        }
    }

    /// Number of documents.
    pub fn len(&self) -> anyhow::Result<usize> {
        match &self.backend {
            Backend::Memory(docs) => Ok(read(docs)?.len()),
            Backend::Redis(client) => redis::cmd("DBSIZE")
                .query(&mut connect(client)?)
                .context("counting documents"),
        }
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }
}

enum Source<'a> {
    Memory(&'a Documents),
    Redis(&'a mut redis::Connection),
}

/// Staged view handed to [`Store::transaction`] closures. Reads see the
/// transaction's own writes.
pub struct Transaction<'a> {
    source: Source<'a>,
    staged: Staged,
}

impl<'a> Transaction<'a> {
    fn new(source: Source<'a>) -> Self {
        Self {
            source,
            staged: Staged::new(),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> anyhow::Result<Option<T>> {
        if let Some(staged) = self.staged.get(key) {
            return decode(key, staged.as_ref());
        }
        match &mut self.source {
            Source::Memory(docs) => decode(key, docs.get(key)),
            Source::Redis(con) => {
                watch(con, key)?;
                let raw: Option<String> = redis::cmd("GET")
                    .arg(key)
                    .query(&mut **con)
                    .with_context(|| format!("reading {key}"))?;
                parse(key, raw)
            }
        }
    }

    pub fn exists(&mut self, key: &str) -> anyhow::Result<bool> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.is_some());
        }
        match &mut self.source {
            Source::Memory(docs) => Ok(docs.contains_key(key)),
            Source::Redis(con) => {
                watch(con, key)?;
                redis::cmd("EXISTS")
                    .arg(key)
                    .query(&mut **con)
                    .with_context(|| format!("checking {key}"))
            }
        }
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value).with_context(|| format!("encoding {key}"))?;
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    /// Loads a JSON list document, treating a missing key as empty.
    pub fn get_list(&mut self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.get_json(key)?.unwrap_or_default())
    }
}

fn read(docs: &RwLock<Documents>) -> anyhow::Result<RwLockReadGuard<'_, Documents>> {
    docs.read().map_err(|_| anyhow!("document store lock poisoned"))
}

fn write(docs: &RwLock<Documents>) -> anyhow::Result<RwLockWriteGuard<'_, Documents>> {
    docs.write().map_err(|_| anyhow!("document store lock poisoned"))
}

fn connect(client: &redis::Client) -> anyhow::Result<redis::Connection> {
    client.get_connection().context("connecting to redis")
}

fn watch(con: &mut redis::Connection, key: &str) -> anyhow::Result<()> {
    redis::cmd("WATCH")
        .arg(key)
        .query::<()>(con)
        .with_context(|| format!("watching {key}"))
}

/// Applies staged writes in one `MULTI`/`EXEC`. Returns `false` when a
/// watched key changed and nothing was written.
fn commit(con: &mut redis::Connection, staged: Staged) -> anyhow::Result<bool> {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for (key, value) in staged {
        match value {
            Some(v) => pipe.set(key, v.to_string()).ignore(),
            None => pipe.del(key).ignore(),
        };
    }

    let committed: Option<()> = pipe.query(con).context("committing transaction")?;
    Ok(committed.is_some())
}

fn decode<T: DeserializeOwned>(key: &str, value: Option<&Value>) -> anyhow::Result<Option<T>> {
    value
        .map(|v| T::deserialize(v).with_context(|| format!("decoding {key}")))
        .transpose()
}

fn parse<T: DeserializeOwned>(key: &str, raw: Option<String>) -> anyhow::Result<Option<T>> {
    raw.map(|r| serde_json::from_str(&r).with_context(|| format!("decoding {key}")))
        .transpose()
}

/// Seeds a few demo accounts and posts. Does nothing once `test` exists.
/// Every account's password is [`DEMO_PASSWORD`].
pub fn init_test_data(store: &Store) -> anyhow::Result<()> {
    let demo = [
        ("test", "test@example.com", "This is my first post!"),
        ("alice", "alice@example.com", "Welcome to my corner. Excited to share thoughts here."),
        ("bob", "bob@example.com", "Hey everyone! Just joined, looking forward to connecting."),
    ];
    if store.exists(&username_key("test"))? {
        return Ok(());
    }
    let hashes = demo
        .iter()
        .map(|_| hash_password(DEMO_PASSWORD))
        .collect::<anyhow::Result<Vec<_>>>()?;

    store.transaction(|tx| {
        if tx.exists(&username_key("test"))? {
            return Ok::<_, anyhow::Error>(());
        }

        let mut users = tx.get_list(USERS_LIST_KEY)?;
        let mut feed = tx.get_list(FEED_KEY)?;
        let mut seeded = Vec::new();

        for (&(username, email, content), password) in demo.iter().zip(&hashes) {
            let user_id = new_id();
            let user = User {
                id: user_id.clone(),
                username: username.to_string(),
                email: email.to_string(),
                password: password.clone(),
                avatar: None,
                followers: Vec::new(),
                following: Vec::new(),
                created_at: now_iso(),
            };
            tx.set_json(&user_key(&user_id), &user)?;
            tx.set_json(&username_key(username), &user_id)?;
            tx.set_json(&email_key(email), &user_id)?;
            users.push(user_id.clone());

            let post = Post::new(&user_id, content.to_string(), None);
            tx.set_json(&post_key(&post.id), &post)?;
            feed.insert(0, post.id);

            seeded.push(user);
        }

        // "test" follows "bob"
        if let [test, _, bob] = seeded.as_mut_slice() {
            test.following.push(bob.id.clone());
            bob.followers.push(test.id.clone());
            tx.set_json(&user_key(&test.id), &*test)?;
            tx.set_json(&user_key(&bob.id), &*bob)?;
        }

        tx.set_json(USERS_LIST_KEY, &users)?;
        tx.set_json(FEED_KEY, &feed)?;
        tracing::info!("seeded demo users test, alice and bob");
        Ok(())
    })
}
