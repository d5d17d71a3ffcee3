//! The client facade (spec §2 component G): combines the hash ring, the
//! per-server connection pools, the wire codec and the worker pool into
//! the public get/set/add/replace/delete/incr/decr/append/prepend API
//! plus their multi forms and the per-server fan-out operations.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{Error, Status};
use crate::flags::{Compressor, LoadValue, NoCompressor, StoreValue};
use crate::multi;
use crate::pool::{ConnectionPool, DEFAULT_MAX_IDLE};
use crate::ring::{Endpoint, Ring};
use crate::wire::{Extras, Opcode, Packet};
use crate::worker::WorkerPool;

/// Constructor configuration (spec §6): a plain struct plus a
/// constructor, not a builder.
pub struct ClientConfig {
    /// `"host:port"` strings. Port defaults to [`crate::DEFAULT_PORT`]
    /// when `":"` is absent.
    pub host_list: Vec<String>,
    /// Idle connections kept per server pool.
    pub max_idle: usize,
    /// Worker pool size. Defaults to `host_list.len()`.
    pub max_threads: Option<usize>,
    /// Virtual replicas per server on the ring.
    pub ch_replicas: usize,
    /// Optional value compressor. `encode_fn`/`decode_fn` from spec §6 are
    /// the [`StoreValue`]/[`LoadValue`] traits themselves, picked by the
    /// caller at the call site rather than injected here.
    pub compressor: Arc<dyn Compressor>,
}

impl ClientConfig {
    pub fn new(host_list: Vec<String>) -> Self {
        ClientConfig {
            host_list,
            max_idle: DEFAULT_MAX_IDLE,
            max_threads: None,
            ch_replicas: crate::ring::DEFAULT_REPLICAS,
            compressor: Arc::new(NoCompressor),
        }
    }
}

fn normalize_host(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, crate::DEFAULT_PORT)
    }
}

/// A sharded memcached client. Generic over the transport so this crate
/// never depends on a specific async runtime; `shardmc-tokio` supplies
/// the concrete [`Connection`].
pub struct Client<C: Connection> {
    ring: Ring,
    pools: HashMap<Endpoint, Arc<ConnectionPool<C>>>,
    compressor: Arc<dyn Compressor>,
    workers: WorkerPool,
}

impl<C: Connection> Client<C> {
    pub fn new(config: ClientConfig) -> Self {
        let mut ring = Ring::new(config.ch_replicas);
        let mut pools = HashMap::new();
        for host in &config.host_list {
            let endpoint: Endpoint = Arc::from(normalize_host(host));
            ring.add(endpoint.to_string());
            pools
                .entry(endpoint.clone())
                .or_insert_with(|| ConnectionPool::new(endpoint.clone(), config.max_idle));
        }
        let workers = WorkerPool::new(config.max_threads.unwrap_or_else(|| config.host_list.len()));
        Client { ring, pools, compressor: config.compressor, workers }
    }

    fn encode_key(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        if key.len() > crate::MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        Ok(key.to_vec())
    }

    fn endpoint_for(&self, key: &[u8], hashkey: Option<&[u8]>) -> Result<Endpoint, Error> {
        let target = hashkey.unwrap_or(key);
        self.ring
            .lookup(target)
            .ok_or_else(|| Error::status(Status::InternalError, "no servers registered"))
    }

    fn pool_for(&self, endpoint: &Endpoint) -> &Arc<ConnectionPool<C>> {
        self.pools.get(endpoint).expect("every ring endpoint has a pool")
    }

    fn clear_all_pools(&self) {
        for pool in self.pools.values() {
            pool.clear();
        }
    }

    /// Run `f`, and on a connection-closed error clear every pool and run
    /// it once more (spec §4.5/§9, the corrected `reconnect` semantics:
    /// clear ALL pools, retry exactly once, narrowed to the
    /// connection-closed error kind only).
    async fn with_retry<'a, T>(&'a self, f: impl Fn() -> BoxFuture<'a, Result<T, Error>>) -> Result<T, Error> {
        match f().await {
            Err(e) if e.is_connection_closed() => {
                log::warn!("stale connection detected, clearing all pools and retrying once");
                self.clear_all_pools();
                f().await
            }
            other => other,
        }
    }

    /// Send one request on one connection and read the one response it
    /// produces (spec §2 component D's data flow).
    async fn send(
        &self,
        endpoint: &Endpoint,
        opcode: Opcode,
        key: &[u8],
        extras: Extras,
        value: &[u8],
        cas: u64,
    ) -> Result<Packet, Error> {
        let pool = self.pool_for(endpoint);
        let mut conn = pool.acquire().await?;
        let packet = Packet::request(opcode, key, extras, value, 0, cas);
        if let Err(e) = conn.write_all(&packet.to_bytes()).await {
            conn.discard();
            return Err(e);
        }
        match multi::read_frame(&mut *conn).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                conn.discard();
                Err(e)
            }
        }
    }

    // ---- single-op engine (spec §4.4) ----

    pub async fn get<V: LoadValue>(&self, key: &[u8]) -> Result<Option<(V, u64)>, Error> {
        self.with_retry(|| Box::pin(self.get_once(key))).await
    }

    async fn get_once<V: LoadValue>(&self, key: &[u8]) -> Result<Option<(V, u64)>, Error> {
        let key = self.encode_key(key)?;
        let endpoint = self.endpoint_for(&key, None)?;
        let resp = self.send(&endpoint, Opcode::Get, &key, Extras::None, &[], 0).await?;
        match resp.header.status {
            0 => {
                let flags = Extras::store_flags(&resp.extras);
                let value = V::load(resp.value, flags, self.compressor.as_ref())?;
                Ok(Some((value, resp.header.cas)))
            }
            0x01 => Ok(None),
            code => Err(Error::status(Status::from(code), resp.value)),
        }
    }

    pub async fn set<V: StoreValue + Sync>(&self, key: &[u8], value: &V, expire: u32, cas: Option<u64>) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.store_once(Opcode::Set, key, value, expire, cas.unwrap_or(0))))
            .await
    }

    pub async fn add<V: StoreValue + Sync>(&self, key: &[u8], value: &V, expire: u32) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.store_once(Opcode::Add, key, value, expire, 0))).await
    }

    pub async fn replace<V: StoreValue + Sync>(&self, key: &[u8], value: &V, expire: u32, cas: Option<u64>) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.store_once(Opcode::Replace, key, value, expire, cas.unwrap_or(0))))
            .await
    }

    /// Shared by set/add/replace (spec §4.4), but each opcode has its own
    /// soft-failure set rather than one shared predicate: SET is a soft
    /// false on `item-not-stored` or `key-exists`, ADD only on
    /// `key-exists`, REPLACE on `key-not-found` or `key-exists`. A CAS
    /// mismatch arrives as `key-exists` and falls into whichever of those
    /// sets already carries it. Anything else raises.
    async fn store_once<V: StoreValue + Sync>(
        &self,
        opcode: Opcode,
        key: &[u8],
        value: &V,
        expire: u32,
        cas: u64,
    ) -> Result<bool, Error> {
        let key = self.encode_key(key)?;
        let (flags, bytes) = value.store(self.compressor.as_ref())?;
        let endpoint = self.endpoint_for(&key, None)?;
        let extras = Extras::Store { flags, expire };
        let resp = self.send(&endpoint, opcode, &key, extras, &bytes, cas).await?;
        let soft_failure: &[u16] = match opcode {
            Opcode::Set => &[0x02, 0x05],
            Opcode::Add => &[0x02],
            Opcode::Replace => &[0x01, 0x02],
            _ => unreachable!("store_once is only called for Set/Add/Replace"),
        };
        match resp.header.status {
            0 => Ok(true),
            code if soft_failure.contains(&code) => Ok(false),
            code => Err(Error::status(Status::from(code), resp.value)),
        }
    }

    pub async fn delete(&self, key: &[u8], cas: Option<u64>) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.delete_once(key, cas.unwrap_or(0)))).await
    }

    async fn delete_once(&self, key: &[u8], cas: u64) -> Result<bool, Error> {
        let key = self.encode_key(key)?;
        let endpoint = self.endpoint_for(&key, None)?;
        let resp = self.send(&endpoint, Opcode::Delete, &key, Extras::None, &[], cas).await?;
        match resp.header.status {
            0 => Ok(true),
            0x01 | 0x02 => Ok(false),
            code => Err(Error::status(Status::from(code), resp.value)),
        }
    }

    pub async fn incr(&self, key: &[u8], delta: u64, initial: u64, expire: u32) -> Result<u64, Error> {
        self.with_retry(|| Box::pin(self.incr_decr_once(Opcode::Increment, key, delta, initial, expire)))
            .await
    }

    pub async fn decr(&self, key: &[u8], delta: u64, initial: u64, expire: u32) -> Result<u64, Error> {
        self.with_retry(|| Box::pin(self.incr_decr_once(Opcode::Decrement, key, delta, initial, expire)))
            .await
    }

    async fn incr_decr_once(&self, opcode: Opcode, key: &[u8], delta: u64, initial: u64, expire: u32) -> Result<u64, Error> {
        let key = self.encode_key(key)?;
        let endpoint = self.endpoint_for(&key, None)?;
        let extras = Extras::IncrDecr { delta, initial, expire };
        let resp = self.send(&endpoint, opcode, &key, extras, &[], 0).await?;
        if resp.header.status != 0 {
            return Err(Error::status(Status::from(resp.header.status), resp.value));
        }
        if resp.value.len() != 8 {
            return Err(Error::status(Status::InvalidArguments, "incr/decr response body was not 8 bytes"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&resp.value);
        Ok(u64::from_be_bytes(buf))
    }

    pub async fn append(&self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.append_prepend_once(Opcode::Append, key, value))).await
    }

    pub async fn prepend(&self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.with_retry(|| Box::pin(self.append_prepend_once(Opcode::Prepend, key, value))).await
    }

    /// Append/prepend values are sent as raw bytes with flags 0: they are
    /// never passed through [`StoreValue`] (spec §4.4). Only
    /// `item-not-stored` is a soft failure here; a missing key raises
    /// rather than returning `false`.
    async fn append_prepend_once(&self, opcode: Opcode, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        let key = self.encode_key(key)?;
        let endpoint = self.endpoint_for(&key, None)?;
        let resp = self.send(&endpoint, opcode, &key, Extras::None, value, 0).await?;
        match resp.header.status {
            0 => Ok(true),
            0x05 => Ok(false),
            code => Err(Error::status(Status::from(code), resp.value)),
        }
    }

    // ---- per-server fan-out (spec §4.4) ----

    pub async fn noop(&self) -> Result<(), Error> {
        for endpoint in self.ring.all() {
            self.send(endpoint, Opcode::Noop, &[], Extras::None, &[], 0).await?;
        }
        Ok(())
    }

    pub async fn quit(&self) -> Result<(), Error> {
        for endpoint in self.ring.all() {
            self.send(endpoint, Opcode::Quit, &[], Extras::None, &[], 0).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&self, expire: u32) -> Result<(), Error> {
        for endpoint in self.ring.all() {
            self.send(endpoint, Opcode::Flush, &[], Extras::Flush { expire }, &[], 0).await?;
        }
        Ok(())
    }

    pub async fn version(&self) -> Result<HashMap<String, String>, Error> {
        let mut out = HashMap::with_capacity(self.ring.all().len());
        for endpoint in self.ring.all() {
            let resp = self.send(endpoint, Opcode::Version, &[], Extras::None, &[], 0).await?;
            out.insert(endpoint.to_string(), String::from_utf8_lossy(&resp.value).into_owned());
        }
        Ok(out)
    }

    /// Per-server `STAT`, terminated by a zero-length-key frame (spec
    /// §4.4), aggregated into a mapping keyed by `"host:port"`.
    pub async fn stats(&self) -> Result<HashMap<String, HashMap<String, String>>, Error> {
        let mut out = HashMap::with_capacity(self.ring.all().len());
        for endpoint in self.ring.all() {
            let pool = self.pool_for(endpoint);
            let mut conn = pool.acquire().await?;
            let packet = Packet::request(Opcode::Stat, &[], Extras::None, &[], 0, 0);
            if let Err(e) = conn.write_all(&packet.to_bytes()).await {
                conn.discard();
                return Err(e);
            }
            let mut entries = HashMap::new();
            loop {
                let resp = match multi::read_frame(&mut *conn).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        conn.discard();
                        return Err(e);
                    }
                };
                if resp.key.is_empty() {
                    break;
                }
                entries.insert(
                    String::from_utf8_lossy(&resp.key).into_owned(),
                    String::from_utf8_lossy(&resp.value).into_owned(),
                );
            }
            out.insert(endpoint.to_string(), entries);
        }
        Ok(out)
    }

    /// Calls `quit()` then drops every pool's idle connections, swallowing
    /// any error `quit()` raised (spec §9: tolerate either ordering, never
    /// surface errors from `close`).
    pub async fn close(&self) {
        if let Err(e) = self.quit().await {
            log::warn!("quit during close failed, continuing anyway: {}", e);
        }
        self.clear_all_pools();
    }

    // ---- multi-op engine (spec §4.5, §2 component E) ----

    pub async fn get_multi<V: LoadValue>(
        &self,
        keys: &[&[u8]],
        hashkey: Option<&[u8]>,
    ) -> Result<HashMap<Vec<u8>, (V, u64)>, Error> {
        let encoded: Vec<Vec<u8>> = keys.iter().map(|k| self.encode_key(k)).collect::<Result<_, _>>()?;
        let refs: Vec<&[u8]> = encoded.iter().map(|k| k.as_slice()).collect();
        let groups = multi::group_by_ring(&self.ring, &refs, hashkey)?;

        let all_pools: Vec<Arc<ConnectionPool<C>>> = self.pools.values().cloned().collect();
        let raw: Arc<Mutex<HashMap<Vec<u8>, (Vec<u8>, u32, u64)>>> = Arc::new(Mutex::new(HashMap::new()));
        let error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        for (endpoint, group_keys) in groups {
            let pool = self.pool_for(&endpoint).clone();
            for chunk in multi::chunk_keys(&group_keys, multi::CHUNK_SIZE) {
                let owned: Vec<Vec<u8>> = chunk.iter().map(|k| k.to_vec()).collect();
                let raw = raw.clone();
                let error = error.clone();
                let pool = pool.clone();
                let all_pools = all_pools.clone();
                self.workers.submit(async move {
                    match run_get_chunk_with_retry(pool, &all_pools, owned).await {
                        Ok(found) => raw.lock().extend(found),
                        Err(e) => {
                            log::error!("get_multi chunk failed: {}", e);
                            *error.lock() = Some(e);
                        }
                    }
                });
            }
        }
        self.workers.wait().await;

        if let Some(e) = Arc::try_unwrap(error).expect("all workers joined before unwrap").into_inner() {
            return Err(e);
        }
        let raw = Arc::try_unwrap(raw).expect("all workers joined before unwrap").into_inner();
        let mut out = HashMap::with_capacity(raw.len());
        for (key, (bytes, flags, cas)) in raw {
            let value = V::load(bytes, flags, self.compressor.as_ref())?;
            out.insert(key, (value, cas));
        }
        Ok(out)
    }

    pub async fn set_multi<V: StoreValue>(
        &self,
        items: &HashMap<Vec<u8>, V>,
        expire: u32,
        hashkey: Option<&[u8]>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        self.store_multi(Opcode::SetQ, Opcode::Set, items, expire, hashkey).await
    }

    pub async fn add_multi<V: StoreValue>(
        &self,
        items: &HashMap<Vec<u8>, V>,
        expire: u32,
        hashkey: Option<&[u8]>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        self.store_multi(Opcode::AddQ, Opcode::Add, items, expire, hashkey).await
    }

    pub async fn replace_multi<V: StoreValue>(
        &self,
        items: &HashMap<Vec<u8>, V>,
        expire: u32,
        hashkey: Option<&[u8]>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        self.store_multi(Opcode::ReplaceQ, Opcode::Replace, items, expire, hashkey).await
    }

    /// Shared by set_multi/add_multi/replace_multi: unlike the single-op
    /// forms, ANY non-zero status is a failure here (spec §4.5), matching
    /// `pymemc`'s multi helpers, which all pass `status != no_error` as
    /// their failure test regardless of opcode.
    async fn store_multi<V: StoreValue>(
        &self,
        quiet: Opcode,
        loud: Opcode,
        items: &HashMap<Vec<u8>, V>,
        expire: u32,
        hashkey: Option<&[u8]>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mut by_key: HashMap<Vec<u8>, (Extras, Vec<u8>)> = HashMap::with_capacity(items.len());
        for (key, value) in items {
            let key = self.encode_key(key)?;
            let (flags, bytes) = value.store(self.compressor.as_ref())?;
            by_key.insert(key, (Extras::Store { flags, expire }, bytes));
        }
        let key_refs: Vec<&[u8]> = by_key.keys().map(|k| k.as_slice()).collect();
        let groups = multi::group_by_ring(&self.ring, &key_refs, hashkey)?;

        let all_pools: Vec<Arc<ConnectionPool<C>>> = self.pools.values().cloned().collect();
        let failures: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        for (endpoint, group_keys) in groups {
            let pool = self.pool_for(&endpoint).clone();
            for chunk in multi::chunk_keys(&group_keys, multi::CHUNK_SIZE) {
                let chunk_items: Vec<(Vec<u8>, Extras, Vec<u8>)> = chunk
                    .iter()
                    .map(|k| {
                        let (extras, bytes) = &by_key[*k];
                        (k.to_vec(), extras.clone(), bytes.clone())
                    })
                    .collect();
                let failures = failures.clone();
                let error = error.clone();
                let pool = pool.clone();
                let all_pools = all_pools.clone();
                self.workers.submit(async move {
                    if let Err(e) = run_group_chunk_with_retry(pool, &all_pools, quiet, loud, chunk_items, failures).await {
                        log::error!("multi-op chunk failed: {}", e);
                        *error.lock() = Some(e);
                    }
                });
            }
        }
        self.workers.wait().await;
        if let Some(e) = Arc::try_unwrap(error).expect("all workers joined before unwrap").into_inner() {
            return Err(e);
        }
        Ok(Arc::try_unwrap(failures).expect("all workers joined before unwrap").into_inner())
    }

    pub async fn delete_multi(&self, keys: &[&[u8]], hashkey: Option<&[u8]>) -> Result<Vec<Vec<u8>>, Error> {
        let encoded: Vec<Vec<u8>> = keys.iter().map(|k| self.encode_key(k)).collect::<Result<_, _>>()?;
        let refs: Vec<&[u8]> = encoded.iter().map(|k| k.as_slice()).collect();
        let groups = multi::group_by_ring(&self.ring, &refs, hashkey)?;

        let all_pools: Vec<Arc<ConnectionPool<C>>> = self.pools.values().cloned().collect();
        let failures: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        for (endpoint, group_keys) in groups {
            let pool = self.pool_for(&endpoint).clone();
            for chunk in multi::chunk_keys(&group_keys, multi::CHUNK_SIZE) {
                let items: Vec<(Vec<u8>, Extras, Vec<u8>)> =
                    chunk.iter().map(|k| (k.to_vec(), Extras::None, Vec::new())).collect();
                let failures = failures.clone();
                let error = error.clone();
                let pool = pool.clone();
                let all_pools = all_pools.clone();
                self.workers.submit(async move {
                    if let Err(e) =
                        run_group_chunk_with_retry(pool, &all_pools, Opcode::DeleteQ, Opcode::Delete, items, failures).await
                    {
                        log::error!("delete_multi chunk failed: {}", e);
                        *error.lock() = Some(e);
                    }
                });
            }
        }
        self.workers.wait().await;
        if let Some(e) = Arc::try_unwrap(error).expect("all workers joined before unwrap").into_inner() {
            return Err(e);
        }
        Ok(Arc::try_unwrap(failures).expect("all workers joined before unwrap").into_inner())
    }
}

/// The multi-op analogue of `Client::with_retry`: a worker task is spawned
/// with `'static` bounds and so cannot borrow `&self`, hence a free
/// function taking an owned snapshot of every pool instead. On a
/// connection-closed error it clears all of them and retries the chunk
/// once.
async fn run_get_chunk_with_retry<C: Connection>(
    pool: Arc<ConnectionPool<C>>,
    all_pools: &[Arc<ConnectionPool<C>>],
    keys: Vec<Vec<u8>>,
) -> Result<Vec<(Vec<u8>, (Vec<u8>, u32, u64))>, Error> {
    match run_get_chunk(pool.clone(), keys.clone()).await {
        Err(e) if e.is_connection_closed() => {
            log::warn!("stale connection in a get_multi chunk, clearing all pools and retrying once");
            for p in all_pools {
                p.clear();
            }
            run_get_chunk(pool, keys).await
        }
        other => other,
    }
}

/// One per-server chunk of a `get_multi`: pipeline GETQ...GET, and collect
/// the keys that came back with a no-error status.
async fn run_get_chunk<C: Connection>(
    pool: Arc<ConnectionPool<C>>,
    keys: Vec<Vec<u8>>,
) -> Result<Vec<(Vec<u8>, (Vec<u8>, u32, u64))>, Error> {
    let mut conn = pool.acquire().await?;
    let items: Vec<(Vec<u8>, Extras, Vec<u8>)> =
        keys.iter().map(|k| (k.clone(), Extras::None, Vec::new())).collect();
    let packets = multi::build_pipeline(Opcode::GetQ, Opcode::Get, &items);
    let last_opaque = (keys.len() - 1) as u32;
    if let Err(e) = multi::write_pipeline(&mut *conn, &packets).await {
        conn.discard();
        return Err(e);
    }
    let responses = match multi::read_until_opaque(&mut *conn, last_opaque).await {
        Ok(r) => r,
        Err(e) => {
            conn.discard();
            return Err(e);
        }
    };
    let mut found = Vec::new();
    for resp in responses {
        if resp.header.status == 0 {
            if let Some(key) = keys.get(resp.header.opaque as usize) {
                let flags = Extras::store_flags(&resp.extras);
                found.push((key.clone(), (resp.value, flags, resp.header.cas)));
            }
        }
    }
    Ok(found)
}

/// Same clear-all-pools-and-retry-once policy as
/// [`run_get_chunk_with_retry`], for the set/add/replace/delete-multi
/// chunk runner. Safe to retry wholesale: `run_group_chunk` only records
/// into `failures` after a full pipeline round-trip succeeds, so a
/// connection-closed error always happens before anything is recorded.
async fn run_group_chunk_with_retry<C: Connection>(
    pool: Arc<ConnectionPool<C>>,
    all_pools: &[Arc<ConnectionPool<C>>],
    quiet: Opcode,
    loud: Opcode,
    items: Vec<(Vec<u8>, Extras, Vec<u8>)>,
    failures: Arc<Mutex<Vec<Vec<u8>>>>,
) -> Result<(), Error> {
    match run_group_chunk(pool.clone(), quiet, loud, items.clone(), failures.clone()).await {
        Err(e) if e.is_connection_closed() => {
            log::warn!("stale connection in a multi-op chunk, clearing all pools and retrying once");
            for p in all_pools {
                p.clear();
            }
            run_group_chunk(pool, quiet, loud, items, failures).await
        }
        other => other,
    }
}

/// One per-server chunk of a set/add/replace/delete-multi: pipeline
/// quiet...loud, and collect the keys whose response carried a non-zero
/// status into `failures` (spec §4.5).
async fn run_group_chunk<C: Connection>(
    pool: Arc<ConnectionPool<C>>,
    quiet: Opcode,
    loud: Opcode,
    items: Vec<(Vec<u8>, Extras, Vec<u8>)>,
    failures: Arc<Mutex<Vec<Vec<u8>>>>,
) -> Result<(), Error> {
    let mut conn = pool.acquire().await?;
    let packets = multi::build_pipeline(quiet, loud, &items);
    let last_opaque = (items.len() - 1) as u32;
    if let Err(e) = multi::write_pipeline(&mut *conn, &packets).await {
        conn.discard();
        return Err(e);
    }
    let responses = match multi::read_until_opaque(&mut *conn, last_opaque).await {
        Ok(r) => r,
        Err(e) => {
            conn.discard();
            return Err(e);
        }
    };
    let mut guard = failures.lock();
    for resp in responses {
        if resp.header.status != 0 {
            if let Some((key, _, _)) = items.get(resp.header.opaque as usize) {
                guard.push(key.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// An in-memory stand-in for a TCP connection: one per (test, server),
    /// it understands just enough of the wire protocol to answer GET/SET/
    /// DELETE/NOOP/VERSION so the client facade can be exercised without a
    /// live memcached.
    #[derive(Default)]
    struct FakeConnection {
        store: HashMap<Vec<u8>, (u32, Vec<u8>)>,
        inbox: Vec<u8>,
        outbox: VecDeque<u8>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn connect(_endpoint: &str) -> Result<Self, Error> {
            Ok(FakeConnection::default())
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let n = buf.len().min(self.outbox.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.outbox.pop_front().unwrap();
            }
            Ok(n)
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
            self.inbox.extend_from_slice(buf);
            self.drain_requests();
            Ok(())
        }
    }

    impl FakeConnection {
        fn drain_requests(&mut self) {
            loop {
                if self.inbox.len() < crate::wire::HEADER_LEN {
                    return;
                }
                let header = crate::wire::Header::parse_response(&self.inbox[..crate::wire::HEADER_LEN]).unwrap();
                let total = crate::wire::HEADER_LEN + header.body_len as usize;
                if self.inbox.len() < total {
                    return;
                }
                let body = self.inbox[crate::wire::HEADER_LEN..total].to_vec();
                self.inbox.drain(..total);
                self.handle_one(header, body);
            }
        }

        fn handle_one(&mut self, header: crate::wire::Header, body: Vec<u8>) {
            let packet = Packet::from_response(header, &body).unwrap();
            let opcode = packet.header.opcode;
            let is_quiet = matches!(opcode, 0x09 | 0x11 | 0x12 | 0x13 | 0x14);
            let is_get = matches!(opcode, 0x00 | 0x09);

            let (status, extras, value): (u16, Vec<u8>, Vec<u8>) = match opcode {
                0x00 | 0x09 => match self.store.get(&packet.key) {
                    Some((flags, value)) => (0, flags.to_be_bytes().to_vec(), value.clone()),
                    None => (0x01, Vec::new(), Vec::new()),
                },
                0x01 | 0x11 => {
                    let flags = Extras::store_flags(&packet.extras);
                    self.store.insert(packet.key.clone(), (flags, packet.value.clone()));
                    (0, Vec::new(), Vec::new())
                }
                0x02 | 0x12 => {
                    if self.store.contains_key(&packet.key) {
                        (0x02, Vec::new(), Vec::new())
                    } else {
                        let flags = Extras::store_flags(&packet.extras);
                        self.store.insert(packet.key.clone(), (flags, packet.value.clone()));
                        (0, Vec::new(), Vec::new())
                    }
                }
                0x04 | 0x14 => {
                    if self.store.remove(&packet.key).is_some() {
                        (0, Vec::new(), Vec::new())
                    } else {
                        (0x01, Vec::new(), Vec::new())
                    }
                }
                0x0a => (0, Vec::new(), Vec::new()),
                0x0b => (0, Vec::new(), b"1.0.0-fake".to_vec()),
                _ => (0x81, Vec::new(), Vec::new()),
            };

            // GETQ suppresses a response on a miss; the quiet mutation
            // opcodes suppress a response on success (spec §4.5).
            let suppress = is_quiet && if is_get { status == 0x01 } else { status == 0 };
            if suppress {
                return;
            }

            let response = Packet {
                header: crate::wire::Header {
                    magic: crate::wire::MAGIC_RESPONSE,
                    opcode,
                    key_len: 0,
                    extras_len: extras.len() as u8,
                    data_type: 0,
                    status,
                    body_len: (extras.len() + value.len()) as u32,
                    opaque: packet.header.opaque,
                    cas: 0,
                },
                extras,
                key: Vec::new(),
                value,
            };
            self.outbox.extend(response.to_bytes());
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new(vec!["fake:11211".to_string()])
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let client: Client<FakeConnection> = Client::new(config());
        assert!(client.set(b"foo", &b"bar".to_vec(), 0, None).await.unwrap());
        let (value, _cas): (Vec<u8>, u64) = client.get(b"foo").await.unwrap().unwrap();
        assert_eq!(value, b"bar");
    }

    #[tokio::test]
    async fn get_on_a_missing_key_returns_none() {
        let client: Client<FakeConnection> = Client::new(config());
        let found: Option<(Vec<u8>, u64)> = client.get(b"missing").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn add_on_an_existing_key_is_a_soft_false() {
        let client: Client<FakeConnection> = Client::new(config());
        assert!(client.add(b"k", &b"v".to_vec(), 0).await.unwrap());
        assert!(!client.add(b"k", &b"v2".to_vec(), 0).await.unwrap());
    }

    #[tokio::test]
    async fn delete_then_delete_again_is_true_then_false() {
        let client: Client<FakeConnection> = Client::new(config());
        client.set(b"k", &b"v".to_vec(), 0, None).await.unwrap();
        assert!(client.delete(b"k", None).await.unwrap());
        assert!(!client.delete(b"k", None).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_key_is_rejected_before_any_io() {
        let client: Client<FakeConnection> = Client::new(config());
        let key = vec![0u8; crate::MAX_KEY_SIZE + 1];
        let err = client.get::<Vec<u8>>(&key).await.unwrap_err();
        assert!(matches!(err, Error::KeyTooLarge(_)));
    }

    #[tokio::test]
    async fn set_multi_then_get_multi_round_trips() {
        let client: Client<FakeConnection> = Client::new(config());
        let mut items: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        items.insert(b"a".to_vec(), b"1".to_vec());
        items.insert(b"b".to_vec(), b"2".to_vec());
        items.insert(b"c".to_vec(), b"3".to_vec());

        let failures = client.set_multi(&items, 0, None).await.unwrap();
        assert!(failures.is_empty());

        let keys: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
        let found: HashMap<Vec<u8>, (Vec<u8>, u64)> = client.get_multi(&keys, None).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[&b"a".to_vec()].0, b"1");
        assert!(!found.contains_key(&b"d".to_vec()));
    }

    #[tokio::test]
    async fn delete_multi_reports_missing_keys_as_failures() {
        let client: Client<FakeConnection> = Client::new(config());
        let keys: Vec<&[u8]> = vec![b"never-set-1", b"never-set-2"];
        let mut failures = client.delete_multi(&keys, None).await.unwrap();
        failures.sort();
        assert_eq!(failures, vec![b"never-set-1".to_vec(), b"never-set-2".to_vec()]);
    }

    #[tokio::test]
    async fn noop_and_version_fan_out_to_every_server() {
        let client: Client<FakeConnection> = Client::new(config());
        client.noop().await.unwrap();
        let versions = client.version().await.unwrap();
        assert_eq!(versions.len(), 1);
    }
}
