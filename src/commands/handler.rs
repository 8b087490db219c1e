//! Command Handler Module
//!
//! Executes validated requests against the connection's bound engine or the
//! bucket table and queues the response on the connection.
//!
//! ## Asynchronous Commands
//!
//! Any executor may return [`Outcome::WouldBlock`]. The connection then
//! parks the request and re-executes it once the completion arrives. Every
//! executor therefore starts by consuming the stored completion status:
//!
//! - data commands treat a successful completion as "try the engine again"
//!   and a failed one as the command's result
//! - bucket administration runs on a background thread; the completion *is*
//!   the result
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ validate()  │───>│  dispatch   │───>│  cmd_*()    │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                          ┌────────────────────┴──────┐      │
//! │                          ▼                           ▼      │
//! │                     bound Engine                BucketTable │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::bucket::{is_valid_bucket_name, Manifest, ThreadStats, NO_BUCKET_INDEX};
use crate::config::parse_config;
use crate::connection::{Connection, Nread, State};
use crate::engine::{BucketType, EngineError, EngineStatus, Item, StoreOperation};
use crate::protocol::{validate, validate_collection_key, Opcode, Request, RequestHeader, Status};
use crate::server::worker::WorkerContext;
use crate::server::ServerContext;
use bytes::Buf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What the connection does after a command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response is queued; write it
    Responded,
    /// Parked until the engine calls `notify_io_complete`
    WouldBlock,
    /// Close the connection without answering
    Disconnect,
    /// A store value must be read first
    Nread,
    /// A response is queued; afterwards the connection ships a stream
    Stream,
}

/// Executes commands for the connections of one worker thread.
pub struct CommandHandler<'a> {
    server: &'a Arc<ServerContext>,
    thread: usize,
}

impl<'a> CommandHandler<'a> {
    pub fn new(ctx: &WorkerContext<'a>) -> Self {
        Self {
            server: ctx.server,
            thread: ctx.worker.index(),
        }
    }

    /// Executes a complete request.
    ///
    /// # Arguments
    ///
    /// * `conn` - The requesting connection; the response is queued on it
    /// * `request` - The parsed request
    pub fn execute(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        let opcode = match validate(header) {
            Ok(opcode) => opcode,
            Err(status) => {
                conn.add_error(header, status);
                return Outcome::Responded;
            }
        };
        if let Err(status) = self.check_collection(conn, opcode, &request.key) {
            // A resumed command must not leave its completion behind
            conn.take_aiostat();
            conn.add_error(header, status);
            return Outcome::Responded;
        }

        match opcode {
            Opcode::Get => self.cmd_get(conn, request),
            Opcode::Delete => self.cmd_delete(conn, request),
            Opcode::Quit => self.cmd_quit(conn, request),
            Opcode::Flush => self.cmd_flush(conn, request),
            Opcode::Noop => self.success(conn, header),
            Opcode::Version => {
                conn.add_response(header, Status::Success, &[], &[], crate::VERSION.as_bytes(), 0);
                Outcome::Responded
            }
            Opcode::Stat => self.cmd_stat(conn, request),
            Opcode::Verbosity => self.cmd_verbosity(conn, request),
            Opcode::OpenStream => self.cmd_open_stream(conn, request),
            Opcode::StreamAck => self.cmd_stream_ack(conn, request),
            Opcode::CreateBucket => self.cmd_create_bucket(conn, request),
            Opcode::DeleteBucket => self.cmd_delete_bucket(conn, request),
            Opcode::ListBuckets => self.cmd_list_buckets(conn, request),
            Opcode::SelectBucket => self.cmd_select_bucket(conn, request),
            Opcode::SetManifest => self.cmd_set_manifest(conn, request),
            // Stores arrive as header frames through `begin_store`; stream
            // mutations only ever travel from server to client.
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::StreamMutation => {
                conn.add_error(header, Status::Invalid);
                Outcome::Responded
            }
        }
    }

    // ========================================================================
    // Helper Methods
    // ========================================================================

    fn success(&self, conn: &mut Connection, header: &RequestHeader) -> Outcome {
        conn.add_response(header, Status::Success, &[], &[], &[], 0);
        Outcome::Responded
    }

    /// Turns an engine error into the connection's next step.
    fn engine_error(
        &self,
        conn: &mut Connection,
        header: &RequestHeader,
        err: EngineError,
    ) -> Outcome {
        match err {
            EngineError::WouldBlock => Outcome::WouldBlock,
            EngineError::Disconnect => Outcome::Disconnect,
            other => {
                conn.add_error(header, other.into());
                Outcome::Responded
            }
        }
    }

    /// Rejects keys outside the collections of the connection's bucket.
    fn check_collection(&self, conn: &Connection, opcode: Opcode, key: &[u8]) -> Result<(), Status> {
        let buckets = &self.server.buckets;
        validate_collection_key(opcode, key, |key| {
            buckets.key_in_collection(conn.bucket_index(), key)
        })
    }

    fn count(&self, conn: &Connection, counter: fn(&ThreadStats) -> &AtomicU64) {
        if let Some(stats) = self
            .server
            .buckets
            .thread_stats(conn.bucket_index(), self.thread)
        {
            ThreadStats::incr(counter(stats));
        }
    }

    /// Runs `task` on a background thread and parks the connection until
    /// it completes.
    fn run_admin<F>(&self, conn: &mut Connection, header: &RequestHeader, name: &str, task: F) -> Outcome
    where
        F: FnOnce() -> EngineStatus + Send + 'static,
    {
        let cookie = conn.cookie().clone();
        cookie.reserve();
        let background = cookie.clone();
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let status = task();
                background.notify_io_complete(status);
                background.release();
            });

        match spawned {
            Ok(_) => Outcome::WouldBlock,
            Err(e) => {
                cookie.release();
                error!(conn = conn.id(), error = %e, "Failed to start {} thread", name);
                conn.add_error(header, Status::Internal);
                Outcome::Responded
            }
        }
    }

    fn admin_done(&self, conn: &mut Connection, header: &RequestHeader, status: EngineStatus) -> Outcome {
        match status {
            Ok(()) => self.success(conn, header),
            Err(e) => {
                conn.add_error(header, e.into());
                Outcome::Responded
            }
        }
    }

    // ========================================================================
    // Data Commands
    // ========================================================================

    fn cmd_get(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        match engine.get(conn.cookie(), &request.key) {
            Ok(doc) => {
                self.count(conn, |s| &s.get_hits);
                conn.add_value_response(header, &doc.flags.to_be_bytes(), doc.value, doc.cas);
                Outcome::Responded
            }
            Err(EngineError::KeyNotFound) => {
                self.count(conn, |s| &s.get_misses);
                conn.add_error(header, Status::KeyNotFound);
                Outcome::Responded
            }
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    /// First half of a store: allocates the item the value is read into.
    ///
    /// Rejected stores still have their value read off the socket and
    /// discarded before the error is sent.
    pub fn begin_store(
        &self,
        conn: &mut Connection,
        header: &RequestHeader,
        extras: &[u8],
        key: &[u8],
    ) -> Outcome {
        let swallow = |conn: &mut Connection, status: Status| {
            conn.set_nread(Nread::Swallow {
                header: *header,
                remaining: header.value_len(),
                status,
            });
            Outcome::Nread
        };

        let opcode = match validate(header) {
            Ok(opcode) => opcode,
            Err(status) => return swallow(conn, status),
        };
        if let Err(status) = self.check_collection(conn, opcode, key) {
            return swallow(conn, status);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        let mut extras = extras;
        let flags = extras.get_u32();
        let exptime = extras.get_u32();

        match engine.allocate(conn.cookie(), key, header.value_len(), flags, exptime) {
            Ok(item) => {
                conn.set_nread(Nread::Store {
                    header: *header,
                    item,
                });
                Outcome::Nread
            }
            // Allocation has no resume path; report it as transient.
            Err(EngineError::WouldBlock) => swallow(conn, Status::TempFail),
            Err(e) => swallow(conn, e.into()),
        }
    }

    /// Second half of a store, once the whole value is in `item`.
    pub fn complete_store(&self, conn: &mut Connection, header: &RequestHeader, item: &Item) -> Outcome {
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let operation = match header.opcode() {
            Some(Opcode::Add) => StoreOperation::Add,
            Some(Opcode::Replace) => StoreOperation::Replace,
            _ => StoreOperation::Set,
        };
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        match engine.store(conn.cookie(), item, header.cas, operation) {
            Ok(cas) => {
                self.count(conn, |s| &s.cmd_set);
                conn.add_response(header, Status::Success, &[], &[], &[], cas);
                Outcome::Responded
            }
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    fn cmd_delete(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        match engine.remove(conn.cookie(), &request.key, header.cas) {
            Ok(()) => {
                self.count(conn, |s| &s.delete_hits);
                self.success(conn, header)
            }
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    fn cmd_flush(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if extras_u32(&request.extras) != 0 {
            conn.add_error(header, Status::NotSupported);
            return Outcome::Responded;
        }
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        match engine.flush(conn.cookie()) {
            Ok(()) => self.success(conn, header),
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    fn cmd_quit(&self, conn: &mut Connection, request: &Request) -> Outcome {
        conn.set_write_and_go(State::Closing);
        self.success(conn, &request.header)
    }

    fn cmd_stat(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };
        let group = String::from_utf8_lossy(&request.key).into_owned();

        let mut stats: Vec<(String, String)> = Vec::new();
        let result = {
            let mut add = |k: &str, v: &str| stats.push((k.to_string(), v.to_string()));
            match group.as_str() {
                "" => {
                    self.server_stats(conn, &mut add);
                    engine.get_stats(conn.cookie(), "", &mut add)
                }
                "connections" => {
                    for snapshot in self.server.connections.dump().connections {
                        let json = serde_json::to_string(&snapshot).unwrap_or_default();
                        add(&snapshot.id.to_string(), &json);
                    }
                    Ok(())
                }
                "bucket_details" => {
                    let details = self.server.buckets.details_all();
                    let json = serde_json::json!({ "buckets": details });
                    add("bucket details", &json.to_string());
                    Ok(())
                }
                "settings" => {
                    if let Ok(serde_json::Value::Object(map)) =
                        serde_json::to_value(&self.server.settings)
                    {
                        for (key, value) in map {
                            add(&key, &value.to_string());
                        }
                    }
                    Ok(())
                }
                other => engine.get_stats(conn.cookie(), other, &mut add),
            }
        };

        if let Err(e) = result {
            return self.engine_error(conn, header, e);
        }
        for (key, value) in &stats {
            conn.add_response(header, Status::Success, &[], key.as_bytes(), value.as_bytes(), 0);
        }
        // An empty packet terminates the group
        self.success(conn, header)
    }

    fn server_stats(&self, conn: &Connection, add: &mut dyn FnMut(&str, &str)) {
        let server = self.server;
        let conns = server.connections.stats();
        add("pid", &std::process::id().to_string());
        add("uptime", &server.uptime().as_secs().to_string());
        add("version", crate::VERSION);
        add("threads", &server.settings.threads.to_string());
        add("curr_connections", &server.connections.len().to_string());
        add(
            "total_connections",
            &conns.connections_accepted.load(Ordering::Relaxed).to_string(),
        );
        add(
            "rejected_conns",
            &conns.connections_rejected.load(Ordering::Relaxed).to_string(),
        );
        add("buckets", &server.buckets.list().len().to_string());
        add("buckets_destroyed", &server.buckets.engines_destroyed().to_string());
        server
            .buckets
            .aggregate_stats(conn.bucket_index())
            .emit(add);
    }

    fn cmd_verbosity(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let level = verbosity_level(extras_u32(&request.extras));
        info!(conn = conn.id(), %level, "Changing log level");
        self.server.buckets.perform_log_level_callbacks(level);
        self.success(conn, &request.header)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    fn cmd_open_stream(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        match engine.open_stream(conn.cookie(), &request.key) {
            Ok(()) => {
                conn.add_response(header, Status::Success, &[], &[], &[], 0);
                Outcome::Stream
            }
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    fn cmd_stream_ack(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };
        let bytes = extras_u32(&request.extras);
        match engine.stream_ack(conn.cookie(), bytes) {
            Ok(()) => self.success(conn, header),
            Err(e) => self.engine_error(conn, header, e),
        }
    }

    // ========================================================================
    // Bucket Administration
    // ========================================================================

    fn cmd_create_bucket(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Some(status) = conn.take_aiostat() {
            return self.admin_done(conn, header, status);
        }

        let name = String::from_utf8_lossy(&request.key).into_owned();
        let (module, config) = split_create_body(&request.value);
        let Some(bucket_type) = BucketType::from_module(&module) else {
            warn!(conn = conn.id(), bucket = %name, module = %module, "Unknown bucket type");
            conn.add_error(header, Status::NotStored);
            return Outcome::Responded;
        };
        if !is_valid_bucket_name(&name) {
            conn.add_error(header, Status::Invalid);
            return Outcome::Responded;
        }

        info!(conn = conn.id(), bucket = %name, %bucket_type, "Create bucket requested");
        let server = Arc::clone(self.server);
        self.run_admin(conn, header, "bucket-create", move || {
            server
                .buckets
                .create(&name, &config, bucket_type)
                .map(|_| ())
                .map_err(EngineError::from)
        })
    }

    fn cmd_delete_bucket(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Some(status) = conn.take_aiostat() {
            return self.admin_done(conn, header, status);
        }

        let name = String::from_utf8_lossy(&request.key).into_owned();
        let force = parse_force(&request.value);
        let index = match self.server.buckets.begin_delete(&name) {
            Ok(index) => index,
            Err(e) => {
                conn.add_error(header, e.into());
                return Outcome::Responded;
            }
        };

        // The requester must not hold the bucket it waits on.
        if conn.bucket_index() == index {
            conn.associate_no_bucket(&self.server.buckets);
        }

        info!(conn = conn.id(), bucket = %name, force, "Delete bucket requested");
        let server = Arc::clone(self.server);
        let outcome = self.run_admin(conn, header, "bucket-delete", move || {
            server.buckets.finish_delete(index, force, server.as_ref());
            Ok(())
        });
        if outcome != Outcome::WouldBlock {
            // Nobody will finish the delete
            self.server.buckets.abort_delete(index);
        }
        outcome
    }

    fn cmd_set_manifest(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        if let Err(e) = resume_status(conn) {
            return self.engine_error(conn, header, e);
        }
        let manifest = match Manifest::from_json(&request.value) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "Rejecting collection manifest");
                conn.add_error(header, Status::Invalid);
                return Outcome::Responded;
            }
        };
        let Some(engine) = conn.engine() else {
            return Outcome::Disconnect;
        };

        if let Err(e) = engine.set_manifest(conn.cookie(), &manifest) {
            return self.engine_error(conn, header, e);
        }
        match self.server.buckets.set_manifest(conn.bucket_index(), &manifest) {
            Ok(()) => self.success(conn, header),
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "Rejecting collection manifest");
                conn.add_error(header, e.into());
                Outcome::Responded
            }
        }
    }

    fn cmd_list_buckets(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let names = self.server.buckets.list().join(" ");
        conn.add_response(&request.header, Status::Success, &[], &[], names.as_bytes(), 0);
        Outcome::Responded
    }

    fn cmd_select_bucket(&self, conn: &mut Connection, request: &Request) -> Outcome {
        let header = &request.header;
        let name = String::from_utf8_lossy(&request.key).into_owned();
        let index = conn.associate(&self.server.buckets, &name);
        if index == NO_BUCKET_INDEX {
            conn.add_error(header, Status::KeyNotFound);
            return Outcome::Responded;
        }
        self.success(conn, header)
    }
}

/// Consumes the completion status of a resumed data command.
///
/// A successful completion means "run the engine call again".
fn resume_status(conn: &Connection) -> EngineStatus {
    match conn.take_aiostat() {
        Some(Err(e)) => Err(e),
        _ => Ok(()),
    }
}

/// The leading big-endian u32 of an extras section, 0 if there is none.
fn extras_u32(extras: &[u8]) -> u32 {
    let mut extras = extras;
    if extras.len() < 4 {
        return 0;
    }
    extras.get_u32()
}

/// Splits a create-bucket body into module name and engine configuration.
fn split_create_body(body: &[u8]) -> (String, String) {
    match body.iter().position(|&b| b == 0) {
        Some(nul) => (
            String::from_utf8_lossy(&body[..nul]).into_owned(),
            String::from_utf8_lossy(&body[nul + 1..]).into_owned(),
        ),
        None => (String::from_utf8_lossy(body).into_owned(), String::new()),
    }
}

/// Reads `force=true` from a delete-bucket body.
fn parse_force(body: &[u8]) -> bool {
    let body = String::from_utf8_lossy(body);
    parse_config(&body)
        .ok()
        .and_then(|cfg| cfg.get("force").map(|v| v == "true"))
        .unwrap_or(false)
}

/// Maps the verbosity command's level to a log level.
fn verbosity_level(level: u32) -> tracing::Level {
    match level {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}
