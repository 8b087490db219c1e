//! Connection State Machine
//!
//! Every connection is driven by a state machine that runs on its worker
//! thread whenever the socket becomes ready or an engine completes a blocked
//! call. Each state is a function that either continues with the next state
//! or yields the thread back to the worker.
//!
//! ```text
//!                 ┌─────────┐ register READ  ┌──────┐  data   ┌──────────┐
//!   accept ─────▶ │ Waiting │ ─────────────▶ │ Read │ ──────▶ │ ParseCmd │ ◀─┐
//!                 └─────────┘                └──────┘         └────┬─────┘   │
//!                      ▲                      eof │  would block   │         │
//!                      │                          ▼     ┌──────────┼──────┐  │
//!                      │                     ┌─────────┐│ store    │      │  │
//!                      │                     │ Closing ││    ┌───────┐    │  │
//!                      │                     └────┬────┘│    │ Nread │    │  │
//!                      │                          │     │    └───┬───┘    │  │
//!                      │                          ▼     │        ▼        ▼  │
//!                      │                 PendingClose   │  ┌──────────────┐  │
//!                      │                       │        │  │ Write/Mwrite │  │
//!                      │                       ▼        │  └──────┬───────┘  │
//!                      │                 ImmediateClose │         ▼          │
//!                      │                       │        │    ┌────────┐      │
//!                      └───────────────────────┼────────┴─── │ NewCmd │ ─────┘
//!                          no buffered input   ▼             └────────┘
//!                                          Destroyed
//! ```
//!
//! A command whose engine call returns `WouldBlock` parks the connection:
//! the state is left unchanged, no socket interest is registered and the
//! `ewouldblock` flag is set. When the engine calls `notify_io_complete`
//! the worker clears the flag and runs the machine again, which re-executes
//! the parked command against the stored completion status.

use super::buffer::{BufferLoan, NetBuf};
use super::cookie::Cookie;
use super::transport::{EventMask, Readiness, Transport};
use crate::bucket::{
    Association, BucketTable, ThreadStats, DEFAULT_BUCKET_NAME, NO_BUCKET_INDEX,
};
use crate::commands::{CommandHandler, Outcome};
use crate::config::ReqsPerEvent;
use crate::engine::{Engine, Item, StreamEvent};
use crate::protocol::{
    magic, Frame, FrameParser, Opcode, Request, RequestHeader, ResponseHeader, Status, HEADER_LEN,
};
use crate::server::worker::WorkerContext;
use crate::server::ServerContext;
use bytes::{Buf, Bytes};
use std::collections::{TryReserveError, VecDeque};
use std::io::{self, IoSlice};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// States of the connection machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Listening = 0,
    Waiting,
    Read,
    ParseCmd,
    NewCmd,
    Nread,
    Write,
    Mwrite,
    ShipLog,
    Closing,
    PendingClose,
    ImmediateClose,
    Destroyed,
}

impl State {
    pub fn from_u8(value: u8) -> State {
        match value {
            0 => State::Listening,
            1 => State::Waiting,
            2 => State::Read,
            3 => State::ParseCmd,
            4 => State::NewCmd,
            5 => State::Nread,
            6 => State::Write,
            7 => State::Mwrite,
            8 => State::ShipLog,
            9 => State::Closing,
            10 => State::PendingClose,
            11 => State::ImmediateClose,
            _ => State::Destroyed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Listening => "listening",
            State::Waiting => "waiting",
            State::Read => "read",
            State::ParseCmd => "parse_cmd",
            State::NewCmd => "new_cmd",
            State::Nread => "nread",
            State::Write => "write",
            State::Mwrite => "mwrite",
            State::ShipLog => "ship_log",
            State::Closing => "closing",
            State::PendingClose => "pending_close",
            State::ImmediateClose => "immediate_close",
            State::Destroyed => "destroyed",
        }
    }

    /// Whether the state first checks for a dying bucket. Writes finish
    /// their flush and the close states are already on their way out.
    fn checks_bucket(self) -> bool {
        !matches!(
            self,
            State::Write
                | State::Mwrite
                | State::Closing
                | State::PendingClose
                | State::ImmediateClose
                | State::Destroyed
        )
    }

    pub fn is_closing(self) -> bool {
        matches!(
            self,
            State::Closing | State::PendingClose | State::ImmediateClose | State::Destroyed
        )
    }
}

/// A store command whose value is still arriving.
#[derive(Debug)]
pub(crate) enum Nread {
    /// Filling an engine-allocated item
    Store { header: RequestHeader, item: Item },
    /// Discarding the value of a rejected store, then answering `status`
    Swallow {
        header: RequestHeader,
        remaining: usize,
        status: Status,
    },
}

impl Nread {
    fn remaining(&self) -> usize {
        match self {
            Nread::Store { item, .. } => item.remaining(),
            Nread::Swallow { remaining, .. } => *remaining,
        }
    }

    fn absorb(&mut self, bytes: &[u8]) {
        match self {
            Nread::Store { item, .. } => item.value.extend_from_slice(bytes),
            Nread::Swallow { remaining, .. } => *remaining -= bytes.len(),
        }
    }
}

enum Flush {
    Complete,
    WouldBlock,
    Failed,
}

/// Size of the extras section of a stream mutation: seqno, flags, deleted.
const STREAM_MUTATION_EXTLEN: usize = 13;

/// The thread-owned half of a client connection.
pub struct Connection {
    cookie: Cookie,
    transport: Box<dyn Transport>,
    state: State,
    /// Where `Write`/`Mwrite` go once the response is flushed
    write_and_go: State,
    read: Option<NetBuf>,
    write: Option<NetBuf>,
    /// Value chunks written after the write buffer
    values: VecDeque<Bytes>,
    nread: Option<Nread>,
    /// Command parked on `WouldBlock`, re-executed on resume
    pending: Option<Request>,
    bucket: Option<Association>,
    num_events: u32,
    reqs_per_event: ReqsPerEvent,
    registered: Option<EventMask>,
    generation: u64,
    streaming: bool,
    parser: FrameParser,
    buffer_size: usize,
    shrink_threshold: usize,
    max_packet_size: usize,
}

impl Connection {
    /// Creates a connection in the `Waiting` state, bound to the default
    /// bucket if one exists and to the no-bucket slot otherwise.
    pub fn new(cookie: Cookie, transport: Box<dyn Transport>, server: &ServerContext) -> Self {
        let settings = &server.settings;
        let mut conn = Self {
            cookie,
            transport,
            state: State::Waiting,
            write_and_go: State::NewCmd,
            read: None,
            write: None,
            values: VecDeque::new(),
            nread: None,
            pending: None,
            bucket: None,
            num_events: settings.reqs_per_event.default,
            reqs_per_event: settings.reqs_per_event,
            registered: None,
            generation: 0,
            streaming: false,
            parser: FrameParser::new(settings.max_packet_size),
            buffer_size: settings.buffer_size,
            shrink_threshold: settings.buffer_shrink_threshold,
            max_packet_size: settings.max_packet_size,
        };
        conn.associate(&server.buckets, DEFAULT_BUCKET_NAME);
        conn
    }

    pub fn id(&self) -> u64 {
        self.cookie.id()
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn has_read_buffer(&self) -> bool {
        self.read.is_some()
    }

    pub fn has_write_buffer(&self) -> bool {
        self.write.is_some()
    }

    /// Index of the bound bucket.
    pub fn bucket_index(&self) -> usize {
        self.bucket
            .as_ref()
            .map(|a| a.index)
            .unwrap_or(NO_BUCKET_INDEX)
    }

    /// The engine of the bound bucket.
    pub(crate) fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.bucket.as_ref().map(|a| Arc::clone(&a.engine))
    }

    /// Rebinds the connection to `name`, falling back to the no-bucket slot.
    ///
    /// # Returns
    ///
    /// The index the connection ended up bound to.
    pub(crate) fn associate(&mut self, table: &BucketTable, name: &str) -> usize {
        self.unbind(table);
        let association = table.associate(name);
        self.bind(association)
    }

    pub(crate) fn associate_no_bucket(&mut self, table: &BucketTable) -> usize {
        self.unbind(table);
        let association = table.associate_no_bucket();
        self.bind(association)
    }

    /// Clears the shared index before dropping the client count a
    /// deleter may be waiting on.
    fn unbind(&mut self, table: &BucketTable) {
        if let Some(old) = self.bucket.take() {
            self.cookie.connection().set_bucket_index(None);
            table.disassociate(old);
        }
    }

    fn bind(&mut self, association: Association) -> usize {
        let index = association.index;
        self.cookie.connection().set_bucket_index(Some(index));
        self.bucket = Some(association);
        debug!(conn = self.id(), bucket = index, "Connection associated");
        index
    }

    pub(crate) fn set_write_and_go(&mut self, state: State) {
        self.write_and_go = state;
    }

    pub(crate) fn set_nread(&mut self, nread: Nread) {
        self.nread = Some(nread);
    }

    pub(crate) fn take_aiostat(&self) -> Option<crate::engine::EngineStatus> {
        self.cookie.connection().take_aiostat()
    }

    fn set_state(&mut self, next: State) {
        if next != self.state {
            trace!(conn = self.id(), from = self.state.name(), to = next.name(), "State change");
        }
        self.state = next;
        self.cookie.connection().set_state(next);
    }

    // ========================================================================
    // Event registration
    // ========================================================================

    fn register(&mut self, mask: EventMask) {
        self.generation += 1;
        self.registered = Some(mask);
    }

    /// Takes the interest registered during the last run, with the
    /// generation that readiness events for it must carry.
    pub fn take_registration(&mut self) -> Option<(EventMask, u64)> {
        self.registered.take().map(|mask| (mask, self.generation))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A future resolving once the socket is ready for `mask`.
    pub fn readiness(&self, mask: EventMask) -> Option<Readiness> {
        self.transport.readiness(mask)
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Queues a complete response packet in the write buffer.
    pub(crate) fn add_response(
        &mut self,
        request: &RequestHeader,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        cas: u64,
    ) {
        let Some(wbuf) = self.write.as_mut() else {
            error!(conn = self.id(), "Response without a write buffer");
            return;
        };
        let raw = response_header(request, status, extras.len(), key.len(), value.len(), cas);
        if let Err(e) = put_packet(wbuf, &[&raw[..], extras, key, value]) {
            self.drop_response(e);
        }
    }

    /// Queues a response whose value is sent straight from `value` rather
    /// than being copied into the write buffer.
    pub(crate) fn add_value_response(
        &mut self,
        request: &RequestHeader,
        extras: &[u8],
        value: Bytes,
        cas: u64,
    ) {
        let Some(wbuf) = self.write.as_mut() else {
            error!(conn = self.id(), "Response without a write buffer");
            return;
        };
        let raw = response_header(request, Status::Success, extras.len(), 0, value.len(), cas);
        if let Err(e) = put_packet(wbuf, &[&raw[..], extras]) {
            self.drop_response(e);
            return;
        }
        if !value.is_empty() {
            self.values.push_back(value);
        }
    }

    /// Closes the connection once the responses queued so far are written.
    fn drop_response(&mut self, err: TryReserveError) {
        warn!(conn = self.id(), error = %err, "Failed to queue response, closing connection");
        self.write_and_go = State::Closing;
    }

    /// Queues an error response carrying the status text as its body.
    pub(crate) fn add_error(&mut self, request: &RequestHeader, status: Status) {
        self.add_response(request, status, &[], &[], status.description().as_bytes(), 0);
    }

    fn add_stream_mutation(&mut self, event: &StreamEvent) -> Result<(), TryReserveError> {
        let Some(wbuf) = self.write.as_mut() else {
            return Ok(());
        };
        let header = RequestHeader {
            magic: magic::REQUEST,
            opcode: Opcode::StreamMutation as u8,
            keylen: event.key.len() as u16,
            extlen: STREAM_MUTATION_EXTLEN as u8,
            datatype: 0,
            vbucket: 0,
            bodylen: (STREAM_MUTATION_EXTLEN + event.key.len() + event.value.len()) as u32,
            opaque: 0,
            cas: 0,
        };
        let mut raw = [0u8; HEADER_LEN];
        header.encode(&mut &mut raw[..]);

        let mut extras = [0u8; STREAM_MUTATION_EXTLEN];
        extras[..8].copy_from_slice(&event.seqno.to_be_bytes());
        extras[8..12].copy_from_slice(&event.flags.to_be_bytes());
        extras[12] = event.deleted as u8;
        put_packet(wbuf, &[&raw[..], &extras[..], &event.key[..], &event.value[..]])
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    fn acquire_buffers(&mut self, ctx: &mut WorkerContext<'_>) -> Result<(), TryReserveError> {
        let read = ctx.pool.loan_read(&mut self.read)?;
        let write = ctx.pool.loan_write(&mut self.write)?;
        if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
            ThreadStats::incr(match read {
                BufferLoan::Existing => &stats.rbufs_existing,
                BufferLoan::Loaned => &stats.rbufs_loaned,
                BufferLoan::Allocated => &stats.rbufs_allocated,
            });
            ThreadStats::incr(match write {
                BufferLoan::Existing => &stats.wbufs_existing,
                BufferLoan::Loaned => &stats.wbufs_loaned,
                BufferLoan::Allocated => &stats.wbufs_allocated,
            });
        }
        Ok(())
    }

    /// Gives drained buffers back to the thread. Buffers still holding
    /// data stay with the connection.
    fn release_buffers(&mut self, ctx: &mut WorkerContext<'_>) {
        ctx.pool.return_read(&mut self.read);
        if self.values.is_empty() {
            ctx.pool.return_write(&mut self.write);
        }
    }

    fn reset_command(&mut self) {
        if let Some(Nread::Store { item, .. }) = self.nread.take() {
            self.release_item(item);
        }
        self.pending = None;
        self.values.clear();
        if let Some(rbuf) = self.read.as_mut() {
            rbuf.shrink(self.buffer_size, self.shrink_threshold);
        }
        if let Some(wbuf) = self.write.as_mut() {
            wbuf.shrink(self.buffer_size, self.shrink_threshold);
        }
    }

    fn release_item(&self, item: Item) {
        if let Some(engine) = self.engine() {
            engine.release(&self.cookie, item);
        }
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Handles one event: loans buffers, runs states until one yields and
    /// returns the buffers unless the connection is streaming.
    pub fn run_event(&mut self, ctx: &mut WorkerContext<'_>) {
        self.num_events = self.max_reqs_per_event();

        if !self.state.is_closing() {
            if let Err(e) = self.acquire_buffers(ctx) {
                warn!(conn = self.id(), error = %e, "Failed to allocate network buffers");
                self.set_state(State::Closing);
            }
        }

        while self.step(ctx) {}

        if !self.streaming && self.state != State::Destroyed {
            self.release_buffers(ctx);
        }
    }

    fn max_reqs_per_event(&self) -> u32 {
        match self.cookie.connection().priority() {
            Some(priority) => self.reqs_per_event.for_priority(priority),
            None => self.reqs_per_event.default,
        }
    }

    /// Runs the current state once.
    ///
    /// # Returns
    ///
    /// `true` to continue with the next state, `false` to yield.
    pub fn step(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        if self.state.checks_bucket() && self.bucket_dying(ctx) {
            debug!(
                conn = self.id(),
                bucket = self.bucket_index(),
                "Bucket going away, closing connection"
            );
            self.set_state(State::Closing);
        }

        match self.state {
            State::Listening => {
                error!(conn = self.id(), "Listening state on a client connection");
                self.set_state(State::Closing);
                true
            }
            State::Waiting => self.conn_waiting(),
            State::Read => self.conn_read(ctx),
            State::ParseCmd => self.conn_parse_cmd(ctx),
            State::NewCmd => self.conn_new_cmd(ctx),
            State::Nread => self.conn_nread(ctx),
            State::Write | State::Mwrite => self.conn_write(ctx),
            State::ShipLog => self.conn_ship_log(ctx),
            State::Closing => self.conn_closing(),
            State::PendingClose => self.conn_pending_close(ctx),
            State::ImmediateClose => self.conn_immediate_close(ctx),
            State::Destroyed => false,
        }
    }

    fn bucket_dying(&self, ctx: &WorkerContext<'_>) -> bool {
        if ctx.server.is_shutting_down() {
            return true;
        }
        if ctx.worker.deleting_buckets() == 0 {
            return false;
        }
        match &self.bucket {
            Some(a) if a.index != NO_BUCKET_INDEX => !ctx.server.buckets.is_ready(a.index),
            _ => false,
        }
    }

    // ========================================================================
    // States
    // ========================================================================

    fn conn_waiting(&mut self) -> bool {
        self.register(EventMask::READ);
        self.set_state(State::Read);
        false
    }

    fn conn_read(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        let Some(rbuf) = self.read.as_mut() else {
            self.set_state(State::Closing);
            return true;
        };
        if !rbuf.make_room(self.max_packet_size) {
            warn!(conn = self.id(), "Read buffer full, closing connection");
            self.set_state(State::Closing);
            return true;
        }

        match self.transport.try_read(rbuf.spare()) {
            Ok(0) => {
                debug!(conn = self.id(), "Peer closed connection");
                self.set_state(State::Closing);
            }
            Ok(n) => {
                rbuf.commit(n);
                self.count_read(ctx, n);
                self.set_state(State::ParseCmd);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.set_state(State::Waiting),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(conn = self.id(), error = %e, "Read failed");
                self.set_state(State::Closing);
            }
        }
        true
    }

    fn conn_parse_cmd(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        if self.cookie.connection().is_ewouldblock() {
            return false;
        }
        if let Some(request) = self.pending.take() {
            return self.dispatch(ctx, request);
        }

        let Some(rbuf) = self.read.as_mut() else {
            self.set_state(State::Closing);
            return true;
        };
        let (frame, consumed) = match self.parser.parse(rbuf.data()) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                self.set_state(State::Waiting);
                return true;
            }
            Err(e) => {
                warn!(conn = self.id(), error = %e, "Protocol error, closing connection");
                self.set_state(State::Closing);
                return true;
            }
        };
        rbuf.consume(consumed);

        if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
            ThreadStats::incr(&stats.cmd_total);
        }

        match frame {
            Frame::Request(request) => self.dispatch(ctx, request),
            Frame::StoreHeader { header, extras, key } => {
                self.write_and_go = State::NewCmd;
                let outcome = CommandHandler::new(ctx).begin_store(self, &header, &extras, &key);
                self.apply(outcome)
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut WorkerContext<'_>, request: Request) -> bool {
        self.write_and_go = State::NewCmd;
        let outcome = CommandHandler::new(ctx).execute(self, &request);
        if outcome == Outcome::WouldBlock {
            self.pending = Some(request);
        }
        self.apply(outcome)
    }

    fn apply(&mut self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Responded => {
                let next = if self.values.is_empty() {
                    State::Write
                } else {
                    State::Mwrite
                };
                self.set_state(next);
            }
            Outcome::Stream if self.write_and_go == State::Closing => {
                self.set_state(State::Write);
            }
            Outcome::Stream => {
                self.streaming = true;
                self.write_and_go = State::ShipLog;
                self.set_state(State::Write);
            }
            Outcome::Nread => self.set_state(State::Nread),
            Outcome::Disconnect => self.set_state(State::Closing),
            Outcome::WouldBlock => {
                trace!(conn = self.id(), state = self.state.name(), "Parked on engine");
                self.cookie.connection().set_ewouldblock(true);
                return false;
            }
        }
        true
    }

    fn conn_new_cmd(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        self.reset_command();

        let buffered = self.read.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
        self.num_events = self.num_events.saturating_sub(1);
        if self.num_events == 0 && buffered {
            // Give other connections a turn. Write readiness fires right
            // away and brings us back for the buffered input.
            if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
                ThreadStats::incr(&stats.conn_yields);
            }
            self.set_state(State::ParseCmd);
            self.register(EventMask::WRITE);
            return false;
        }

        self.set_state(if buffered {
            State::ParseCmd
        } else {
            State::Waiting
        });
        true
    }

    fn conn_nread(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        if self.cookie.connection().is_ewouldblock() {
            return false;
        }
        let remaining = match &self.nread {
            Some(nread) => nread.remaining(),
            None => {
                error!(conn = self.id(), "Nread without a pending store");
                self.set_state(State::Closing);
                return true;
            }
        };

        if remaining == 0 {
            return self.finish_nread(ctx);
        }

        if let (Some(nread), Some(rbuf)) = (self.nread.as_mut(), self.read.as_mut()) {
            let n = remaining.min(rbuf.len());
            if n > 0 {
                nread.absorb(&rbuf.data()[..n]);
                rbuf.consume(n);
                return true;
            }
        }

        let result = match self.nread.as_mut() {
            Some(Nread::Store { item, .. }) => {
                let filled = item.value.len();
                item.value.resize(filled + remaining, 0);
                let result = self.transport.try_read(&mut item.value[filled..]);
                let got = result.as_ref().map(|n| *n).unwrap_or(0);
                item.value.truncate(filled + got);
                result
            }
            Some(Nread::Swallow { remaining: left, .. }) => {
                let mut scratch = [0u8; 4096];
                let want = (*left).min(scratch.len());
                let result = self.transport.try_read(&mut scratch[..want]);
                if let Ok(n) = result {
                    *left -= n;
                }
                result
            }
            None => return false,
        };

        match result {
            Ok(0) => {
                debug!(conn = self.id(), "Peer closed connection mid-value");
                self.set_state(State::Closing);
                true
            }
            Ok(n) => {
                self.count_read(ctx, n);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.register(EventMask::READ);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                debug!(conn = self.id(), error = %e, "Read failed");
                self.set_state(State::Closing);
                true
            }
        }
    }

    fn finish_nread(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        match self.nread.take() {
            Some(Nread::Swallow { header, status, .. }) => {
                self.add_error(&header, status);
                self.set_state(State::Write);
                true
            }
            Some(Nread::Store { header, item }) => {
                let outcome = CommandHandler::new(ctx).complete_store(self, &header, &item);
                if outcome == Outcome::WouldBlock {
                    self.nread = Some(Nread::Store { header, item });
                } else {
                    self.release_item(item);
                }
                self.apply(outcome)
            }
            None => {
                self.set_state(State::Closing);
                true
            }
        }
    }

    fn conn_write(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        match self.flush(ctx) {
            Flush::Complete => {
                let next = self.write_and_go;
                self.set_state(next);
                true
            }
            Flush::WouldBlock => {
                self.register(EventMask::WRITE);
                false
            }
            Flush::Failed => {
                self.set_state(State::Closing);
                true
            }
        }
    }

    fn conn_ship_log(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        // Completions only serve as wake-ups here.
        let _ = self.take_aiostat();
        let Some(engine) = self.engine() else {
            self.set_state(State::Closing);
            return true;
        };

        if !self.read_stream_acks(ctx, engine.as_ref()) {
            self.set_state(State::Closing);
            return true;
        }

        match self.flush(ctx) {
            Flush::Complete => {}
            Flush::WouldBlock => {
                self.register(EventMask::READ | EventMask::WRITE);
                return false;
            }
            Flush::Failed => {
                self.set_state(State::Closing);
                return true;
            }
        }

        let mut produced = 0usize;
        loop {
            match engine.stream_step(&self.cookie) {
                Ok(Some(event)) => {
                    if let Err(e) = self.add_stream_mutation(&event) {
                        warn!(conn = self.id(), error = %e, "Failed to queue stream event, closing connection");
                        self.set_state(State::Closing);
                        return true;
                    }
                    produced += 1;
                    let pending = self.write.as_ref().map(NetBuf::len).unwrap_or(0);
                    if pending >= self.buffer_size {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = self.id(), error = %e, "Stream failed, closing connection");
                    self.set_state(State::Closing);
                    return true;
                }
            }
        }

        if produced == 0 {
            // Nothing to send until the engine notifies us.
            self.register(EventMask::READ);
            return false;
        }

        self.num_events = self.num_events.saturating_sub(1);
        if self.num_events == 0 {
            if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
                ThreadStats::incr(&stats.conn_yields);
            }
            self.register(EventMask::READ | EventMask::WRITE);
            return false;
        }
        true
    }

    /// Consumes acknowledgements and keepalives sent by a stream consumer.
    ///
    /// Returns `false` if the connection must be closed.
    fn read_stream_acks(&mut self, ctx: &mut WorkerContext<'_>, engine: &dyn Engine) -> bool {
        loop {
            let Some(rbuf) = self.read.as_mut() else {
                return false;
            };
            match self.parser.parse(rbuf.data()) {
                Ok(Some((Frame::Request(request), consumed))) => {
                    rbuf.consume(consumed);
                    match request.opcode() {
                        Some(Opcode::StreamAck) if request.extras.len() == 4 => {
                            let mut extras = &request.extras[..];
                            let bytes = extras.get_u32();
                            if let Err(e) = engine.stream_ack(&self.cookie, bytes) {
                                warn!(conn = self.id(), error = %e, "Stream ack rejected");
                                return false;
                            }
                        }
                        Some(Opcode::Noop) => {}
                        other => {
                            warn!(conn = self.id(), opcode = ?other, "Unexpected command on stream");
                            return false;
                        }
                    }
                }
                Ok(Some((Frame::StoreHeader { .. }, _))) => {
                    warn!(conn = self.id(), "Store command on stream");
                    return false;
                }
                Ok(None) => {
                    if !rbuf.make_room(self.max_packet_size) {
                        return false;
                    }
                    match self.transport.try_read(rbuf.spare()) {
                        Ok(0) => return false,
                        Ok(n) => {
                            rbuf.commit(n);
                            self.count_read(ctx, n);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!(conn = self.id(), error = %e, "Read failed");
                            return false;
                        }
                    }
                }
                Err(e) => {
                    warn!(conn = self.id(), error = %e, "Protocol error on stream");
                    return false;
                }
            }
        }
    }

    fn conn_closing(&mut self) -> bool {
        self.registered = None;
        self.generation += 1;
        self.transport.close();
        if let Some(Nread::Store { item, .. }) = self.nread.take() {
            self.release_item(item);
        }
        self.nread = None;
        self.pending = None;

        let shared = self.cookie.connection();
        let next = if shared.refcount() > 1 || shared.is_ewouldblock() {
            State::PendingClose
        } else {
            State::ImmediateClose
        };
        self.set_state(next);
        true
    }

    fn conn_pending_close(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        self.disconnect_callbacks(ctx);
        let shared = self.cookie.connection();
        if shared.refcount() == 1 && !shared.is_ewouldblock() {
            self.set_state(State::ImmediateClose);
            return true;
        }
        trace!(
            conn = self.id(),
            refcount = shared.refcount(),
            ewouldblock = shared.is_ewouldblock(),
            "Waiting for outstanding references"
        );
        false
    }

    fn conn_immediate_close(&mut self, ctx: &mut WorkerContext<'_>) -> bool {
        self.disconnect_callbacks(ctx);
        self.unbind(&ctx.server.buckets);

        self.values.clear();
        if let Some(rbuf) = self.read.as_mut() {
            rbuf.clear();
        }
        if let Some(wbuf) = self.write.as_mut() {
            wbuf.clear();
        }
        ctx.pool.return_read(&mut self.read);
        ctx.pool.return_write(&mut self.write);
        self.read = None;
        self.write = None;
        self.streaming = false;

        debug!(conn = self.id(), "Connection closed");
        self.set_state(State::Destroyed);
        true
    }

    fn disconnect_callbacks(&self, ctx: &WorkerContext<'_>) {
        if let Some(association) = &self.bucket {
            ctx.server
                .buckets
                .perform_disconnect_callbacks(association.index, &self.cookie);
        }
    }

    // ========================================================================
    // I/O helpers
    // ========================================================================

    fn flush(&mut self, ctx: &mut WorkerContext<'_>) -> Flush {
        loop {
            let result = {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(1 + self.values.len());
                if let Some(wbuf) = &self.write {
                    if !wbuf.is_empty() {
                        slices.push(IoSlice::new(wbuf.data()));
                    }
                }
                slices.extend(
                    self.values
                        .iter()
                        .filter(|v| !v.is_empty())
                        .map(|v| IoSlice::new(&v[..])),
                );
                if slices.is_empty() {
                    return Flush::Complete;
                }
                self.transport.try_write_vectored(&slices)
            };

            match result {
                Ok(0) => return Flush::Failed,
                Ok(n) => {
                    if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
                        ThreadStats::add(&stats.bytes_written, n as u64);
                    }
                    self.advance_output(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(conn = self.id(), error = %e, "Write failed");
                    return Flush::Failed;
                }
            }
        }
    }

    fn advance_output(&mut self, mut n: usize) {
        if let Some(wbuf) = self.write.as_mut() {
            let taken = n.min(wbuf.len());
            wbuf.consume(taken);
            n -= taken;
        }
        while let Some(front) = self.values.front_mut() {
            if front.len() <= n {
                n -= front.len();
                self.values.pop_front();
            } else {
                front.advance(n);
                break;
            }
        }
    }

    fn count_read(&self, ctx: &WorkerContext<'_>, n: usize) {
        if let Some(stats) = ctx.bucket_stats(self.bucket_index()) {
            ThreadStats::add(&stats.bytes_read, n as u64);
        }
    }
}

fn response_header(
    request: &RequestHeader,
    status: Status,
    extlen: usize,
    keylen: usize,
    vallen: usize,
    cas: u64,
) -> [u8; HEADER_LEN] {
    let header = ResponseHeader {
        opcode: request.opcode,
        keylen: keylen as u16,
        extlen: extlen as u8,
        status: status.as_u16(),
        bodylen: (extlen + keylen + vallen) as u32,
        opaque: request.opaque,
        cas,
    };
    let mut raw = [0u8; HEADER_LEN];
    header.encode(&mut &mut raw[..]);
    raw
}

/// Appends the parts of one packet, all or nothing.
fn put_packet(wbuf: &mut NetBuf, parts: &[&[u8]]) -> Result<(), TryReserveError> {
    wbuf.reserve(parts.iter().map(|part| part.len()).sum())?;
    for part in parts {
        wbuf.put(part)?;
    }
    Ok(())
}
