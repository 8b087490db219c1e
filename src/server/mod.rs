//! Server Assembly
//!
//! [`ServerContext`] is the process-wide state every thread shares: the
//! settings, the bucket table and the connection registry. [`Server`] binds
//! the listener, starts the worker threads and runs the dispatcher until
//! shutdown.
//!
//! ```text
//!            ┌────────────┐   NewConnection   ┌──────────┐
//!  accept ──▶│ Dispatcher │──────────────────▶│ worker-0 │──┐
//!            └────────────┘        │          └──────────┘  │
//!                                  └─────────▶┌──────────┐  │   ┌─────────────┐
//!                                             │ worker-N │──┴──▶│ BucketTable │
//!                                             └──────────┘      └─────────────┘
//! ```

pub mod dispatcher;
pub mod worker;

use crate::bucket::{BucketError, BucketTable, DeletionListener, DEFAULT_BUCKET_NAME};
use crate::config::{ConfigError, Settings};
use crate::connection::ConnectionRegistry;
use crate::engine::BucketType;
use dispatcher::Dispatcher;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use worker::{WorkerEvent, WorkerShared, WorkerThread};

/// Errors from starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create the default bucket: {0}")]
    DefaultBucket(#[from] BucketError),

    #[error("shutdown task failed: {0}")]
    Shutdown(String),
}

/// State shared by the dispatcher, the workers and the admin threads.
pub struct ServerContext {
    pub settings: Settings,
    pub buckets: BucketTable,
    pub connections: ConnectionRegistry,
    shutdown: AtomicBool,
    workers: OnceLock<Vec<Arc<WorkerShared>>>,
    next_conn_id: AtomicU64,
    started: Instant,
}

impl ServerContext {
    pub fn new(settings: Settings) -> Self {
        let buckets = BucketTable::new(
            settings.max_buckets,
            settings.threads,
            settings.deletion_poll,
        );
        Self {
            settings,
            buckets,
            connections: ConnectionRegistry::new(),
            shutdown: AtomicBool::new(false),
            workers: OnceLock::new(),
            next_conn_id: AtomicU64::new(1),
            started: Instant::now(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flags the shutdown. Connections notice on their next event.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn set_workers(&self, workers: Vec<Arc<WorkerShared>>) {
        if self.workers.set(workers).is_err() {
            error!("Worker list already set");
        }
    }

    fn workers(&self) -> &[Arc<WorkerShared>] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl DeletionListener for ServerContext {
    fn initiate_bucket_deletion(&self) {
        for worker in self.workers() {
            worker.begin_bucket_deletion();
        }
    }

    fn notify_bucket_deletion(&self) {
        for worker in self.workers() {
            worker.send(WorkerEvent::BucketDeletion);
        }
    }

    fn complete_bucket_deletion(&self) {
        for worker in self.workers() {
            worker.end_bucket_deletion();
        }
    }

    fn associations(&self, index: usize) -> usize {
        self.connections.associations(index)
    }
}

/// A bound, running server.
pub struct Server {
    context: Arc<ServerContext>,
    listener: TcpListener,
    workers: Vec<WorkerThread>,
}

impl Server {
    /// Validates `settings`, binds the listener and starts the workers.
    pub async fn bind(settings: Settings) -> Result<Self, ServerError> {
        settings.validate()?;
        let listener = TcpListener::bind(settings.bind_address()).await?;
        let context = Arc::new(ServerContext::new(settings));

        if context.settings.default_bucket {
            context
                .buckets
                .create(DEFAULT_BUCKET_NAME, "", BucketType::Memcached)?;
            info!("Default bucket created");
        }

        let mut workers = Vec::with_capacity(context.settings.threads);
        for index in 0..context.settings.threads {
            match WorkerThread::spawn(index, Arc::clone(&context)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in workers {
                        worker.shared().send(WorkerEvent::Shutdown);
                        worker.join();
                    }
                    return Err(e.into());
                }
            }
        }
        context.set_workers(workers.iter().map(|w| Arc::clone(w.shared())).collect());

        Ok(Self {
            context,
            listener,
            workers,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Serves until `shutdown` resolves, then closes every connection,
    /// stops the workers and destroys the buckets.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let Server {
            context,
            listener,
            workers,
        } = self;

        let shared: Vec<Arc<WorkerShared>> =
            workers.iter().map(|w| Arc::clone(w.shared())).collect();
        info!(
            addr = ?listener.local_addr().ok(),
            threads = workers.len(),
            "Server listening"
        );
        Dispatcher::new(listener, Arc::clone(&context), shared)
            .run(shutdown)
            .await;

        context.request_shutdown();
        for worker in &workers {
            worker.shared().send(WorkerEvent::Shutdown);
        }

        let ctx = Arc::clone(&context);
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join();
            }
            ctx.buckets.shutdown_all();
        })
        .await
        .map_err(|e| ServerError::Shutdown(e.to_string()))?;

        info!("Server shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketState;
    use crate::protocol::{Opcode, Request, Response, Status};
    use bytes::{Buf, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct TestServer {
        addr: SocketAddr,
        context: Arc<ServerContext>,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<Result<(), ServerError>>,
    }

    impl TestServer {
        async fn start(settings: Settings) -> Self {
            let server = Server::bind(settings).await.unwrap();
            let addr = server.local_addr().unwrap();
            let context = Arc::clone(server.context());
            let (stop, stopped) = oneshot::channel::<()>();
            let handle = tokio::spawn(server.serve(async move {
                let _ = stopped.await;
            }));
            Self {
                addr,
                context,
                stop,
                handle,
            }
        }

        async fn stop(self) {
            let _ = self.stop.send(());
            self.handle.await.unwrap().unwrap();
        }
    }

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, request: &Request) {
            self.stream.write_all(&request.encode()).await.unwrap();
        }

        /// The next response, or `None` once the server closed the socket.
        async fn recv(&mut self) -> Option<Response> {
            loop {
                if let Some((response, used)) = Response::decode(&self.buf) {
                    self.buf.advance(used);
                    return Some(response);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        }

        async fn call(&mut self, request: &Request) -> Response {
            self.send(request).await;
            self.recv().await.expect("connection closed")
        }
    }

    fn settings() -> Settings {
        Settings::default()
            .with_port(0)
            .with_threads(2)
            .with_deletion_poll(Duration::from_millis(20))
    }

    fn create(name: &str, body: &str) -> Request {
        Request::new(Opcode::CreateBucket)
            .with_key(name.to_string())
            .with_value(body.to_string())
    }

    fn set(key: &str, value: &str) -> Request {
        let mut extras = Vec::new();
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        Request::new(Opcode::Set)
            .with_extras(extras)
            .with_key(key.to_string())
            .with_value(value.to_string())
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let server = TestServer::start(settings()).await;
        let mut admin = Client::connect(server.addr).await;
        let mut user = Client::connect(server.addr).await;

        let resp = admin.call(&create("b1", "memcached\0")).await;
        assert_eq!(resp.status(), Some(Status::Success));
        let resp = admin.call(&create("b1", "memcached\0")).await;
        assert_eq!(resp.status(), Some(Status::KeyExists));

        let resp = admin.call(&Request::new(Opcode::ListBuckets)).await;
        assert_eq!(&resp.value[..], b"b1");

        let resp = user
            .call(&Request::new(Opcode::SelectBucket).with_key("b1"))
            .await;
        assert!(resp.is_success());
        assert!(user.call(&set("k", "v")).await.is_success());
        let resp = user.call(&Request::new(Opcode::Get).with_key("k")).await;
        assert!(resp.is_success());
        assert_eq!(&resp.value[..], b"v");

        // The idle user connection is closed so the delete can finish
        let resp = admin
            .call(&Request::new(Opcode::DeleteBucket).with_key("b1"))
            .await;
        assert_eq!(resp.status(), Some(Status::Success));
        assert!(user.recv().await.is_none());

        let resp = admin
            .call(&Request::new(Opcode::DeleteBucket).with_key("b1"))
            .await;
        assert_eq!(resp.status(), Some(Status::KeyNotFound));
        let resp = admin.call(&Request::new(Opcode::ListBuckets)).await;
        assert!(resp.value.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_create_bucket_errors() {
        let server = TestServer::start(settings()).await;
        let mut client = Client::connect(server.addr).await;

        let resp = client.call(&create("b1", "nosuchengine\0")).await;
        assert_eq!(resp.status(), Some(Status::NotStored));
        let resp = client.call(&create("bad name", "memcached\0")).await;
        assert_eq!(resp.status(), Some(Status::Invalid));
        let resp = client
            .call(&Request::new(Opcode::SelectBucket).with_key("missing"))
            .await;
        assert_eq!(resp.status(), Some(Status::KeyNotFound));

        // Not bound to a bucket yet
        let resp = client.call(&Request::new(Opcode::Get).with_key("k")).await;
        assert_eq!(resp.status(), Some(Status::NoBucket));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_ewouldblock_bucket() {
        let server = TestServer::start(settings()).await;
        let mut client = Client::connect(server.addr).await;

        let resp = client
            .call(&create("slow", "ewouldblock\0mode=always;delay_ms=5"))
            .await;
        assert!(resp.is_success());
        let resp = client
            .call(&Request::new(Opcode::SelectBucket).with_key("slow"))
            .await;
        assert!(resp.is_success());

        assert!(client.call(&set("a", "1")).await.is_success());
        let resp = client.call(&Request::new(Opcode::Get).with_key("a")).await;
        assert_eq!(&resp.value[..], b"1");
        let resp = client.call(&Request::new(Opcode::Get).with_key("b")).await;
        assert_eq!(resp.status(), Some(Status::KeyNotFound));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_default_bucket_and_stats() {
        let server = TestServer::start(settings().with_default_bucket(true)).await;
        let mut client = Client::connect(server.addr).await;

        assert!(client.call(&set("k", "v")).await.is_success());

        client.send(&Request::new(Opcode::Stat)).await;
        let mut keys = Vec::new();
        loop {
            let resp = client.recv().await.unwrap();
            assert!(resp.is_success());
            if resp.key.is_empty() {
                break;
            }
            keys.push(String::from_utf8(resp.key.to_vec()).unwrap());
        }
        assert!(keys.iter().any(|k| k == "curr_connections"));
        assert!(keys.iter().any(|k| k == "cmd_set"));

        let resp = client.call(&Request::new(Opcode::Version)).await;
        assert_eq!(&resp.value[..], crate::VERSION.as_bytes());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = TestServer::start(settings().with_max_connections(1)).await;
        let mut first = Client::connect(server.addr).await;
        assert!(first.call(&Request::new(Opcode::Noop)).await.is_success());

        let mut second = Client::connect(server.addr).await;
        second.send(&Request::new(Opcode::Noop)).await;
        assert!(second.recv().await.is_none());
        assert_eq!(
            server
                .context
                .connections
                .stats()
                .connections_rejected
                .load(Ordering::Relaxed),
            1
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_delete_bucket_closes_every_client() {
        let server = TestServer::start(settings()).await;
        let mut admin = Client::connect(server.addr).await;
        let resp = admin
            .call(&create("busy", "ewouldblock\0mode=always;delay_ms=200"))
            .await;
        assert!(resp.is_success());
        let buckets = &server.context.buckets;
        let index = buckets
            .details_all()
            .into_iter()
            .find(|d| d.name == "busy")
            .map(|d| d.index)
            .unwrap();

        let mut clients = Vec::new();
        for _ in 0..4 {
            let mut client = Client::connect(server.addr).await;
            let resp = client
                .call(&Request::new(Opcode::SelectBucket).with_key("busy"))
                .await;
            assert!(resp.is_success());
            clients.push(client);
        }
        assert_eq!(buckets.clients(index), 4);

        // Still parked on the engine when the delete starts
        clients[0]
            .send(&Request::new(Opcode::Get).with_key("k"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let resp = admin
            .call(&Request::new(Opcode::DeleteBucket).with_key("busy"))
            .await;
        assert_eq!(resp.status(), Some(Status::Success));

        for client in &mut clients {
            let closed = tokio::time::timeout(Duration::from_secs(5), async {
                while client.recv().await.is_some() {}
            })
            .await;
            assert!(closed.is_ok(), "client was not disconnected");
        }

        assert_eq!(buckets.state(index), Some(BucketState::None));
        assert_eq!(buckets.clients(index), 0);
        assert_eq!(buckets.engines_destroyed(), 1);
        let resp = admin
            .call(&Request::new(Opcode::DeleteBucket).with_key("busy"))
            .await;
        assert_eq!(resp.status(), Some(Status::KeyNotFound));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_collections() {
        let server = TestServer::start(settings()).await;
        let mut client = Client::connect(server.addr).await;
        let resp = client
            .call(&create(
                "beers",
                "memcached\0collection_mode=strict;collection_set=beer",
            ))
            .await;
        assert!(resp.is_success());
        let resp = client
            .call(&Request::new(Opcode::SelectBucket).with_key("beers"))
            .await;
        assert!(resp.is_success());

        assert!(client.call(&set("beer:ale", "1")).await.is_success());
        let resp = client.call(&set("ale", "1")).await;
        assert_eq!(resp.status(), Some(Status::Invalid));
        let resp = client
            .call(&Request::new(Opcode::Get).with_key("wine:red"))
            .await;
        assert_eq!(resp.status(), Some(Status::Invalid));
        let resp = client
            .call(&Request::new(Opcode::Delete).with_key("ale"))
            .await;
        assert_eq!(resp.status(), Some(Status::Invalid));
        // The rejected value was read off the socket
        assert!(client.call(&Request::new(Opcode::Noop)).await.is_success());

        let manifest = r#"{"collections":["beer","wine"]}"#;
        let resp = client
            .call(&Request::new(Opcode::SetManifest).with_value(manifest))
            .await;
        assert!(resp.is_success());
        assert!(client.call(&set("wine:red", "2")).await.is_success());

        for bad in ["not json", r#"{"collections":["a:b"]}"#] {
            let resp = client
                .call(&Request::new(Opcode::SetManifest).with_value(bad))
                .await;
            assert_eq!(resp.status(), Some(Status::Invalid));
        }
        // Rejected manifests leave the set alone
        let resp = client
            .call(&Request::new(Opcode::Get).with_key("wine:red"))
            .await;
        assert_eq!(&resp.value[..], b"2");

        // Without a bucket there is nothing to configure
        let mut unbound = Client::connect(server.addr).await;
        let resp = unbound
            .call(&Request::new(Opcode::SetManifest).with_value(manifest))
            .await;
        assert_eq!(resp.status(), Some(Status::NoBucket));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_quit_closes() {
        let server = TestServer::start(settings()).await;
        let mut client = Client::connect(server.addr).await;
        let resp = client.call(&Request::new(Opcode::Quit)).await;
        assert!(resp.is_success());
        assert!(client.recv().await.is_none());
        server.stop().await;
    }
}
