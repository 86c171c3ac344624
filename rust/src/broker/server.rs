use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{BrokerConfig, ClusterSettings, ConnectionSettings};
use crate::error::BrokerError;

use super::cluster::ClusterNode;
use super::connection::handle_connection;
use super::directory::ClusterDirectory;
use super::identity::NodeIdentity;
use super::local::LocalSubscriptionTable;
use super::mesh::MeshTransport;
use super::metrics::BrokerMetrics;
use super::registry::ConnectionRegistry;
use super::router::Router;
use super::transport::PeerTransport;

/// Shared state handed to every connection. Built once in [`Broker::start`].
pub struct BrokerContext {
    pub identity: NodeIdentity,
    pub settings: ConnectionSettings,
    pub local: Arc<LocalSubscriptionTable>,
    pub cluster: Arc<ClusterNode>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<Router>,
    pub metrics: Arc<BrokerMetrics>,
    /// Root token. Every connection runs on a child of it.
    pub shutdown: CancellationToken,
}

pub struct Broker {
    ctx: Arc<BrokerContext>,
    listener: TcpListener,
    client_addr: SocketAddr,
    mesh: Arc<MeshTransport>,
    cluster_task: JoinHandle<()>,
    has_seeds: bool,
}

impl Broker {
    /// Resolves identity, binds both listeners and starts the mesh.
    /// Connections are not accepted until [`Broker::run`].
    pub async fn start(config: &BrokerConfig, shutdown: CancellationToken) -> Result<Self, BrokerError> {
        let cluster = ClusterSettings::try_from(config)?;
        let settings = ConnectionSettings::try_from(config)?;
        let identity = NodeIdentity::resolve(cluster.node_id, cluster.bind.port())?;
        let metrics = Arc::new(BrokerMetrics::new());

        let (mesh, events) = MeshTransport::start(
            identity.peer,
            cluster.bind,
            cluster.seeds.clone(),
            metrics.clone(),
            &shutdown,
        )
        .await?;

        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: config.listen,
                source,
            })?;
        let client_addr = listener.local_addr()?;

        let transport: Arc<dyn PeerTransport> = mesh.clone();
        let local = Arc::new(LocalSubscriptionTable::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(ClusterDirectory::new(identity.peer, identity.incarnation));
        let router = Arc::new(Router::new(
            local.clone(),
            directory.clone(),
            registry.clone(),
            transport.clone(),
            metrics.clone(),
        ));
        let cluster_node = Arc::new(ClusterNode::new(directory, transport, metrics.clone()));
        let cluster_task = tokio::spawn(cluster_node.clone().run(
            events,
            router.clone(),
            shutdown.clone(),
        ));

        info!(
            peer = %identity.peer,
            name = %identity.name,
            %client_addr,
            cluster_addr = %mesh.local_addr(),
            "broker started"
        );

        Ok(Self {
            ctx: Arc::new(BrokerContext {
                identity,
                settings,
                local,
                cluster: cluster_node,
                registry,
                router,
                metrics,
                shutdown,
            }),
            listener,
            client_addr,
            mesh,
            cluster_task,
            has_seeds: !cluster.seeds.is_empty(),
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn cluster_addr(&self) -> SocketAddr {
        self.mesh.local_addr()
    }

    pub fn context(&self) -> Arc<BrokerContext> {
        self.ctx.clone()
    }

    pub fn has_seeds(&self) -> bool {
        self.has_seeds
    }

    /// Resolves once one peer is connected. Never times out.
    pub async fn wait_joined(&self) {
        self.mesh.wait_joined().await;
    }

    /// Accepts clients until the shutdown token fires, then waits for every
    /// connection and the mesh to wind down.
    pub async fn run(self) -> Result<(), BrokerError> {
        let Self {
            ctx,
            listener,
            mesh,
            cluster_task,
            ..
        } = self;
        let connections = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                () = ctx.shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(handle_connection(stream, addr, ctx.clone()));
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(listener);
        info!(connections = ctx.registry.len(), "shutting down");
        connections.close();
        connections.wait().await;
        mesh.shutdown().await;
        if let Err(e) = cluster_task.await {
            warn!("cluster task failed: {e}");
        }
        info!("broker stopped");
        Ok(())
    }
}
