use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::headnode_service::HeadnodeService;
use crate::proto::headnode_server::HeadnodeServer;

pub struct GrpcServer {
    addr: SocketAddr,
    service: HeadnodeService,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, service: HeadnodeService) -> Self {
        Self { addr, service }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(HeadnodeServer::new(self.service))
            .serve_with_shutdown(self.addr, async move {
                shutdown.cancelled().await;
                tracing::info!("Draining gRPC server");
            })
            .await
    }
}
