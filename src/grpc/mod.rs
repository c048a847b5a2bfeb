pub mod headnode_service;
pub mod server;

pub use headnode_service::HeadnodeService;
pub use server::GrpcServer;
