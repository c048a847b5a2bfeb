pub mod addr;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod registry;
pub mod selector;
pub mod shutdown;
pub mod store;
pub mod sweep;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("clushead");
}
