//! gRPC front end exposing the decision engine to the gateway's HTTP layer.

pub mod proto;
mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Re-export commonly used types
pub use proto::{
    rate_limit_service_server::RateLimitServiceServer,
    CheckRequest, CheckResponse,
};
