//! Wire messages for `authguard.ratelimit.v1`.
//!
//! Equivalent protobuf definition:
//!
//! ```protobuf
//! syntax = "proto3";
//! package authguard.ratelimit.v1;
//!
//! import "google/protobuf/duration.proto";
//!
//! service RateLimitService {
//!   rpc Check(CheckRequest) returns (CheckResponse);
//! }
//!
//! message CheckRequest {
//!   string route = 1;
//!   optional string ip = 2;
//!   optional string email = 3;
//!   optional string okta_identifier = 4;
//!   optional string access_token_hash = 5;
//! }
//!
//! message CheckResponse {
//!   bool allowed = 1;
//!   google.protobuf.Duration retry_after = 2;
//!   uint64 retry_after_ms = 3;
//!   string limited_by = 4;
//! }
//! ```

/// Admission check for one incoming gateway request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckRequest {
    /// Logical route name, e.g. `signIn`.
    #[prost(string, tag = "1")]
    pub route: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "2")]
    pub ip: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub email: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub okta_identifier: ::core::option::Option<::prost::alloc::string::String>,
    /// Stable hash of the bearer token; never the raw token.
    #[prost(string, optional, tag = "5")]
    pub access_token_hash: ::core::option::Option<::prost::alloc::string::String>,
}

/// Admission decision.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckResponse {
    #[prost(bool, tag = "1")]
    pub allowed: bool,
    /// Set when denied.
    #[prost(message, optional, tag = "2")]
    pub retry_after: ::core::option::Option<::prost_types::Duration>,
    /// Same hint in milliseconds, 0 when allowed.
    #[prost(uint64, tag = "3")]
    pub retry_after_ms: u64,
    /// Dimension of the exhausted bucket, empty when allowed or when the
    /// store was unavailable.
    #[prost(string, tag = "4")]
    pub limited_by: ::prost::alloc::string::String,
}

include!(concat!(env!("OUT_DIR"), "/authguard.ratelimit.v1.RateLimitService.rs"));
