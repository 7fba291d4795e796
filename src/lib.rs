//! Authguard - Rate Limiting for Identity Gateway Authentication Routes
//!
//! This crate implements a multi-dimensional token-bucket rate limiter that
//! guards sign-in, registration, password reset and passcode endpoints. A
//! request is admitted only if every applicable bucket (global, IP, email,
//! Okta identifier, access token) has a token, and is charged against all of
//! them atomically. The limiter is usable in-process or through its gRPC
//! front end.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod tasks;
