//! HTTP clients
//!
//! Service-to-service calls between the coordinator, the dispatcher and the
//! executors.

mod client;
mod services;

pub use client::{ClientError, ServiceClient, SECRET_HEADER};
pub use services::{
    Coordinator, DispatchedBody, EnqueueResponse, Enqueuer, ExecutorAnswer, ExecutorEndpoint,
    HttpCoordinator, HttpEnqueuer, HttpExecutor,
};
