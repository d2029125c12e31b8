//! Data models for run orchestration
//!
//! This module contains all data structures shared by the coordinator,
//! the dispatcher and the executors.

mod catalog;
mod job;
mod run;

pub use catalog::{
    Catalog, Dataset, DatasetVersion, Environment, HealthStatus, Layer, Project, RepoAuthMethod,
    Suite, ValidationStatus,
};
pub use job::{ExecuteRequest, ExecuteResponse, JobContext, ResultsReport, ShardJob};
pub use run::{
    ArtifactType, NewRun, Run, RunArtifact, RunId, RunMetadata, RunStatus, ShardResult,
    ShardStatus, TestCounts,
};
