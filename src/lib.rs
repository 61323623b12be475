//! stageflow — the workflow orchestration core of a chat platform.
//!
//! An incoming request is classified into one of six workflow types, each
//! backed by a graph of named stages. The [`engine::WorkflowEngine`] drives a
//! graph against a mutable [`engine::types::WorkflowState`], persisting
//! checkpoints at stage boundaries so interrupted runs can be resumed. The
//! [`orchestrator::Orchestrator`] façade wraps the engine with a two-tier
//! fallback policy so callers always receive a response, tagged with the
//! tier that produced it.

pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod engine;
pub mod orchestrator;
pub mod stages;
