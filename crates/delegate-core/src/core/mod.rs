//! Core module: agent execution and job orchestration.
//!
//! This module contains:
//! - `stream`: Typed delta streams and channels between agents and nodes
//! - `events`: Tool output envelope and produced files
//! - `call_tree`: Per-job tree of agent and tool calls
//! - `agent`: Agent definition and the tool-calling loop
//! - `job`: Jobs, job context and the runner
//! - `queue`: Per-conversation job queue
//! - `summarizer`: One-line summaries of finished calls

pub mod agent;
pub mod call_tree;
pub mod events;
pub mod job;
pub mod queue;
pub mod stream;
pub mod summarizer;
