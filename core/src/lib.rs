//! # autonomic-core
//!
//! The runtime for a self-improving autonomic agent: a Pulse Executor that answers one
//! chat turn at a time, and an Autonomic Engine that runs six background levels plus a
//! priority-ranked burst mode whenever the operator goes idle.
//!
//! ## Main modules
//!
//! - [`error`]: [`CoreError`], [`ErrorKind`] — the closed error taxonomy every fallible
//!   call in this crate maps into.
//! - [`storage`]: [`storage::Storage`], [`storage::Stream`], append-only JSONL record
//!   streams with compaction, rotation, and single-record state files.
//! - [`retrieval`]: BM25 scoring, tokenization, and the entity/relation graph behind
//!   memory and wisdom lookups.
//! - [`permission`]: the Permission Engine — policy evaluation, session-approval
//!   caching, and the inline approval-request contract.
//! - [`dispatch`]: the Tool Dispatch layer — action chains, code-safety checks, and the
//!   subprocess tool-host protocol.
//! - [`learning`]: [`learning::LearningRecorder`] and [`learning::insights`] — turning
//!   experiences into skills, insights, and genesis suggestions.
//! - [`regression`]: [`regression::RegressionGate`] — monotone-improving baseline gate
//!   around any self-modifying change.
//! - [`curiosity`]: [`curiosity::CuriosityDriver`] — gap-driven tool-authoring cycles.
//! - [`gvu`]: Self-Questioner, Tester, and Healer — the generate/verify/update loop that
//!   powers the `test` and `heal` levels.
//! - [`autonomic`]: [`autonomic::AutonomicEngine`] — the heartbeat scheduler tying every
//!   level and burst mode together.
//! - [`pulse`]: the Pulse Executor — per-chat-turn intent classification, planning,
//!   execution, and post-processing.
//! - [`external`]: collaborator seams (LLM client, MCP bridge, policy driver subprocess,
//!   chat transport, web search) that the rest of the crate depends on only by trait.

pub mod autonomic;
pub mod curiosity;
pub mod dispatch;
pub mod error;
pub mod external;
pub mod gvu;
pub mod learning;
pub mod permission;
pub mod pulse;
pub mod regression;
pub mod retrieval;
pub mod storage;

pub use error::{CoreError, CoreResult, ErrorKind};
