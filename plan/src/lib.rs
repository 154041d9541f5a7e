//! Plan runtime: validation, await-point analysis, and sandboxed execution
//! of model-emitted orchestration scripts.
//!
//! A plan is a small imperative program that calls agent tools
//! (`search`, `extract`, `bash`, `LLM`, …) as if they were synchronous
//! functions. The pipeline is validate → analyze → interpret:
//!
//! * [`validate`] parses the script and rejects everything outside the
//!   supported syntax, plus any identifier or property on the blocklist.
//! * [`transform`] computes which call sites suspend and which callbacks
//!   must run as async (the `map` cascade).
//! * [`interp`] executes the program against a [`host::ToolHost`] under a
//!   wall-clock deadline, a loop-iteration budget, and bounded `map`
//!   fan-out, returning a `{status, result, error, logs}` envelope.

pub mod ast;
pub mod builtins;
pub mod host;
pub mod interp;
pub mod parser;
pub mod token;
pub mod transform;
pub mod validate;
pub mod value;

pub use host::ToolHost;
pub use interp::PlanOutcome;
pub use interp::PlanStatus;
pub use interp::RuntimeOptions;
pub use interp::execute;
pub use transform::BUILTIN_ASYNC_NAMES;
pub use validate::ValidationReport;
pub use validate::validate;
