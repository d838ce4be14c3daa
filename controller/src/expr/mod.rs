//! Evaluation of `$type`-tagged reference trees embedded in workflow
//! documents (step `spec`, `env`, and `when` clauses).

pub mod evaluate;
pub mod fnlib;

pub use evaluate::{evaluate, references, Bindings, Evaluation, EvaluationError, Reference, Resolve};
