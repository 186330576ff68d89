//! Classfile transformer that inserts per-call security checks into
//! compiled bytecode, enforcing a rule set selected by the caller's module.

/// Controller registry and the agent-facing transform entry.
pub mod agent;
/// Mutable DSL producing a [`rules::Rules`] tree.
pub mod builder;
/// Per-caller-module allow/deny decisions.
pub mod checker;
/// Class summaries and the member finder cache.
pub mod finder;
/// Top-level classfile rewriting and the sealed-class substitute.
pub mod processor;
/// Synthetic static proxy methods.
pub mod proxy;
/// Surgery on individual `Code` attributes.
pub mod rewriter;
/// The immutable rule tree.
pub mod rules;
