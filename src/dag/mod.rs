// src/dag/mod.rs

//! Dependency graph of the tasks inside one workflow.
//!
//! [`graph`] owns the edge set and the algorithms over it: cycle detection,
//! topological order, eligibility and forward closure.

pub mod graph;

pub use graph::DependencyGraph;
