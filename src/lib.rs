//! Calvados is a small ARM instruction recovery library written in Rust. When a program
//! image crosses a lossy packet channel and some words never arrive, the receiver still
//! knows the addresses of the holes. Calvados enumerates 32-bit ARM encodings that decode
//! to valid instructions at each hole, scores the candidates with probabilistic rules
//! applied over the surviving instructions, and narrows residual ties by forward
//! constraint propagation over an approximate control-flow graph.
//!
//! Check [recuperator::Recuperator] for the iterative scoring loop and
//! [solver::ForwardConstraintEnumerator] for the final tie resolution.
//!
//! Check [reader] to see how disassembled listings are ingested and [corruption] for the
//! supported corruption descriptors.

pub mod arm;
pub mod candidate;
pub mod cfg;
pub mod condition;
pub mod corruption;
pub mod error;
pub mod helpers;
pub mod metadata;
pub mod program;
pub mod reader;
pub mod recuperator;
pub mod registers;
pub mod report;
pub mod rules;
pub mod solution;
pub mod solver;
