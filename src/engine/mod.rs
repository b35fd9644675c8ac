pub mod analyzer;
pub mod assigner;
pub mod bodies;
pub mod extraction;
pub mod git;
pub mod labeler;
pub mod lint;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;
