//! Mail Assist — memory-keeping mail assistant core.

pub mod assistant;
pub mod channels;
pub mod config;
pub mod error;
pub mod extract;
pub mod identity;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod reply;
pub mod review;
