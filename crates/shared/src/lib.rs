pub mod domain;
pub mod error;
pub mod node;
pub mod protocol;
pub mod resolve;
