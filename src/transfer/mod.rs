pub mod client;
pub mod error;
pub mod naming;
pub mod probe;
pub mod sizing;
pub mod worker;
