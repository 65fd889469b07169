pub mod agent;
pub mod error;
pub mod export;
pub mod feedback;
pub mod intake;
pub mod model;
pub mod ports;
pub mod retry;
pub mod worker;
