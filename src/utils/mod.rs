pub mod logging;
pub mod stats;
