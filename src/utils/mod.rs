pub mod ewma;
pub mod graceful_shutdown;

pub use ewma::Ewma;
pub use graceful_shutdown::{
    FirstStage, GracefulShutdown, ShutdownLock, ShutdownReason, ShutdownToken,
};
