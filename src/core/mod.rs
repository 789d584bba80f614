pub mod backend;
pub mod droplet;
pub mod inventory;
pub mod load_balancer;
pub mod monitor;
pub mod transport;

pub use backend::{Backend, BackendContext, BackendError, BackendKind, Stats};
pub use droplet::Droplet;
pub use inventory::{Inventory, InventoryError};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory, LoadBalancerStats};
pub use monitor::BackendMonitor;
pub use transport::InstrumentedTransport;
