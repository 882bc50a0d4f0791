pub mod pool;
pub mod socket;

pub use pool::PortPool;
pub use socket::{GlueSocket, SocketFactory};
