mod builder;
mod isolation;
mod manager;
mod pool;
mod replay;
mod stream;
mod types;

pub use builder::{CircuitBuilder, Path};
pub use isolation::IsolationKey;
pub use manager::{CircuitManager, ManagerStats};
pub use pool::{CircuitPool, CircuitPoolConfig};
pub use replay::ReplayGuard;
pub use stream::{CircuitStream, StreamManager};
pub use types::{Circuit, CircuitId, CircuitState, CircuitStats, Hop};
