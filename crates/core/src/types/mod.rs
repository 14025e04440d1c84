mod config;
mod tuple;

pub use config::{EngineConfig, EngineConfigBuilder, IPV4_MAX_PACKET_LEN};
pub use tuple::{Direction, Protocol, Tuple, TupleMask, TuplePattern};
