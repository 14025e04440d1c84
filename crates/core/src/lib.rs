pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Direction, EngineConfig, EngineConfigBuilder, IPV4_MAX_PACKET_LEN, Protocol, Tuple, TupleMask,
    TuplePattern,
};
