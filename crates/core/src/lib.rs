pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::SynchronizedClock;
pub use config::{
    Config, CredentialsConfig, FeeConfig, Mode, ReconciliationConfig, TradingPairConfig,
    TransportConfig, VenueConfig,
};
pub use error::Error;
pub use types::*;

pub type Result<T> = std::result::Result<T, Error>;
