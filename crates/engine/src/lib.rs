pub mod connector;
pub mod paper;
pub mod reconciler;
pub mod tracker;

pub use connector::{Connector, ConnectorHandle};
pub use paper::{CreateFault, SimulatedVenue};
pub use reconciler::ReconciliationEngine;
pub use tracker::{EventStream, OrderTracker};
