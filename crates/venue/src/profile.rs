use bxconnect_core::{Config, FeeConfig, OrderType};

/// Static venue policy: identity, accepted order types, id format, fees.
///
/// Whether market orders are accepted, and which fee simplification applies,
/// are venue decisions, so the connector reads them from here instead of
/// assuming them.
pub trait VenueProfile: Send + Sync {
    fn name(&self) -> &str;
    fn supported_order_types(&self) -> &[OrderType];
    fn client_order_id_prefix(&self) -> &str;
    fn client_order_id_max_length(&self) -> usize;
    fn fee_config(&self) -> &FeeConfig;
}

/// A profile read straight from the `[venue]` and `[fees]` config tables.
#[derive(Debug, Clone)]
pub struct ConfiguredProfile {
    name: String,
    order_types: Vec<OrderType>,
    id_prefix: String,
    id_max_length: usize,
    fees: FeeConfig,
}

impl ConfiguredProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.venue.name.clone(),
            order_types: config.venue.order_types.clone(),
            id_prefix: config.venue.client_order_id_prefix.clone(),
            id_max_length: config.venue.client_order_id_max_length,
            fees: config.fees.clone(),
        }
    }
}

impl VenueProfile for ConfiguredProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_order_types(&self) -> &[OrderType] {
        &self.order_types
    }

    fn client_order_id_prefix(&self) -> &str {
        &self.id_prefix
    }

    fn client_order_id_max_length(&self) -> usize {
        self.id_max_length
    }

    fn fee_config(&self) -> &FeeConfig {
        &self.fees
    }
}
