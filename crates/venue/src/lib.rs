pub mod adapter;
pub mod auth;
pub mod http;
pub mod json_adapter;
pub mod profile;
pub mod request;
pub mod stream;
pub mod transport;

pub use adapter::VenueAdapter;
pub use auth::{Authenticator, Credentials};
pub use http::HttpTransport;
pub use json_adapter::JsonRestAdapter;
pub use profile::{ConfiguredProfile, VenueProfile};
pub use request::{HttpMethod, RestRequest, SignedRequest};
pub use transport::{Transport, UserEventStream};
