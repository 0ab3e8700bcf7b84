pub mod schema;

#[allow(unused_imports)]
pub use schema::{Config, GatewayConfig, ProviderConfig, SessionConfig};
