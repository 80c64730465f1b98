//! Re-exported types from external crates for convenience.
//!
//! These types are commonly used in this SDK and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Secret wrapper used for the authorization key.
pub use secrecy::SecretString;
/// JSON values used for message payloads and presence state.
pub use serde_json::{Map, Value};
/// Parsed origin and request URLs.
pub use url::Url;

/// Position in the message stream, as 17-digit tenths of a microsecond since the epoch.
pub type Timetoken = u64;

/// Per-entity presence state: an arbitrary JSON object.
pub type State = Map<String, Value>;
