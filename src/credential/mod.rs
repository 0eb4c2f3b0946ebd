pub mod oauth;
pub mod refresh_task;
pub mod source;
pub mod sqlite;
pub mod store;
pub mod types;

pub use store::{MemoryBackend, PoolBackend};
pub use types::{CredentialRef, OAuthToken};
