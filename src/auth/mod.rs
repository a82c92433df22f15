// Authentication module
// Owns the persisted session and serializes token refreshes

mod coordinator;
mod refresh;
mod session;
mod store;
pub mod types;

pub use coordinator::RefreshCoordinator;
pub use session::SessionManager;
pub use store::SessionStore;
pub use types::{AccessGrant, CredentialBundle};
