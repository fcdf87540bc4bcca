// Idempotency coordinators
// Embedded runs inside the caller's transaction, standalone owns its own and leases records

pub mod embedded;
pub mod standalone;

pub use embedded::EmbeddedCoordinator;
pub use standalone::StandaloneCoordinator;
