//! Keyfort core
//!
//! The cryptographic subsystem behind the RPC surface: enrollment and
//! unlock of the master secret, the wrapping hierarchy, the P-256 signing
//! engine, bounded signing leases with quota accounting, and endpoint
//! bindings. Every mutation lands in the audit chain in the same
//! transaction as the record it touches.

pub mod context;
pub mod endpoint;
pub mod error;
pub mod hierarchy;
pub mod lease;
pub mod signing;
pub mod types;
pub mod unlock;

pub use context::KmsContext;
pub use endpoint::{EndpointManager, SubscriptionParams};
pub use error::{KmsError, Result};
pub use hierarchy::KeyHierarchy;
pub use lease::{LeaseManager, LeaseSummary};
pub use signing::{IssuedToken, SigningEngine};
pub use types::{
    AuthCredentials, EndpointBinding, EnrollmentMethod, EnrollmentRecord, ExtendOutcome,
    ExtendStatus, LeaseRecord, LeaseVerification, QuotaState, SigningKeyRecord,
};
pub use unlock::{EnrollmentInfo, MasterSecret, NewEnrollment, UnlockManager};
