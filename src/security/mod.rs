//! Request guards: identity and access, admission control, SQL policy and
//! identifier checks.

pub mod access;
pub mod identifier;
pub mod rate_limiter;
pub mod store;
pub mod validator;

pub use access::{AccessControl, AccessRule, ClientIdentity, CredentialVerifier, IpAccessList};
pub use identifier::{IdentifierSanitizer, quote_identifier};
pub use rate_limiter::{AdmissionController, AdmissionDecision};
pub use store::{LocalStore, RateLimitStore, RedisStore, StoreKind, WindowCounts, WindowPolicy};
pub use validator::{SqlValidator, ValidationVerdict};
