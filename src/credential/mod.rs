//! Client credentials: parsing, the shared cache, and the startup gate.
//!
//! # Modules
//!
//! - [`parser`] — PEM certificate/key decoding (`ParsedCredential`)
//! - [`identity`] — X.509 metadata extraction (`CredentialInfo`)
//! - [`cache`] — name-keyed, atomically replaced credential store
//! - [`readiness`] — blocks startup until a credential is loaded

pub mod cache;
pub mod identity;
pub mod parser;
pub mod readiness;

pub use cache::CredentialCache;
pub use identity::CredentialInfo;
pub use parser::{ParsedCredential, load_certs, parse_credential};
pub use readiness::ReadinessWaiter;
