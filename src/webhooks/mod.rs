/// Authenticity checks for inbound payment notifications
pub mod signature;

pub use signature::{SignatureGenerator, SignatureVerifier, REQUEST_ID_HEADER, SIGNATURE_HEADER};
