//! SSH credentials for the push.
//!
//! The private key lives as an object in the notified bucket.  It is
//! downloaded to a private temporary file and handed to git through
//! `GIT_SSH_COMMAND` on the push process only, so nothing process-wide is
//! touched and two notifications never share an identity.

pub mod identity;

pub use identity::fetch_identity;
