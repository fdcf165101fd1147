//! On-disk package handling: tag files, digests, validation.

pub mod digest;
pub mod tags;
pub mod validator;

pub use digest::{digest_file, sha256_file, tagmanifest_receipt, FileDigests};
pub use validator::{ValidationOutcome, Validator};
