//! Build, test and smoke verifiers.
//!
//! Each verifier returns structured per-subject results instead of raising,
//! so the validation pipeline can aggregate heterogeneous failures into one
//! error-context document.

pub mod build;
pub mod smoke;
pub mod test;
