//! convgate core - shared types for conversion admission control.
//!
//! This crate holds the vocabulary spoken between the admission core
//! (`convgate-ratelimit`) and the layers around it:
//!
//! - **Subjects**: who is asking ([`SubjectId`], [`Tier`], [`Subject`])
//! - **Payloads**: what they are asking about ([`Fingerprint`], [`AdmissionRequest`])
//! - **Decisions**: what the gate answered ([`Decision`], [`ReasonCode`], [`DenialBody`])

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod decision;
mod fingerprint;
mod request;
mod subject;

pub use decision::*;
pub use fingerprint::*;
pub use request::*;
pub use subject::*;
