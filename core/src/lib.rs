//! Shared building blocks for the Pitlane agent proxy.
//!
//! The proxy accepts a chat request, forwards it to the hosted inference
//! service and answers with a strictly-typed envelope no matter what shape the
//! upstream reply takes. This crate holds the transport-free parts of that
//! pipeline: the envelope types, the tolerant [`decode`] step and the
//! [`normalize`] cascade.

pub mod decode;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod normalize;
