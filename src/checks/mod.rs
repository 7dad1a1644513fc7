//! Built-in check implementations
//!
//! Each checker exposes constructors compatible with the registry's
//! constructor tables: given the string-keyed args of a definition, they
//! validate the args once and return a reusable zero-argument closure.

pub mod http;
pub mod icmp;
