//! Integration tests for kwt-net
//!
//! # Test Organization
//!
//! - `dns_e2e`: the DNS engine on localhost, answering mapped and cluster
//!   names and forwarding the rest to a fake recursor
//! - `forwarding_session`: a full forwarding session with a recording
//!   forwarder and a direct (tunnel-less) dialer
//!
//! # Test Requirements
//!
//! - No root and no network access; everything binds `127.0.0.1:0`

pub mod dns_e2e;
pub mod forwarding_session;
