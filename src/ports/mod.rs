//! Ports (trait boundaries) separating the decision core from I/O.

pub mod http_client;
