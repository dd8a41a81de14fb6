//! Business logic: the WAF decision core and the off-line analysers.

pub mod analysis;
pub mod waf;
