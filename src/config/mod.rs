pub mod boot;
pub mod global;
pub mod source;
