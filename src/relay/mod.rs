pub mod session;
pub mod sink;
pub mod source;
