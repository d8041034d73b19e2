pub mod backoff;
pub mod fs;
pub mod net;

pub use backoff::{Backoff, BackoffTimer};
pub use fs::FsUtils;
pub use net::NetUtils;
