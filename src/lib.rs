// Core modules
pub mod error;
pub mod images;
pub mod mem;
pub mod proto;

pub use error::{CritError, Result};
pub use mem::{dump_process, read_range};
