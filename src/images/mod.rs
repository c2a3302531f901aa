pub mod checkpoint;
pub mod reader;

pub use checkpoint::{Pagemap, ProcessImages};
pub use reader::ImageDir;
