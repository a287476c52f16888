pub mod error;
pub mod logger;
pub mod testing;

pub use logger::init_logger;
