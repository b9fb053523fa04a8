pub mod batch_io;
pub mod logging;
