pub mod error;
pub mod messenger;
pub mod transport;

pub use error::*;
pub use messenger::*;
pub use transport::*;
