pub mod error;
pub mod launcher;
pub mod protocol;

pub use error::*;
pub use launcher::*;
pub use protocol::*;
