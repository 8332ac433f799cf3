pub mod command;
pub mod error;
pub mod repo;
pub mod rescue;
pub mod reset;
pub mod restart;
pub mod sync_state;

pub use command::*;
pub use error::*;
pub use repo::*;
pub use rescue::*;
pub use reset::*;
pub use restart::*;
pub use sync_state::*;
