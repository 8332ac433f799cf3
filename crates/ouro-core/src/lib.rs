pub mod audit;
pub mod budget;
pub mod config;
pub mod events;
pub mod store;
pub mod types;

pub use audit::*;
pub use budget::*;
pub use config::*;
pub use events::*;
pub use store::*;
pub use types::*;
