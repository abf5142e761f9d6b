pub mod config;
pub mod exception;
pub mod ids;
pub mod machine;
pub mod memory;
pub mod message;
pub mod room;
pub mod script;
pub mod store;
pub mod transport;

pub use config::CoordinationConfig;
pub use exception::*;
pub use ids::*;
pub use machine::*;
pub use memory::MemoryStore;
pub use message::*;
pub use room::*;
pub use script::*;
pub use store::*;
pub use transport::*;
