pub mod cabinet;
pub mod engine;
pub mod message;
pub mod party;
pub mod record;
pub mod tag;

pub use cabinet::*;
pub use engine::*;
pub use message::*;
pub use party::*;
pub use record::*;
pub use tag::*;
