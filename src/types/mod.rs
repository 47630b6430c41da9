pub mod conflict;
pub mod entity;
pub mod event;
pub mod fallback;
pub mod health;
pub mod schema;

pub use conflict::*;
pub use entity::*;
pub use event::*;
pub use fallback::*;
pub use health::*;
pub use schema::*;
