pub mod cache;
pub mod entity;

pub use cache::{BuilderCache, CheckoutToken, ReturnDisposition, ReturnOutcome};
pub use entity::{EntityBuilder, EntityUpdate};
