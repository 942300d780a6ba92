pub mod resolver;

pub use resolver::{IdentityResolver, ResolverStats};
