pub mod bus;
pub mod normalize;
pub mod record;
pub mod slug;

pub use bus::*;
pub use normalize::*;
pub use record::*;
pub use slug::*;
