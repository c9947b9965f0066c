pub mod account;
pub mod limits;
pub mod market;
pub mod order;
pub mod position;
pub mod stats;

pub use account::*;
pub use limits::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use stats::*;
