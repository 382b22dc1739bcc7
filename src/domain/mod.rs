pub mod arm;
pub mod context;
pub mod market;
pub mod records;
pub mod trade;

pub use arm::*;
pub use context::*;
pub use market::*;
pub use records::*;
pub use trade::*;
