pub mod account;
pub mod market;
pub mod order;
pub mod position;
pub mod reconciliation;
pub mod settlement;
pub mod trade;

pub use account::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use reconciliation::*;
pub use settlement::*;
pub use trade::*;
