// Order execution and position bookkeeping
pub mod gateway;
pub mod position_tracker;
pub mod price_window;

pub use gateway::{ExecutionGateway, PaperGateway};
pub use position_tracker::{Position, PositionTracker};
pub use price_window::PriceWindow;
