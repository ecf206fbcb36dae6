/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public exchange gateway crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod error;
pub mod gateway;
pub mod paper;
pub mod types;

// Re-export the surface the engine consumes
pub use error::{ExchangeError, Result, message_looks_transient};
pub use gateway::{
    AccountCallback, ExchangeGateway, OrderCallback, PositionCallback, PriceCallback,
    StreamHandle,
};
pub use paper::PaperGateway;
pub use types::{
    AccountSnapshot, Order, OrderRequest, OrderStatus, OrderType, Position, PriceTick, Side,
};
