pub mod binance;
pub mod bybit;
pub mod gateio;
pub mod hyperliquid;
pub mod okx;
