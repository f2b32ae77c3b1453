pub mod crc;
pub mod fsio;
