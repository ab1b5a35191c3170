//! Target chip support.

pub mod esp8266;
