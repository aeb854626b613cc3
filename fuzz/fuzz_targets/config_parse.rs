//! Fuzz target for configuration parsing
//!
//! Arbitrary TOML must either load into a validated engine configuration or
//! fail cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use udx_core::UdxConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        if let Ok(config) = UdxConfig::from_toml(s) {
            // Anything that loads must also pass validation
            assert!(config.validate().is_ok());
        }
    }
});
