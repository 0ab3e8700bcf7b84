#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(config) = clarity::Config::from_toml_str(text) {
            // Validation must reject, never panic.
            let _ = config.validate();
            let _ = config.turn_settings();
            let _ = config.session_limits();
        }
    }
});
