#![no_main]

use libfuzzer_sys::fuzz_target;
use metricollect_core::config::Config;

// A config that parses and renders must parse again.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = Config::from_toml_str(text) else {
        return;
    };
    let _ = config.build_registry();
    if let Ok(rendered) = config.to_toml_string() {
        Config::from_toml_str(&rendered).expect("rendered config reparses");
    }
});
