#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_serial::{ConnectionSpec, FrameParams};

fuzz_target!(|data: &str| {
    if let Ok(params) = data.parse::<FrameParams>() {
        assert!(params.validate().is_ok());
        let reparsed: FrameParams = params.to_string().parse().expect("display round trip");
        assert_eq!(reparsed, params);
    }
    let _ = ConnectionSpec::parse(data);
});
