#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_serial::modbus::rtu::{decode_frame, encode_frame};
use voltage_serial::MAX_PDU_SIZE;

fuzz_target!(|data: &[u8]| {
    if let Ok((address, pdu)) = decode_frame(data) {
        assert!(!pdu.is_empty());
        // A frame that decodes re-encodes to the same bytes
        if pdu.len() <= MAX_PDU_SIZE {
            let frame = encode_frame(address, pdu).expect("PDU within limits");
            assert_eq!(&frame[..], data);
        }
    }
});
