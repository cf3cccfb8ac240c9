#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_serial::{Reply, Request};

#[derive(Debug, Arbitrary)]
enum Kind {
    Coils,
    Registers,
    WriteCoil(bool),
    WriteRegisters(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    kind: Kind,
    address: u16,
    count: u16,
    reply: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let request = match input.kind {
        Kind::Coils => Request::read_coils(input.address, input.count),
        Kind::Registers => Request::read_holding_registers(input.address, input.count),
        Kind::WriteCoil(value) => Ok(Request::write_coil(input.address, value)),
        Kind::WriteRegisters(n) => {
            let values: Vec<u16> = (0..n as u16).collect();
            Request::write_multiple_registers(input.address, &values)
        }
    };
    let Ok(request) = request else {
        return;
    };

    // The length decided by the first byte bounds what decoding may accept
    if let Some(&first) = input.reply.first() {
        let expected = request.reply_len(first);
        if first & 0x80 != 0 {
            assert_eq!(expected, 2);
        }
    }

    if let Ok(reply) = request.decode_reply(&input.reply) {
        assert_eq!(input.reply.len(), request.expected_reply_len());
        let quantity = request.quantity() as usize;
        match (&request, reply) {
            (Request::ReadCoils { .. }, Reply::Coils(coils)) => assert_eq!(coils.len(), quantity),
            (Request::ReadHoldingRegisters { .. }, Reply::Registers(registers)) => {
                assert_eq!(registers.len(), quantity)
            }
            (Request::WriteCoil { address, value }, Reply::CoilWritten { address: a, value: v }) => {
                assert_eq!((*address, *value), (a, v))
            }
            (Request::WriteMultipleRegisters { address, .. }, Reply::RegistersWritten { address: a, count }) => {
                assert_eq!((*address, quantity), (a, count as usize))
            }
            (request, reply) => panic!("{:?} decoded as {:?}", request, reply),
        }
    }
});
