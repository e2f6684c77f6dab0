// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a whole `Bus` through its public API: discovery, identification,
//! polling, and ring readback, exercising the worker thread from the
//! outside rather than poking its internals.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drv_i2c_api::{AddrSlot, PollTimestampDecoder};
use drv_i2c_core::{AddressSet, Bus, BusConfig, DeviceTypeBuilder, DeviceTypeCatalog, ElemStatusCallback};
use drv_i2c_types::mock::MockI2cHardware;

fn vcnl4040() -> drv_i2c_core::DeviceTypeRecord {
    DeviceTypeBuilder::new("vcnl4040", AddressSet::List(vec![0x60]))
        .detection("0x0c=0b00001001")
        .unwrap()
        .init("0x0011")
        .unwrap()
        .poll("0x08=r2", 1, 4)
        .unwrap()
        .build(Arc::new(|raw: &[u8]| {
            vec![drv_i2c_core::PollSample {
                label: "prox",
                value: u16::from_le_bytes([raw[0], raw[1]]) as f64,
            }]
        }))
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn discovers_identifies_polls_and_yields_readable_ring_data() {
    let mut hw = MockI2cHardware::new();
    hw.add_device(0x60);
    hw.set_register(0x60, 0x0c, 0x09);
    hw.set_registers(0x60, 0x08, &[0x64, 0x00]);

    let catalog = Arc::new(DeviceTypeCatalog::new(vec![vcnl4040()]));
    let bus = Bus::start("end-to-end", BusConfig::default(), catalog, hw).unwrap();
    let address = AddrSlot::main_bus(0x60);

    let online_events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let online_events2 = Arc::clone(&online_events);
    let cb: ElemStatusCallback = Arc::new(move |changes| {
        online_events2
            .lock()
            .unwrap()
            .extend(changes.iter().map(|c| c.is_change_to_online));
    });
    bus.set_elem_status_callback(cb);

    assert!(
        wait_until(|| bus.is_online(address), Duration::from_secs(2)),
        "device never came online"
    );
    assert!(online_events.lock().unwrap().iter().any(|&v| v));

    assert!(
        wait_until(|| bus.poll_ring_count(address) >= 3, Duration::from_secs(2)),
        "poll ring never filled"
    );

    let mut decoder = PollTimestampDecoder::new();
    let mut last_ticks = None;
    for _ in 0..3 {
        let record = bus.poll_ring_pop(address).expect("ring should not be empty");
        let (ticks, payload) = decoder.decode_record(&record).expect("header should parse");
        assert_eq!(payload, &[0x64, 0x00]);
        if let Some(prev) = last_ticks {
            assert!(ticks >= prev, "decoded timestamps must be monotonic");
        }
        last_ticks = Some(ticks);
    }

    // One-shot request through the public synchronous `access` API.
    let outcome = bus.access(address, vec![0x0c], 1).unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.read_bytes, vec![0x09]);
}
