// Licensed under the Apache-2.0 license

//! Data and event traffic between the AP and the emulated hub.

#[cfg(test)]
mod test {
    use crate::test::{start_emulator, test_config, TIMEOUT};
    use hub_ipc::{Direction, EventCode, FaultKind, HubState, TransportError};
    use poll_common::poll_until;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_echo_traffic() {
        let emulator = start_emulator(test_config());
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        let rx = transport.open_channel(Direction::HubToAp);

        for i in 0..50u32 {
            let payload: Vec<u8> = (0..transport.max_payload())
                .map(|b| (b as u32 ^ i) as u8)
                .collect();
            transport.send(&tx, &payload).unwrap();
            assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), payload);
        }
        assert_eq!(emulator.firmware.stats().echoed, 50);
        assert!(emulator.lifecycle.stats().faults.is_empty());
    }

    #[test]
    fn test_event_callback() {
        let emulator = start_emulator(test_config());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let transport = emulator.transport();
        transport.register_event_callback(EventCode::DataReady, move |desc| {
            assert_eq!(desc.event(), Ok(EventCode::DataReady));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emulator.firmware.send(b"unsolicited").unwrap();
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            Ok(seen.load(Ordering::SeqCst) == 1)
        })
        .unwrap();
        let rx = transport.open_channel(Direction::HubToAp);
        assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), b"unsolicited");
    }

    #[test]
    fn test_repeated_full_ring_resets_once() {
        let emulator = start_emulator(test_config());
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        let rx = transport.open_channel(Direction::HubToAp);
        emulator.firmware.pause();

        let slots = emulator.config.geometry.data_slots;
        for _ in 0..slots - 1 {
            transport.send(&tx, b"queued").unwrap();
        }
        let threshold = emulator.config.thresholds.minor;
        for _ in 0..threshold {
            assert_eq!(transport.send(&tx, b"overflow"), Err(TransportError::Busy));
        }
        // A reset is pending or running; more failures do not add one.
        let _ = transport.send(&tx, b"overflow");

        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator.wait_for_state(HubState::Running, TIMEOUT).unwrap();
        let stats = emulator.lifecycle.stats();
        assert_eq!(stats.resets_scheduled, 1);
        assert_eq!(stats.resets_completed, 1);
        assert_eq!(emulator.firmware.stats().boots, 2);
        assert_eq!(
            emulator.lifecycle.last_dump().unwrap().reason,
            format!("{:?}", FaultKind::WriteFail)
        );

        // The new hub boot starts with empty rings.
        transport.send(&tx, b"fresh").unwrap();
        assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), b"fresh");
    }

    #[test]
    fn test_empty_event_ring_dequeue() {
        let emulator = start_emulator(test_config());
        let token = emulator.lifecycle.get_token().unwrap();
        let ring = token.events(Direction::HubToAp);
        let before = ring.indices();
        assert_eq!(ring.dequeue().unwrap(), None);
        assert_eq!(ring.indices(), before);
        assert!(ring.is_empty().unwrap());
    }

    #[test]
    fn test_unsignalled_slot_is_skipped() {
        let mut config = test_config();
        config.geometry.data_slots = 32;
        let emulator = start_emulator(config);
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        let rx = transport.open_channel(Direction::HubToAp);
        emulator.firmware.pause();

        // The event ring runs out before the data ring does.
        let mut sent = 0u8;
        let failed = loop {
            match transport.send(&tx, &[sent]) {
                Ok(()) => sent += 1,
                Err(err) => break err,
            }
            assert!(sent < 32, "event ring never filled");
        };
        assert_eq!(failed, TransportError::Busy);
        assert_eq!(
            emulator.lifecycle.stats().faults,
            [(FaultKind::EventLost, 1)]
        );
        let (eq, _) = emulator
            .lifecycle
            .get_token()
            .unwrap()
            .data(Direction::ApToHub)
            .indices();
        assert_eq!(eq, sent as u32 + 1);

        emulator.firmware.resume();
        transport.send(&tx, &[0xee]).unwrap();

        for i in 0..sent {
            assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), [i]);
        }
        assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), [0xee]);
        assert_eq!(
            transport.recv(&rx, Duration::from_millis(20)),
            Err(TransportError::Timeout)
        );
        assert_eq!(emulator.lifecycle.stats().resets_scheduled, 0);
    }
}
