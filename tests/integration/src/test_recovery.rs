// Licensed under the Apache-2.0 license

//! Silent recovery of a faulting hub.

#[cfg(test)]
mod test {
    use crate::test::{start_emulator, test_config, TIMEOUT};
    use hub_ipc::persist::BootMode;
    use hub_ipc::{
        Direction, FaultKind, HubState, ImageError, LifecycleError, ScratchSlot, TransportError,
    };
    use poll_common::poll_until;
    use std::time::{Duration, Instant};

    #[test]
    fn test_firmware_fault_recovers() {
        let emulator = start_emulator(test_config());
        emulator.firmware.raise_fault(0xbad0_0001).unwrap();
        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator.wait_for_state(HubState::Running, TIMEOUT).unwrap();

        let stats = emulator.lifecycle.stats();
        assert_eq!(stats.resets_completed, 1);
        assert!(stats.faults.is_empty());
        let fw = emulator.firmware.stats();
        assert_eq!(fw.boots, 2);
        // A soft reset tells the hub first.
        assert_eq!(fw.shutdowns, 1);

        let dump = emulator.lifecycle.last_dump().unwrap();
        assert_eq!(dump.reason, format!("{:?}", FaultKind::FwFault));
        assert_eq!(dump.state, HubState::Error);
        assert!(dump
            .scratch
            .contains(&(ScratchSlot::FaultCode, 0xbad0_0001)));
        assert_eq!(dump.call_stack[0], "hub_main+0x24");
        assert_eq!(dump.call_stack[1], "ipc_dispatch+0x10");
        assert_eq!(dump.call_stack[2], "0xffff0000");
        assert!(dump.registers.iter().any(|(name, _)| name == "mcuctrl"));
        assert_eq!(dump.debug_values[0], 1);
        assert!(dump.snapshot.is_some());
        assert_eq!(dump.shared_memory.len(), emulator.mem.len());

        let token = emulator.lifecycle.get_token().unwrap();
        assert_eq!(token.persist().boot_mode().unwrap(), BootMode::Warm);
        assert_eq!(token.debug_values()[0], 2);
        drop(token);

        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        let rx = transport.open_channel(Direction::HubToAp);
        transport.send(&tx, b"still here").unwrap();
        assert_eq!(transport.recv(&rx, TIMEOUT).unwrap(), b"still here");
    }

    #[test]
    fn test_reboot_request() {
        let emulator = start_emulator(test_config());
        emulator.firmware.request_reboot().unwrap();
        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator.wait_for_state(HubState::Running, TIMEOUT).unwrap();
        assert_eq!(
            emulator.lifecycle.last_dump().unwrap().reason,
            format!("{:?}", FaultKind::HubReboot)
        );
        assert_eq!(emulator.firmware.stats().boots, 2);
    }

    #[test]
    fn test_token_refused_while_resetting() {
        let emulator = start_emulator(test_config());
        emulator
            .platform
            .set_load_delay(Duration::from_millis(300));

        let lifecycle = emulator.lifecycle.clone();
        let resetter = std::thread::spawn(move || lifecycle.reset(true, "test"));
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            Ok(emulator.lifecycle.in_reset())
        })
        .unwrap();

        let start = Instant::now();
        assert!(matches!(
            emulator.lifecycle.get_token(),
            Err(LifecycleError::ResetInProgress)
        ));
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        assert_eq!(transport.send(&tx, b"x"), Err(TransportError::Unavailable));
        assert!(start.elapsed() < Duration::from_millis(100));

        resetter.join().unwrap().unwrap();
        assert_eq!(emulator.lifecycle.state(), HubState::Running);
        assert_eq!(emulator.lifecycle.stats().tokens_held, 0);
        transport.send(&tx, b"x").unwrap();
    }

    #[test]
    fn test_mute_hub_ends_in_reset_failed() {
        let emulator = start_emulator(test_config());
        emulator.firmware.set_responding(false);
        assert!(matches!(
            emulator.lifecycle.check_alive(),
            Err(LifecycleError::NotResponding)
        ));
        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator
            .wait_for_state(HubState::ResetFailed, TIMEOUT)
            .unwrap();
        // Forced: the hub was not asked to shut down.
        assert_eq!(emulator.firmware.stats().shutdowns, 0);
        assert_eq!(emulator.lifecycle.stats().resets_failed, 1);

        emulator.firmware.set_responding(true);
        emulator.lifecycle.reset(true, "operator").unwrap();
        assert_eq!(emulator.lifecycle.state(), HubState::Running);
    }

    #[test]
    fn test_failed_image_load_is_fatal() {
        let emulator = start_emulator(test_config());
        emulator.platform.set_fail_load(true);
        emulator.firmware.raise_fault(0x1).unwrap();
        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator
            .wait_for_state(HubState::ResetFailed, TIMEOUT)
            .unwrap();

        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        let err = transport.send(&tx, b"x").unwrap_err();
        assert_eq!(err, TransportError::Fatal);
        assert!(!err.is_transient());
        assert!(!emulator.firmware.is_running());

        emulator.platform.set_fail_load(false);
        assert!(matches!(
            emulator.lifecycle.get_token(),
            Err(LifecycleError::ResetFailed)
        ));
        emulator.lifecycle.power_off().unwrap();
        emulator.lifecycle.power_on().unwrap();
        transport.send(&tx, b"x").unwrap();
    }

    #[test]
    fn test_reset_reports_image_error() {
        let emulator = start_emulator(test_config());
        emulator.platform.set_fail_load(true);
        let slot = emulator.config.reset.firmware_slot;
        assert_eq!(
            emulator.lifecycle.reset(true, "manual"),
            Err(LifecycleError::Image(ImageError::Verification(slot)))
        );
    }

    #[test]
    fn test_dumps_are_rate_limited() {
        let mut config = test_config();
        config.reset.dump_min_interval_ms = 60_000;
        let emulator = start_emulator(config);

        emulator.firmware.raise_fault(0x1).unwrap();
        emulator.wait_for_resets(1, TIMEOUT).unwrap();
        emulator.wait_for_state(HubState::Running, TIMEOUT).unwrap();
        let first = emulator.lifecycle.last_dump().unwrap();

        emulator.firmware.request_reboot().unwrap();
        emulator.wait_for_resets(2, TIMEOUT).unwrap();
        emulator.wait_for_state(HubState::Running, TIMEOUT).unwrap();
        let second = emulator.lifecycle.last_dump().unwrap();
        assert_eq!(second.reason, first.reason);
        assert_eq!(second.taken_at, first.taken_at);

        // On-demand capture is never limited.
        let now = emulator.lifecycle.capture_postmortem();
        assert_eq!(now.state, HubState::Running);
        assert!(now.taken_at >= first.taken_at);
    }
}
