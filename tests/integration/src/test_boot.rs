// Licensed under the Apache-2.0 license

//! Power-on, negotiation and power cycling.

#[cfg(test)]
mod test {
    use crate::test::{init_logger, start_emulator, test_config, TIMEOUT};
    use hub_config::HubConfig;
    use hub_emulator::HubEmulator;
    use hub_ipc::persist::BootMode;
    use hub_ipc::{Direction, HubState, LifecycleError, TransportError};
    use poll_common::poll_until;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_fresh_boot_reaches_running() {
        let emulator = start_emulator(test_config());
        let lifecycle = &emulator.lifecycle;
        assert_eq!(lifecycle.state(), HubState::Running);
        lifecycle.check_alive().unwrap();

        let token = lifecycle.get_token().unwrap();
        token.alive().ping(Duration::from_millis(500)).unwrap();
        let layout = token.layout();
        let map = &emulator.config.memory_map;
        assert_eq!(layout.ipc.base, map.ipc_offset as usize);
        assert_eq!(
            emulator.platform.access_window(),
            Some((layout.ram.base, layout.ram.size))
        );

        assert_eq!(token.persist().boot_mode().unwrap(), BootMode::Cold);
        assert_eq!(
            token.persist().log_level().unwrap(),
            emulator.config.log.runtime_level
        );
        let table = token.sensor_table();
        assert_eq!(table.len(), emulator.config.geometry.sensor_table_size as usize);
        assert_eq!(table[5], 5);
        assert_eq!(token.debug_values()[0], 1);
        assert_eq!(emulator.firmware.stats().boots, 1);
        assert_eq!(emulator.platform.loads(), 1);
    }

    #[test]
    fn test_log_level_reaches_hub() {
        let emulator = start_emulator(test_config());
        emulator.lifecycle.set_log_level(5).unwrap();
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            Ok(emulator.firmware.stats().log_level_updates == 1)
        })
        .unwrap();
        let token = emulator.lifecycle.get_token().unwrap();
        assert_eq!(token.persist().log_level().unwrap(), 5);
    }

    #[test]
    fn test_power_cycle_is_a_cold_boot() {
        let emulator = start_emulator(test_config());
        let lifecycle = &emulator.lifecycle;
        lifecycle.set_log_level(6).unwrap();
        lifecycle
            .get_token()
            .unwrap()
            .persist()
            .set_governor(0, 9)
            .unwrap();

        lifecycle.power_off().unwrap();
        assert_eq!(lifecycle.state(), HubState::NoPower);
        assert!(!emulator.platform.is_powered());
        assert!(!emulator.firmware.is_running());
        assert!(matches!(
            lifecycle.get_token(),
            Err(LifecycleError::NotRunning)
        ));
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        assert_eq!(transport.send(&tx, b"x"), Err(TransportError::Unavailable));

        lifecycle.power_on().unwrap();
        assert_eq!(lifecycle.state(), HubState::Running);
        let token = lifecycle.get_token().unwrap();
        assert_eq!(token.persist().boot_mode().unwrap(), BootMode::Cold);
        assert_eq!(
            token.persist().log_level().unwrap(),
            emulator.config.log.runtime_level
        );
        assert_eq!(token.persist().governor(0).unwrap(), 0);
        assert_eq!(emulator.firmware.stats().boots, 2);
    }

    #[test]
    fn test_config_file_geometry() {
        init_logger();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[geometry]\ndata_slots = 4\n\n[alive]\ntimeout_ms = 100\ntries = 2\n"
        )
        .unwrap();
        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.geometry.data_slots, 4);

        let emulator = HubEmulator::new(config).unwrap();
        emulator.lifecycle.power_on().unwrap();
        emulator.firmware.pause();
        let transport = emulator.transport();
        let tx = transport.open_channel(Direction::ApToHub);
        for _ in 0..3 {
            transport.send(&tx, b"slot").unwrap();
        }
        assert_eq!(transport.send(&tx, b"slot"), Err(TransportError::Busy));
        emulator.firmware.resume();
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            Ok(emulator.firmware.backlog() == 0)
        })
        .unwrap();
    }

    #[test]
    fn test_boot_fails_without_alive_answer() {
        init_logger();
        let emulator = HubEmulator::new(test_config()).unwrap();
        emulator.firmware.set_responding(false);
        assert!(matches!(
            emulator.lifecycle.power_on(),
            Err(LifecycleError::NotResponding)
        ));
        assert_eq!(emulator.lifecycle.state(), HubState::NotResponding);

        emulator.firmware.set_responding(true);
        emulator.lifecycle.check_alive().unwrap();
        assert_eq!(emulator.lifecycle.state(), HubState::Running);
    }
}
