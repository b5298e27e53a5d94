// Licensed under the Apache-2.0 license

mod test_boot;
mod test_channels;
mod test_log;
mod test_recovery;

#[cfg(test)]
mod test {
    use hub_config::HubConfig;
    use hub_emulator::HubEmulator;
    use log::LevelFilter;
    use simple_logger::SimpleLogger;
    use std::time::Duration;

    pub const TIMEOUT: Duration = Duration::from_secs(5);

    pub fn init_logger() {
        let _ = SimpleLogger::new().with_level(LevelFilter::Info).init();
    }

    /// Defaults with alive checks short enough for a mute hub to be
    /// noticed quickly and no rate limit on postmortem dumps.
    pub fn test_config() -> HubConfig {
        let mut config = HubConfig::default();
        config.alive.timeout_ms = 100;
        config.alive.tries = 2;
        config.reset.dump_min_interval_ms = 0;
        config
    }

    pub fn start_emulator(config: HubConfig) -> HubEmulator {
        init_logger();
        let emulator = HubEmulator::new(config).unwrap();
        emulator.lifecycle.power_on().unwrap();
        emulator
    }
}
