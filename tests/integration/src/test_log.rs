// Licensed under the Apache-2.0 license

//! Hub log ring draining, with and without the AP asleep.

#[cfg(test)]
mod test {
    use crate::test::{start_emulator, test_config, TIMEOUT};
    use hub_emulator::firmware::LOG_INFO;
    use poll_common::poll_until;
    use std::time::Duration;

    #[test]
    fn test_threshold_triggers_drain() {
        let emulator = start_emulator(test_config());
        let records = emulator.config.geometry.log_records;
        let threshold = records * emulator.config.log.flush_threshold_pct / 100;
        // With the boot banner this is exactly the flush threshold.
        for i in 0..threshold - 1 {
            emulator
                .firmware
                .emit_log(LOG_INFO, &format!("sample {i}"))
                .unwrap();
        }

        // Nobody on the AP asked for it; the hub's flush request did.
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            let token = emulator.lifecycle.get_token()?;
            let log = token.log().indices();
            Ok(log.dequeue == log.enqueue && !token.log().flush_requested())
        })
        .unwrap();
        let token = emulator.lifecycle.get_token().unwrap();
        assert_eq!(token.log().indices().dequeue, threshold);
        assert_eq!(token.log().drop_count(), 0);
    }

    #[test]
    fn test_manual_drain() {
        let emulator = start_emulator(test_config());
        for i in 0..5 {
            emulator
                .firmware
                .emit_log(LOG_INFO, &format!("line {i}"))
                .unwrap();
        }
        // Boot banner plus five lines.
        assert_eq!(emulator.lifecycle.drain_log(), 6);
        assert_eq!(emulator.lifecycle.drain_log(), 0);
    }

    #[test]
    fn test_sleeping_ap_defers_flush() {
        let emulator = start_emulator(test_config());
        let lifecycle = &emulator.lifecycle;
        lifecycle.set_ap_sleep(true).unwrap();

        let records = emulator.config.geometry.log_records;
        for i in 0..records + records / 2 {
            emulator
                .firmware
                .emit_log(LOG_INFO, &format!("overnight {i}"))
                .unwrap();
        }
        {
            let token = lifecycle.get_token().unwrap();
            let log = token.log();
            assert!(log.flush_requested());
            assert!(log.overwrite_count() > 0);
            assert!(log.indices().full);
            assert_eq!(log.indices().dequeue, 0);
            assert!(token.ap_sleep());
        }
        assert_eq!(lifecycle.drain_log(), 0);

        lifecycle.set_ap_sleep(false).unwrap();
        poll_until(TIMEOUT, Duration::from_millis(1), || {
            let token = lifecycle.get_token()?;
            let log = token.log().indices();
            Ok(!log.full && log.dequeue == log.enqueue)
        })
        .unwrap();
        assert!(!lifecycle.get_token().unwrap().log().flush_requested());
    }
}
