// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

use super::*;

#[test]
fn fake_clock_advances_epoch_and_instant() {
    let clock = FakeClock::new();
    let before = clock.epoch_ms();
    let before_instant = clock.now();
    clock.advance(Duration::from_millis(1500));
    assert_eq!(clock.epoch_ms(), before + 1500);
    assert!(clock.now() > before_instant);
}

#[test]
fn fake_clock_now_utc_reflects_epoch_ms() {
    let clock = FakeClock::new();
    clock.set_epoch_ms(1_700_000_000_000);
    assert_eq!(clock.now_utc().timestamp_millis(), 1_700_000_000_000);
}

#[test]
fn system_clock_now_utc_is_recent() {
    let clock = SystemClock;
    let now = clock.now_utc();
    assert!(now.timestamp() > 1_700_000_000);
}
