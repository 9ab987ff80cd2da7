// Licensed under the Apache-2.0 license

use std::time::Duration;

use crate::device::GpuDevice;

/// The polled condition did not occur within its budget. Callers map
/// this into the stage-specific error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollExpired;

const POLL_INTERVAL_US: u64 = 10;

/// Poll `check` until it yields a value or `budget` elapses on the
/// device clock. Checks at least twice so a zero budget still samples
/// the condition once before and once after a yield.
pub fn wait_on<D: GpuDevice, T>(
    dev: &mut D,
    budget: Duration,
    mut check: impl FnMut(&mut D) -> Option<T>,
) -> Result<T, PollExpired> {
    let deadline = dev.ticks_us().saturating_add(budget.as_micros() as u64);
    loop {
        if let Some(value) = check(dev) {
            return Ok(value);
        }
        if dev.ticks_us() >= deadline {
            return check(dev).ok_or(PollExpired);
        }
        dev.sleep_us(POLL_INTERVAL_US);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::StubDevice;

    #[test]
    fn returns_value_once_condition_holds() {
        let mut dev = StubDevice::new();
        dev.regs.insert(0x40, 7);
        let v = wait_on(&mut dev, Duration::from_millis(1), |d| {
            let r = d.read_register(0x40);
            (r == 7).then_some(r)
        });
        assert_eq!(v, Ok(7));
    }

    #[test]
    fn expires_when_condition_never_holds() {
        let mut dev = StubDevice::new();
        let v: Result<(), _> = wait_on(&mut dev, Duration::from_micros(100), |_| None);
        assert_eq!(v, Err(PollExpired));
    }

    #[test]
    fn condition_flipping_mid_budget_is_caught() {
        let mut dev = StubDevice::new();
        let mut calls = 0;
        let v = wait_on(&mut dev, Duration::from_millis(10), |_| {
            calls += 1;
            (calls == 5).then_some(calls)
        });
        assert_eq!(v, Ok(5));
    }
}
