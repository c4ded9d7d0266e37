// risk.rs — account equity cap enforcement.
//
// Narrowed from the teacher's `RiskManager` (which also tracked consecutive
// losses and daily drawdown for a market maker's own PnL) down to the one
// guard this engine needs: once the follower's account equity reaches the
// configured ceiling, new opens pause until an operator resumes. Unlike the
// teacher's time-boxed halts, this latch does not clear itself — equity
// dipping back under the cap is not sufficient, since the cap exists to stop
// runaway exposure, not to throttle losses.
use std::sync::atomic::{AtomicBool, Ordering};

use rust_decimal::Decimal;

pub struct RiskManager {
    max_account_equity: Option<Decimal>,
    paused: AtomicBool,
}

impl RiskManager {
    pub fn new(max_account_equity: Option<Decimal>) -> Self {
        Self { max_account_equity, paused: AtomicBool::new(false) }
    }

    /// Re-evaluates the latch against a freshly observed equity figure.
    /// Only ever transitions false -> true; clearing requires `resume()`.
    pub fn observe_equity(&self, equity: Decimal) {
        if let Some(max_equity) = self.max_account_equity {
            if equity >= max_equity && !self.paused.load(Ordering::SeqCst) {
                log::warn!("account equity {equity} reached cap {max_equity}; pausing new opens");
                self.paused.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        log::info!("risk pause cleared by operator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn latches_once_equity_reaches_cap_and_stays_latched() {
        let risk = RiskManager::new(Some(dec!(1000)));
        assert!(!risk.is_paused());
        risk.observe_equity(dec!(1000));
        assert!(risk.is_paused());
        risk.observe_equity(dec!(500));
        assert!(risk.is_paused(), "pause should not auto-clear when equity drops back below cap");
    }

    #[test]
    fn resume_clears_the_latch() {
        let risk = RiskManager::new(Some(dec!(1000)));
        risk.observe_equity(dec!(1000));
        assert!(risk.is_paused());
        risk.resume();
        assert!(!risk.is_paused());
    }

    #[test]
    fn no_cap_configured_never_pauses() {
        let risk = RiskManager::new(None);
        risk.observe_equity(dec!(1_000_000));
        assert!(!risk.is_paused());
    }
}
