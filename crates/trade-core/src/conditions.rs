//! Pure entry / stop-loss / take-profit condition evaluation.
//!
//! Every check reads the spot row selected by its `*_type` column (equity
//! underlying vs. option instrument) and returns both the verdict and the
//! price it was decided on, so callers can log the signal price even when
//! nothing fires. Missing market data never fires a trigger; the row is
//! simply re-evaluated on the next tick.

use rust_decimal::Decimal;

use crate::types::{ActiveTrade, PriceBasis, Spot, TriggerCondition};

/// Outcome of a condition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub fired: bool,
    /// The price the decision was made on. `None` only for an `entry_cond =
    /// "now"` with no spot price, where the broker fill becomes the record
    /// of truth.
    pub price_used: Option<Decimal>,
}

impl Trigger {
    fn no() -> Self {
        Trigger {
            fired: false,
            price_used: None,
        }
    }

    fn decided(fired: bool, price: Decimal) -> Self {
        Trigger {
            fired,
            price_used: Some(price),
        }
    }
}

fn select_spot<'a>(
    basis: PriceBasis,
    spot_under: Option<&'a Spot>,
    spot_option: Option<&'a Spot>,
) -> Option<&'a Spot> {
    match basis {
        PriceBasis::Equity => spot_under,
        PriceBasis::Option => spot_option,
    }
}

/// Price feeding a check: last price for `now`/`at`, the timeframe candle
/// close for `ca`/`cb`.
fn condition_price(
    cond: TriggerCondition,
    tf: Option<&str>,
    spot: &Spot,
) -> Option<Decimal> {
    match cond {
        TriggerCondition::Now | TriggerCondition::At => spot.last_price,
        TriggerCondition::CloseAbove | TriggerCondition::CloseBelow => {
            spot.tf_close(tf?)
        }
    }
}

/// Should this waiting row open a position now?
pub fn check_entry(
    row: &ActiveTrade,
    spot_under: Option<&Spot>,
    spot_option: Option<&Spot>,
) -> Trigger {
    let Some(cond) = row.entry_condition() else {
        return Trigger::no();
    };

    let Some(spot) = select_spot(row.entry_basis(), spot_under, spot_option) else {
        return Trigger::no();
    };

    if cond == TriggerCondition::Now {
        // An immediate entry goes out even without a snapshot price; the
        // broker fill price becomes the recorded open.
        return Trigger {
            fired: true,
            price_used: spot.last_price,
        };
    }

    let Some(level) = row.entry_level else {
        return Trigger::no();
    };
    let Some(price) = condition_price(cond, row.entry_tf.as_deref(), spot) else {
        return Trigger::no();
    };

    let fired = match cond {
        TriggerCondition::Now => true,
        // Long/calls buy the touch of support; shorts/puts the touch of
        // resistance.
        TriggerCondition::At => {
            if row.profit_when_up() {
                price <= level
            } else {
                price >= level
            }
        }
        TriggerCondition::CloseAbove => price > level,
        TriggerCondition::CloseBelow => price < level,
    };
    Trigger::decided(fired, price)
}

/// Has the stop-loss been hit on a managed position?
pub fn check_sl(
    row: &ActiveTrade,
    spot_under: Option<&Spot>,
    spot_option: Option<&Spot>,
) -> Trigger {
    if row.sl_disabled() {
        return Trigger::no();
    }
    let Some(cond) = row.sl_condition() else {
        return Trigger::no();
    };

    let Some(spot) = select_spot(row.sl_basis(), spot_under, spot_option) else {
        return Trigger::no();
    };

    if cond == TriggerCondition::Now {
        // Immediate stop: close at whatever the market shows, but only if
        // it shows something.
        return match spot.last_price {
            Some(price) => Trigger::decided(true, price),
            None => Trigger::no(),
        };
    }

    let Some(level) = row.sl_level else {
        return Trigger::no();
    };
    let Some(price) = condition_price(cond, row.sl_tf.as_deref(), spot) else {
        return Trigger::no();
    };

    let fired = match cond {
        TriggerCondition::Now => true,
        TriggerCondition::At => {
            if row.profit_when_up() {
                price <= level
            } else {
                price >= level
            }
        }
        TriggerCondition::CloseAbove => price > level,
        TriggerCondition::CloseBelow => price < level,
    };
    Trigger::decided(fired, price)
}

/// Has the take-profit been reached? TP is always a touch-style threshold
/// on the last price of the `tp_type` instrument.
pub fn check_tp(
    row: &ActiveTrade,
    spot_under: Option<&Spot>,
    spot_option: Option<&Spot>,
) -> Trigger {
    if row.tp_disabled() {
        return Trigger::no();
    }
    let Some(level) = row.tp_level else {
        return Trigger::no();
    };

    let Some(spot) = select_spot(row.tp_basis(), spot_under, spot_option) else {
        return Trigger::no();
    };
    let Some(price) = spot.last_price else {
        return Trigger::no();
    };

    let fired = if row.profit_when_up() {
        price >= level
    } else {
        price <= level
    };
    Trigger::decided(fired, price)
}
