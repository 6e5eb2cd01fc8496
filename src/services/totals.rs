use tracing::warn;

use super::validation::ValidatedModification;

/// Amount changes implied by a validated modification, all in integer
/// minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalsDelta {
    pub old_line_total: i64,
    pub new_line_total: i64,
    pub delta: i64,
    pub new_order_total: i64,
    pub new_authorization_amount: i64,
    /// False when the tax-inclusive price was absent and the calculator
    /// fell back to the tax-exclusive base amount.
    pub used_tax_inclusive: bool,
}

/// Pure computation over the validated snapshot.
///
/// The unit price is the tax-inclusive calculated price; when the
/// tax-inclusive amount is absent the tax-exclusive base is used, which
/// is an explicit, logged degradation rather than a silent default.
pub fn compute(validated: &ValidatedModification) -> TotalsDelta {
    let (unit_price, used_tax_inclusive) = match validated.tax_inclusive_unit_price {
        Some(price) => (price, true),
        None => {
            warn!(
                order_id = %validated.order.id,
                unit_price = validated.unit_price,
                "tax-inclusive unit price missing; falling back to tax-exclusive base amount"
            );
            (validated.unit_price, false)
        }
    };

    let old_line_total = unit_price * i64::from(validated.old_quantity);
    let new_line_total = unit_price * i64::from(validated.new_quantity);
    let delta = new_line_total - old_line_total;

    TotalsDelta {
        old_line_total,
        new_line_total,
        delta,
        new_order_total: validated.order.total_amount + delta,
        new_authorization_amount: validated.authorization.amount + delta,
        used_tax_inclusive,
    }
}
