//! Price calculation.
//!
//! Order of reductions: the best live product discount first, then the promo
//! code on top of the discounted price. Prices never go below zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::marketing::{Discount, PromoCode, PromoRejection};
use crate::models::payment::PaymentMethod;
use crate::models::product::Product;

/// Micro-USDT per US cent (USDT has 6 decimals).
pub const USDT_UNITS_PER_CENT: i64 = 10_000;

/// Final price of a product for one buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub product_id: Uuid,
    pub base_amount_cents: i64,
    pub discount_percent: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_code_id: Option<Uuid>,
    pub amount_cents: i64,
    /// TON price scaled by the same ratio as the USD price
    pub ton_amount_nano: i64,
    pub usdt_amount: i64,
}

impl Quote {
    /// Amount that must arrive, in the smallest unit of the method's asset.
    pub fn expected_amount(&self, method: PaymentMethod) -> i64 {
        match method {
            PaymentMethod::Ton => self.ton_amount_nano,
            PaymentMethod::Usdt => self.usdt_amount,
            PaymentMethod::Nowpayments => self.amount_cents,
        }
    }

    pub fn is_free(&self) -> bool {
        self.amount_cents == 0
    }
}

/// Price `product` at `now`.
///
/// `discounts` may contain discounts of other products or inactive ones; they
/// are filtered here. A promo code that does not apply rejects the quote
/// rather than being silently ignored.
pub fn quote(
    product: &Product,
    discounts: &[Discount],
    promo: Option<&PromoCode>,
    now: DateTime<Utc>,
) -> Result<Quote, PromoRejection> {
    let base = product.price_cents;

    let discount_percent = discounts
        .iter()
        .filter(|d| d.product_id == product.id && d.is_live(now))
        .map(|d| d.percent_off.clamp(0, 100))
        .max();

    let mut amount = match discount_percent {
        Some(percent) => apply_percent(base, percent),
        None => base,
    };

    if let Some(code) = promo {
        code.check(product.id, now)?;
        amount = match (code.percent_off, code.amount_off_cents) {
            (Some(percent), _) => apply_percent(amount, percent.clamp(0, 100)),
            (None, Some(off)) => (amount - off).max(0),
            (None, None) => amount,
        };
    }

    Ok(Quote {
        product_id: product.id,
        base_amount_cents: base,
        discount_percent,
        promo_code_id: promo.map(|p| p.id),
        amount_cents: amount,
        ton_amount_nano: scale(product.ton_price_nano, amount, base),
        usdt_amount: amount * USDT_UNITS_PER_CENT,
    })
}

fn apply_percent(amount: i64, percent_off: i32) -> i64 {
    amount * i64::from(100 - percent_off) / 100
}

/// `value * numerator / denominator` without overflowing for nanoton prices.
fn scale(value: i64, numerator: i64, denominator: i64) -> i64 {
    if denominator == 0 {
        return if numerator == 0 { 0 } else { value };
    }
    (i128::from(value) * i128::from(numerator) / i128::from(denominator)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::marketing::tests::promo;
    use chrono::Duration;

    fn product(price_cents: i64, ton_price_nano: i64) -> Product {
        let now = Utc::now();
        Product {
            id: Uuid::new_v4(),
            name: "VIP".to_string(),
            description: None,
            price_cents,
            ton_price_nano,
            duration_days: 30,
            demo_days: None,
            is_active: true,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn discount(product_id: Uuid, percent_off: i32) -> Discount {
        Discount {
            id: Uuid::new_v4(),
            product_id,
            percent_off,
            starts_at: None,
            ends_at: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn full_price_without_reductions() {
        let p = product(2000, 5_000_000_000);
        let q = quote(&p, &[], None, Utc::now()).unwrap();
        assert_eq!(q.amount_cents, 2000);
        assert_eq!(q.ton_amount_nano, 5_000_000_000);
        assert_eq!(q.usdt_amount, 20_000_000);
        assert_eq!(q.discount_percent, None);
    }

    #[test]
    fn best_live_discount_wins_and_others_are_ignored() {
        let p = product(2000, 5_000_000_000);
        let now = Utc::now();
        let mut expired = discount(p.id, 90);
        expired.ends_at = Some(now - Duration::days(1));
        let discounts = vec![
            discount(p.id, 10),
            discount(p.id, 25),
            discount(Uuid::new_v4(), 50),
            expired,
        ];

        let q = quote(&p, &discounts, None, now).unwrap();
        assert_eq!(q.discount_percent, Some(25));
        assert_eq!(q.amount_cents, 1500);
        assert_eq!(q.ton_amount_nano, 3_750_000_000);
    }

    #[test]
    fn promo_stacks_on_top_of_discount() {
        let p = product(2000, 4_000_000_000);
        let code = promo(Some(50), None);
        let q = quote(&p, &[discount(p.id, 10)], Some(&code), Utc::now()).unwrap();
        assert_eq!(q.amount_cents, 900);
        assert_eq!(q.promo_code_id, Some(code.id));
        assert_eq!(q.expected_amount(PaymentMethod::Usdt), 9_000_000);
        assert_eq!(q.expected_amount(PaymentMethod::Nowpayments), 900);
    }

    #[test]
    fn fixed_promo_floors_at_zero() {
        let p = product(500, 1_000_000_000);
        let code = promo(None, Some(1000));
        let q = quote(&p, &[], Some(&code), Utc::now()).unwrap();
        assert!(q.is_free());
        assert_eq!(q.ton_amount_nano, 0);
    }

    #[test]
    fn unusable_promo_rejects_the_quote() {
        let p = product(500, 1_000_000_000);
        let mut code = promo(Some(10), None);
        code.product_id = Some(Uuid::new_v4());
        assert_eq!(
            quote(&p, &[], Some(&code), Utc::now()),
            Err(PromoRejection::WrongProduct)
        );
    }
}
