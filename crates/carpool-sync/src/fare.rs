//! Fare arithmetic and display.

use crate::error::{SyncError, SyncResult};

/// Per-person share of `total`, rounded up so the payer is never short.
pub fn split_fare(total: u64, member_count: i64) -> SyncResult<u64> {
    if member_count <= 0 {
        return Err(SyncError::InvalidInput(format!(
            "member count must be greater than 0, got {}",
            member_count
        )));
    }
    Ok(total.div_ceil(member_count as u64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Currency {
    #[default]
    Krw,
    Usd,
}

/// `₩10,000` for won (whole units), `$1,234.50` for dollars. Halves round
/// away from zero.
pub fn format_currency(amount: f64, currency: Currency) -> String {
    let scale = match currency {
        Currency::Krw => 1.0,
        Currency::Usd => 100.0,
    };
    let units = (amount.abs() * scale).round() as u64;
    let sign = if amount < 0.0 && units > 0 { "-" } else { "" };
    match currency {
        Currency::Krw => format!("{}₩{}", sign, group_thousands(&units.to_string())),
        Currency::Usd => format!(
            "{}${}.{:02}",
            sign,
            group_thousands(&(units / 100).to_string()),
            units % 100
        ),
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
