//! Deep links into payment apps for settling a split fare.

use carpool_types::{Profile, RoomId};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::source::SnapshotFetcher;

/// Where a rider sends their share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTarget {
    Toss { bank_name: String, account_no: String },
    PayPal { paypal_id: String },
}

impl PaymentTarget {
    pub fn link(&self, amount: u64) -> SyncResult<String> {
        match self {
            Self::Toss {
                bank_name,
                account_no,
            } => toss_link(amount, bank_name, account_no),
            Self::PayPal { paypal_id } => paypal_link(amount, paypal_id),
        }
    }
}

/// Payee details a profile has filled in. Toss needs both the bank and the
/// account number; a half-filled pair is left out.
pub fn payment_targets(profile: &Profile) -> Vec<PaymentTarget> {
    let filled = |field: &Option<String>| {
        field
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut targets = Vec::new();
    if let (Some(bank_name), Some(account_no)) = (filled(&profile.toss_bank_name), filled(&profile.toss_account_no)) {
        targets.push(PaymentTarget::Toss { bank_name, account_no });
    }
    if let Some(paypal_id) = filled(&profile.paypal_id) {
        targets.push(PaymentTarget::PayPal { paypal_id });
    }
    targets
}

/// Where the riders of a room pay their share: the host's payee details.
/// Empty when the room has no host or the host filled in nothing.
pub async fn host_payment_targets<B>(backend: &B, room_id: RoomId) -> SyncResult<Vec<PaymentTarget>>
where
    B: SnapshotFetcher + ?Sized,
{
    let room = backend
        .fetch_room(room_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("room {}", room_id)))?;
    let Some(host_id) = room.host_id else {
        debug!(room_id = %room_id, "room has no host");
        return Ok(Vec::new());
    };
    Ok(backend
        .fetch_profile(host_id)
        .await?
        .map(|profile| payment_targets(&profile))
        .unwrap_or_default())
}

pub fn toss_link(amount: u64, bank_name: &str, account_no: &str) -> SyncResult<String> {
    if bank_name.trim().is_empty() {
        return Err(SyncError::MissingField("bank_name"));
    }
    if account_no.trim().is_empty() {
        return Err(SyncError::MissingField("account_no"));
    }
    Ok(format!(
        "supertoss://send?amount={}&bank={}&accountNo={}",
        amount,
        urlencoding::encode(bank_name),
        urlencoding::encode(account_no)
    ))
}

pub fn paypal_link(amount: u64, paypal_id: &str) -> SyncResult<String> {
    if paypal_id.trim().is_empty() {
        return Err(SyncError::MissingField("paypal_id"));
    }
    Ok(format!(
        "https://paypal.me/{}/{}",
        urlencoding::encode(paypal_id),
        amount
    ))
}
