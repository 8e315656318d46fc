//! Raw rows to canonical model.
//!
//! The normalizer is written against [`RowAccess`] only, so tabular exports
//! and API records go through the same code. Field names are looked up via
//! alias lists: the tabular export's Dutch headers first, then API keys.
//!
//! Malformed rows (no ref, unparseable timestamp, no amount) are counted in
//! `skipped_rows` and otherwise ignored.

pub mod dates;
pub mod phone;

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use unicode_normalization::UnicodeNormalization;

use crate::source::{RawBatch, RowAccess};
use crate::types::{
    Booking, Member, PaymentEvent, ProductSubscription, RiskAssessment, SubscriptionStatus,
    VisitEvent,
};

pub use dates::{days_between, parse_date, parse_day};
pub use phone::normalize_phone;

/// Field alias lists.
pub mod fields {
    pub const MEMBER_REF: &[&str] = &["Klant ref.", "ref"];
    pub const FIRST_NAME: &[&str] = &["Klant voornaam", "firstName"];
    pub const LAST_NAME: &[&str] = &["Klant achternaam", "lastName"];
    pub const EMAIL: &[&str] = &["Klant e-mailadres", "email"];
    pub const PHONE: &[&str] = &["Klant telefoonnummer", "phone"];
    pub const PRODUCT: &[&str] = &["Naam van product", "productName"];
    pub const PRICE: &[&str] = &["Tarief", "price"];
    pub const STATUS: &[&str] = &["Status", "status"];
    pub const VALID_FROM: &[&str] = &["Actief sinds", "validFrom"];
    pub const VALID_UNTIL: &[&str] = &["Actief tot", "Einddatum", "validUntil"];
    pub const CREATED_AT: &[&str] = &["Aangemaakt op", "createdAt"];
    pub const LAST_VISIT: &[&str] = &["Laatste bezoek", "lastVisit"];

    pub const VISIT_MEMBER_REF: &[&str] = &["clientRef", "Klant ref."];
    pub const VISIT_FIRST_NAME: &[&str] = &["first_name", "Klant voornaam"];
    pub const VISIT_LAST_NAME: &[&str] = &["last_name", "Klant achternaam"];
    pub const VISIT_START: &[&str] = &["start_datetime", "start"];
    pub const SESSION_REF: &[&str] = &["sessionRef", "session_ref"];
    pub const SESSION_STATUS: &[&str] = &["sessionStatus"];
    pub const BOOKING_STATUS: &[&str] = &["bookingStatus"];
    pub const PRESENT: &[&str] = &["present", "Aanwezig"];

    pub const PAYMENT_MEMBER_REF: &[&str] = &["clientRef", "Klant ref."];
    pub const PAYMENT_AMOUNT: &[&str] = &["amountInVat", "Bedrag"];
    pub const PAYMENT_DATE: &[&str] = &["orderDate", "Datum"];
    pub const PAYMENT_STATUS: &[&str] = &["status", "Status"];
}

/// Trailing visit-count windows.
pub const WINDOW_30D: i64 = 30;
pub const WINDOW_90D: i64 = 90;

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub phone_country_code: String,
    pub ltv_window_start: NaiveDate,
}

impl NormalizeOptions {
    pub fn from_config(config: &crate::types::Config) -> Self {
        Self {
            phone_country_code: config.phone_country_code.clone(),
            ltv_window_start: config.ltv_window_start,
        }
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            phone_country_code: "31".to_string(),
            ltv_window_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
        }
    }
}

/// One normalization pass over a raw batch.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Active members, unscored, in first-seen order.
    pub members: Vec<Member>,
    /// Every subscription row with a product and a known status, for all
    /// customers (active or not).
    pub subscriptions: Vec<ProductSubscription>,
    pub bookings: Vec<Booking>,
    /// Attended bookings resolved to a member, at or before `now`.
    pub visits: Vec<VisitEvent>,
    pub payments: Vec<PaymentEvent>,
    pub skipped_rows: usize,
}

/// Per-customer accumulator while walking membership rows.
struct CustomerGroup {
    member_ref: String,
    first_name: String,
    last_name: String,
    email: String,
    phone: String,
    created_at: Option<NaiveDateTime>,
    last_visit_hint: Option<NaiveDateTime>,
    status: Option<String>,
    products: Vec<String>,
    fee_total: f64,
    earliest_active_from: Option<NaiveDateTime>,
}

/// Normalize a raw batch as of `now`.
pub fn normalize(batch: &RawBatch, opts: &NormalizeOptions, now: NaiveDateTime) -> NormalizedBatch {
    let mut out = NormalizedBatch {
        skipped_rows: batch.skipped,
        ..Default::default()
    };

    let groups = group_customers(batch, opts, &mut out);
    out.members = groups.into_iter().filter_map(into_member).collect();

    collect_bookings(batch, now, &mut out);
    apply_visit_stats(&mut out, now);

    collect_payments(batch, &mut out);
    apply_payment_stats(&mut out.members, &out.payments, opts.ltv_window_start);

    if out.skipped_rows > 0 {
        log::info!("Normalizer skipped {} malformed rows", out.skipped_rows);
    }
    log::debug!(
        "Normalized {} members, {} subscriptions, {} bookings, {} visits, {} payments",
        out.members.len(),
        out.subscriptions.len(),
        out.bookings.len(),
        out.visits.len(),
        out.payments.len()
    );
    out
}

fn text<R: RowAccess>(row: &R, aliases: &[&str]) -> String {
    row.first_of(aliases)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn group_customers(
    batch: &RawBatch,
    opts: &NormalizeOptions,
    out: &mut NormalizedBatch,
) -> Vec<CustomerGroup> {
    let mut groups: Vec<CustomerGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in &batch.members {
        let member_ref = text(row, fields::MEMBER_REF);
        if member_ref.is_empty() {
            log::debug!("Skipping membership row without a customer ref");
            out.skipped_rows += 1;
            continue;
        }

        let slot = *index.entry(member_ref.clone()).or_insert_with(|| {
            groups.push(CustomerGroup {
                member_ref: member_ref.clone(),
                first_name: text(row, fields::FIRST_NAME),
                last_name: text(row, fields::LAST_NAME),
                email: text(row, fields::EMAIL),
                phone: normalize_phone(&text(row, fields::PHONE), &opts.phone_country_code),
                created_at: row.first_of(fields::CREATED_AT).and_then(|v| parse_date(&v)),
                last_visit_hint: None,
                status: None,
                products: Vec::new(),
                fee_total: 0.0,
                earliest_active_from: None,
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];

        let hint = row.first_of(fields::LAST_VISIT).and_then(|v| parse_date(&v));
        group.last_visit_hint = group.last_visit_hint.max(hint);

        let raw_status = text(row, fields::STATUS);
        let status = SubscriptionStatus::classify(&raw_status);
        let product = text(row, fields::PRODUCT);
        let price = row
            .first_of(fields::PRICE)
            .and_then(|v| parse_amount(&v))
            .unwrap_or(0.0);
        let valid_from = row.first_of(fields::VALID_FROM).and_then(|v| parse_date(&v));
        let valid_until = row.first_of(fields::VALID_UNTIL).and_then(|v| parse_date(&v));

        if let (Some(status), false) = (status, product.is_empty()) {
            out.subscriptions.push(ProductSubscription {
                member_ref: member_ref.clone(),
                product_name: product.clone(),
                status,
                valid_from: valid_from.map(|d| d.date()),
                valid_until: valid_until.map(|d| d.date()),
                price,
            });
        }

        if status == Some(SubscriptionStatus::Active) {
            if group.status.is_none() {
                group.status = Some(raw_status);
            }
            if !product.is_empty() && !group.products.contains(&product) {
                group.products.push(product);
            }
            group.fee_total += price;
            if let Some(from) = valid_from {
                group.earliest_active_from = Some(match group.earliest_active_from {
                    Some(current) => current.min(from),
                    None => from,
                });
            }
        }
    }

    groups
}

fn into_member(group: CustomerGroup) -> Option<Member> {
    let status = group.status?;
    Some(Member {
        member_ref: group.member_ref,
        first_name: group.first_name,
        last_name: group.last_name,
        email: group.email,
        phone: group.phone,
        active_products: group.products,
        nominal_fee_total: group.fee_total,
        status,
        member_since: group.earliest_active_from.or(group.created_at),
        last_visit: group.last_visit_hint,
        visits_30d: 0,
        visits_90d: 0,
        risk_assessment: RiskAssessment::default(),
        ltv: 0.0,
        payment_count: 0,
        last_payment_date: None,
    })
}

/// Case-, whitespace- and composition-insensitive key for name matching.
pub fn name_key(first: &str, last: &str) -> (String, String) {
    let fold = |s: &str| s.trim().nfc().collect::<String>().to_lowercase();
    (fold(first), fold(last))
}

fn is_canceled(status: &str) -> bool {
    matches!(status.trim().to_lowercase().as_str(), "canceled" | "cancelled" | "geannuleerd")
}

fn collect_bookings(batch: &RawBatch, now: NaiveDateTime, out: &mut NormalizedBatch) {
    let mut by_name: HashMap<(String, String), Vec<String>> = HashMap::new();
    for member in &out.members {
        by_name
            .entry(name_key(&member.first_name, &member.last_name))
            .or_default()
            .push(member.member_ref.clone());
    }

    for row in &batch.visits {
        let Some(occurred_at) = row.first_of(fields::VISIT_START).and_then(|v| parse_date(&v))
        else {
            log::debug!("Skipping visit row without a parseable timestamp");
            out.skipped_rows += 1;
            continue;
        };

        if is_canceled(&text(row, fields::SESSION_STATUS))
            || is_canceled(&text(row, fields::BOOKING_STATUS))
        {
            continue;
        }

        let present = row
            .first_of(fields::PRESENT)
            .and_then(|v| parse_flag(&v))
            .unwrap_or(true);

        let direct = text(row, fields::VISIT_MEMBER_REF);
        let refs: Vec<String> = if !direct.is_empty() {
            vec![direct]
        } else {
            let key = name_key(
                &text(row, fields::VISIT_FIRST_NAME),
                &text(row, fields::VISIT_LAST_NAME),
            );
            by_name.get(&key).cloned().unwrap_or_default()
        };

        let session_key = {
            let session_ref = text(row, fields::SESSION_REF);
            if session_ref.is_empty() {
                occurred_at.format("%Y-%m-%d %H:%M:%S").to_string()
            } else {
                session_ref
            }
        };

        if present && occurred_at <= now {
            out.visits.extend(refs.iter().map(|r| VisitEvent {
                member_ref: r.clone(),
                occurred_at,
            }));
        }

        out.bookings.push(Booking {
            member_refs: refs,
            session_key,
            occurred_at,
            present,
        });
    }
}

fn apply_visit_stats(out: &mut NormalizedBatch, now: NaiveDateTime) {
    let since_30 = now - Duration::days(WINDOW_30D);
    let since_90 = now - Duration::days(WINDOW_90D);

    let mut by_member: HashMap<&str, Vec<NaiveDateTime>> = HashMap::new();
    for visit in &out.visits {
        by_member
            .entry(visit.member_ref.as_str())
            .or_default()
            .push(visit.occurred_at);
    }

    for member in &mut out.members {
        let Some(times) = by_member.get(member.member_ref.as_str()) else {
            continue;
        };
        member.visits_30d = times.iter().filter(|t| **t >= since_30).count() as u32;
        member.visits_90d = times.iter().filter(|t| **t >= since_90).count() as u32;
        let latest = times.iter().max().copied();
        member.last_visit = member.last_visit.max(latest);
    }
}

fn collect_payments(batch: &RawBatch, out: &mut NormalizedBatch) {
    for row in &batch.payments {
        let member_ref = text(row, fields::PAYMENT_MEMBER_REF);
        let amount = row.first_of(fields::PAYMENT_AMOUNT).and_then(|v| parse_amount(&v));
        let paid_at = row.first_of(fields::PAYMENT_DATE).and_then(|v| parse_day(&v));

        match (member_ref.is_empty(), amount, paid_at) {
            (false, Some(amount), Some(paid_at)) => out.payments.push(PaymentEvent {
                member_ref,
                amount,
                paid_at,
                status: text(row, fields::PAYMENT_STATUS),
            }),
            _ => {
                log::debug!("Skipping payment row missing ref, amount or date");
                out.skipped_rows += 1;
            }
        }
    }
}

fn apply_payment_stats(members: &mut [Member], payments: &[PaymentEvent], window_start: NaiveDate) {
    let mut totals: HashMap<&str, (f64, u32, Option<NaiveDate>)> = HashMap::new();
    for payment in payments
        .iter()
        .filter(|p| p.is_settled() && p.paid_at >= window_start)
    {
        let entry = totals.entry(payment.member_ref.as_str()).or_default();
        entry.0 += payment.amount;
        entry.1 += 1;
        entry.2 = entry.2.max(Some(payment.paid_at));
    }

    for member in members {
        if let Some((total, count, last)) = totals.get(member.member_ref.as_str()) {
            member.ltv = *total;
            member.payment_count = *count;
            member.last_payment_date = *last;
        }
    }
}

/// Parse a money amount, accepting a decimal comma and a leading `€`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('€')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let cleaned = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "ja" | "x" => Some(true),
        "false" | "0" | "no" | "nee" => Some(false),
        _ => None,
    }
}
