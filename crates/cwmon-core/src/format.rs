//! Display helpers shared by the UI and the email body.

use crate::{parse_timestamp, LegacyPayment, PaymentInfo, PaymentRecord};

/// `1234567` -> `1,234,567`
pub fn format_yen(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn format_date(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "なし".to_string();
    }
    match parse_timestamp(raw) {
        Some(dt) => dt.format("%Y/%m/%d %H:%M").to_string(),
        None => "日付不明".to_string(),
    }
}

pub fn payment_text(payment: &PaymentInfo) -> String {
    match payment {
        PaymentInfo::Text(text) if text.trim().is_empty() => "報酬情報なし".to_string(),
        PaymentInfo::Text(text) => text.clone(),
        PaymentInfo::Record(PaymentRecord::FixedPrice { price }) => {
            format!("固定報酬: {}円", format_yen(*price))
        }
        PaymentInfo::Record(PaymentRecord::Hourly { min_price, max_price }) => {
            format!("時給: {}円〜{}円", format_yen(*min_price), format_yen(*max_price))
        }
        PaymentInfo::Record(PaymentRecord::WritingPayment { price, unit }) => format!(
            "執筆報酬: {}円/{}",
            format_yen(*price),
            unit.as_deref().unwrap_or("文字")
        ),
        PaymentInfo::Legacy(legacy) => legacy_text(legacy),
        PaymentInfo::Other(_) => "報酬情報なし".to_string(),
    }
}

fn legacy_text(legacy: &LegacyPayment) -> String {
    let min = legacy.min_price.filter(|v| *v > 0);
    let max = legacy.max_price.filter(|v| *v > 0);
    match (min, max) {
        (Some(min), Some(max)) if min != max => {
            format!("{}円 〜 {}円", format_yen(min), format_yen(max))
        }
        (Some(min), _) => format!("{}円", format_yen(min)),
        (None, Some(max)) => format!("〜 {}円", format_yen(max)),
        (None, None) => match legacy.payment_type.as_deref() {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => "要相談".to_string(),
        },
    }
}
