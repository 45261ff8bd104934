//! Price-text normalization.
//!
//! Payment descriptions on the marketplace are free text: fixed budgets, hourly
//! wages, per-article rates, ranges, `万円` notation, or an amount buried in prose.
//! [`extract_price_from_text`] reduces them to one integer yen amount by walking an
//! ordered list of rules; the first rule that yields a value wins.

use std::sync::LazyLock;

use regex::Regex;

/// An amount with an optional decimal part, as captured by the rules below.
const AMOUNT: &str = r"(\d+(?:\.\d+)?)";

const RANGE_SEPARATORS: [char; 3] = ['〜', '～', '~'];

struct PriceRule {
    name: &'static str,
    extract: fn(&str) -> Option<u64>,
}

static RULES: &[PriceRule] = &[
    PriceRule { name: "man-yen", extract: man_yen },
    PriceRule { name: "range-left-operand", extract: range_left_operand },
    PriceRule { name: "hourly-wage", extract: hourly_wage },
    PriceRule { name: "per-article", extract: per_article },
    PriceRule { name: "yen-suffix", extract: yen_suffix },
    PriceRule { name: "reward-keyword", extract: reward_keyword },
    PriceRule { name: "bare-number", extract: bare_number },
];

static MAN_YEN: LazyLock<Regex> = LazyLock::new(|| compile(&format!(r"{AMOUNT}\s*万円")));
static YEN: LazyLock<Regex> = LazyLock::new(|| compile(&format!(r"{AMOUNT}\s*円")));
static HOURLY: LazyLock<Regex> = LazyLock::new(|| compile(&format!(r"時給\s*{AMOUNT}")));
static ARTICLE: LazyLock<Regex> = LazyLock::new(|| compile(&format!(r"記事単価\s*{AMOUNT}")));
static FIVE_PLUS_DIGITS: LazyLock<Regex> = LazyLock::new(|| compile(r"\d{5,}"));
static FIVE_PLUS_DIGITS_WORD: LazyLock<Regex> = LazyLock::new(|| compile(r"\b\d{5,}\b"));
static FOUR_DIGITS_WORD: LazyLock<Regex> = LazyLock::new(|| compile(r"\b\d{4}\b"));
static SHORT_NUMBER_WORD: LazyLock<Regex> = LazyLock::new(|| compile(r"\b\d{1,3}\b"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| compile(r"\d+"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("price pattern is valid")
}

/// Extract a best-guess yen amount from a payment description.
///
/// Returns `None` when no rule applies (empty text, `応相談`, ...).
pub fn extract_price_from_text(text: &str) -> Option<u64> {
    let text = normalize(text);
    if text.trim().is_empty() {
        return None;
    }
    RULES.iter().find_map(|rule| {
        let value = (rule.extract)(&text)?;
        tracing::trace!(rule = rule.name, value, "price rule matched");
        Some(value)
    })
}

/// First run of digits in `text`, thousands separators ignored.
pub fn first_integer(text: &str) -> Option<u64> {
    let text = normalize(text);
    DIGITS.find(&text).and_then(|m| m.as_str().parse().ok())
}

/// Fold full-width digits and punctuation to ASCII and drop thousands separators.
fn normalize(text: &str) -> String {
    let folded: Vec<char> = text
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from_digit(c as u32 - '０' as u32, 10).unwrap_or(c),
            '，' => ',',
            '．' => '.',
            _ => c,
        })
        .collect();

    let mut out = String::with_capacity(text.len());
    for (i, &c) in folded.iter().enumerate() {
        if c == ',' {
            let prev_digit = i > 0 && folded[i - 1].is_ascii_digit();
            let next_digit = folded.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if prev_digit && next_digit {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn parse_amount(raw: &str) -> Option<u64> {
    let value: f64 = raw.parse().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value.trunc() as u64)
    } else {
        None
    }
}

fn first_capture(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_amount(m.as_str()))
}

fn man_yen(text: &str) -> Option<u64> {
    let caps = MAN_YEN.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    // Rounded: 2.3 * 10000 is 22999.999... in binary floating point.
    let yen = (value * 10_000.0).round();
    (yen.is_finite() && yen >= 0.0).then_some(yen as u64)
}

fn range_left_operand(text: &str) -> Option<u64> {
    let (left, _) = text.split_once(RANGE_SEPARATORS)?;
    first_capture(&YEN, left)
}

fn hourly_wage(text: &str) -> Option<u64> {
    first_capture(&HOURLY, text)
}

fn per_article(text: &str) -> Option<u64> {
    first_capture(&ARTICLE, text)
}

fn yen_suffix(text: &str) -> Option<u64> {
    first_capture(&YEN, text)
}

fn reward_keyword(text: &str) -> Option<u64> {
    if !text.contains("報酬") {
        return None;
    }
    FIVE_PLUS_DIGITS
        .find(text)
        .or_else(|| FOUR_DIGITS_WORD.find(text))
        .and_then(|m| m.as_str().parse().ok())
}

fn bare_number(text: &str) -> Option<u64> {
    if let Some(m) = FIVE_PLUS_DIGITS_WORD
        .find(text)
        .or_else(|| FOUR_DIGITS_WORD.find(text))
    {
        return m.as_str().parse().ok();
    }
    let value: u64 = SHORT_NUMBER_WORD.find(text)?.as_str().parse().ok()?;
    Some(match value {
        0..=9 => value * 1000,
        10..=99 => value * 100,
        _ => value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Option<u64> {
        extract_price_from_text(text)
    }

    #[test]
    fn plain_yen_amounts() {
        assert_eq!(extract("50000円"), Some(50_000));
        assert_eq!(extract("10000円"), Some(10_000));
        assert_eq!(extract("500円"), Some(500));
    }

    #[test]
    fn ranges_take_the_lower_bound() {
        assert_eq!(extract("10000円 〜 20000円"), Some(10_000));
        assert_eq!(extract("50000円〜100000円"), Some(50_000));
        assert_eq!(extract("〜 50000円"), Some(50_000));
        assert_eq!(extract("100000.0円 〜 300000.0円"), Some(100_000));
        assert_eq!(extract("10000.0円 〜 50000.0円"), Some(10_000));
        assert_eq!(extract("3000円～5000円"), Some(3_000));
    }

    #[test]
    fn thousands_separators_and_decimals() {
        assert_eq!(extract("10,000円"), Some(10_000));
        assert_eq!(extract("1,000,000円"), Some(1_000_000));
        assert_eq!(extract("50000.0円"), Some(50_000));
        assert_eq!(extract("10000.5円"), Some(10_000));
        assert_eq!(extract("１２，０００円"), Some(12_000));
    }

    #[test]
    fn hourly_and_per_article_rates() {
        assert_eq!(extract("時給 1500円"), Some(1_500));
        assert_eq!(extract("時給 1500円 〜 2000円"), Some(1_500));
        assert_eq!(extract("時給1000円〜1500円"), Some(1_000));
        assert_eq!(extract("時給 1200"), Some(1_200));
        assert_eq!(extract("記事単価 3000円"), Some(3_000));
        assert_eq!(extract("記事単価 2400.0円 (1500.0〜1500.0文字)"), Some(2_400));
    }

    #[test]
    fn man_yen_notation() {
        assert_eq!(extract("5万円"), Some(50_000));
        assert_eq!(extract("10万円〜20万円"), Some(100_000));
        assert_eq!(extract("5.5万円"), Some(55_000));
        assert_eq!(extract("2.3万円"), Some(23_000));
    }

    #[test]
    fn man_yen_scales_by_ten_thousand() {
        for n in [1u64, 3, 12, 45, 150, 999] {
            assert_eq!(extract(&format!("{n}万円")), Some(n * 10_000), "{n}万円");
            assert_eq!(extract(&format!("予算 {n}万円程度")), Some(n * 10_000));
        }
    }

    #[test]
    fn range_yields_left_operand_for_any_pair() {
        for (a, b) in [(1_000u64, 2_000u64), (25_000, 80_000), (300, 9_999)] {
            assert_eq!(extract(&format!("{a}円 〜 {b}円")), Some(a));
            assert_eq!(extract(&format!("{a}円~{b}円")), Some(a));
        }
    }

    #[test]
    fn amounts_inside_prose() {
        assert_eq!(extract("【報酬】50000円（税込）/ 納品物によって変動あり"), Some(50_000));
        assert_eq!(extract("一本あたり5000円の報酬をお支払いします"), Some(5_000));
        assert_eq!(extract("納期：3日以内、報酬：20000円"), Some(20_000));
        assert_eq!(extract("報酬は50.0円です"), Some(50));
        assert_eq!(extract("報酬は50000.0円です"), Some(50_000));
    }

    #[test]
    fn reward_keyword_without_currency_suffix() {
        assert_eq!(extract("報酬 30000 税別"), Some(30_000));
        assert_eq!(extract("報酬 2500 程度"), Some(2_500));
    }

    #[test]
    fn bare_numbers_are_scaled_by_magnitude() {
        assert_eq!(extract("budget 120000"), Some(120_000));
        assert_eq!(extract("budget 4500"), Some(4_500));
        assert_eq!(extract("budget 5"), Some(5_000));
        assert_eq!(extract("budget 30"), Some(3_000));
        assert_eq!(extract("budget 300"), Some(300));
    }

    #[test]
    fn unknown_amounts() {
        assert_eq!(extract("応相談"), None);
        assert_eq!(extract(""), None);
        assert_eq!(extract("   "), None);
        assert_eq!(extract("金額は相談の上で決定"), None);
    }

    #[test]
    fn first_integer_ignores_separators() {
        assert_eq!(first_integer("単価 1,500円"), Some(1_500));
        assert_eq!(first_integer("なし"), None);
    }
}
