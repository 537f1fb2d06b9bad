use rust_decimal::Decimal;

/// Format a decimal as a shilling amount with thousands separators: KES 1,234.56
pub fn money(val: Decimal) -> String {
    let negative = val.is_sign_negative() && !val.is_zero();
    let mut abs = val.abs().round_dp(2);
    abs.rescale(2);
    let cents = abs.to_string();
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative {
        format!("-KES {with_commas}.{dec_part}")
    } else {
        format!("KES {with_commas}.{dec_part}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(dec!(1234.56)), "KES 1,234.56");
        assert_eq!(money(dec!(-500.00)), "-KES 500.00");
        assert_eq!(money(dec!(0)), "KES 0.00");
        assert_eq!(money(dec!(1000000.99)), "KES 1,000,000.99");
        assert_eq!(money(dec!(42.1)), "KES 42.10");
    }
}
