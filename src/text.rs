/// Trims surrounding whitespace and removes `<` / `>` so seller input can be
/// embedded in prompts and listing pages as plain text.
pub fn sanitize_input(input: &str) -> String {
    input.trim().replace(['<', '>'], "")
}

pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Renders an amount in rupees with Indian digit grouping, e.g. `₹1,23,456.50`.
pub fn format_inr(amount: f64) -> String {
    let negative = amount < 0.0;
    let fixed = format!("{:.2}", amount.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let grouped = if whole.len() <= 3 {
        whole.to_string()
    } else {
        let (head, last_three) = whole.split_at(whole.len() - 3);
        let mut groups = Vec::new();
        let mut rest = head;
        while rest.len() > 2 {
            let (left, right) = rest.split_at(rest.len() - 2);
            groups.push(right);
            rest = left;
        }
        if !rest.is_empty() {
            groups.push(rest);
        }
        groups.reverse();
        format!("{},{}", groups.join(","), last_three)
    };

    let sign = if negative { "-" } else { "" };
    format!("{sign}₹{grouped}.{fraction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_removes_angle_brackets() {
        assert_eq!(sanitize_input("  <script>hi</script> "), "scripthi/script");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_text("₹₹₹₹", 2), "₹₹...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn inr_grouping() {
        assert_eq!(format_inr(47.83), "₹47.83");
        assert_eq!(format_inr(1234.5), "₹1,234.50");
        assert_eq!(format_inr(123456.0), "₹1,23,456.00");
        assert_eq!(format_inr(12345678.9), "₹1,23,45,678.90");
    }
}
