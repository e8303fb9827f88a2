//! Prompt and subject text for the daily brief.

/// One query's rendered results, tagged with the query for traceability.
pub fn tag_contribution(query: &str, rendered: &str) -> String {
    format!("\nQuery: {}\nResults:\n{}\n", query, rendered)
}

/// The generation prompt for `date` over `data`.
///
/// `data` must already be cut to the prompt budget.
pub fn build_prompt(date: &str, data: &str) -> String {
    format!(
        r#"You are an expert financial analyst. Analyze the search data below to create a "Morning Market Brief" for {date}.

DATA:
{data}

INSTRUCTIONS:
1. Output PURE HTML code only. No markdown (```html).
2. Style: Swiss Design (Minimalist, Grid, Sans-serif).
3. Sections:
   - **权威要闻 (Facts)**: Top 20 verified news (Sina, Reuters, Gov). No speculation.
   - **市场传闻 (Rumors)**: Top 20 market buzz/rumors. Rank by heat.
4. Format: One sentence per item. Numbered lists (1-20). Language: Chinese.
5. Header: "{date} 市场晨报". Footer: "Generated by AI".
"#
    )
}

pub fn subject(prefix: &str, date: &str) -> String {
    format!("{} {}", prefix.trim(), date)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_embeds_date_and_data() {
        let p = build_prompt("2025-05-06", "Query: q1\nSrc: a\nTxt: b");
        assert!(p.contains("Morning Market Brief\" for 2025-05-06"));
        assert!(p.contains("Query: q1\nSrc: a\nTxt: b"));
        assert!(p.contains("2025-05-06 市场晨报"));
    }

    #[test]
    fn test_tag_contribution() {
        assert_eq!(tag_contribution("q", "x"), "\nQuery: q\nResults:\nx\n");
    }

    #[test]
    fn test_subject() {
        assert_eq!(subject("【市场晨报】", "2025-05-06"), "【市场晨报】 2025-05-06");
    }
}
