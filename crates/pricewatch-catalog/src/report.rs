//! Markdown digest of the catalog for the `report` command.

use crate::store::Catalog;

/// Markdown digest of catalog stats and the `recent` newest price changes.
pub fn render_markdown_report(catalog: &Catalog, recent: usize) -> String {
    let stats = catalog.get_stats();
    let mut lines = vec!["# Pricewatch Report".to_string(), String::new()];

    lines.push(format!("- catalog version: {}", stats.version));
    lines.push(format!("- canonical products: {}", stats.total_products));
    lines.push(format!("- price points: {}", stats.total_price_points));
    lines.push(format!("- price changes: {}", stats.total_changes));
    lines.push(String::new());

    lines.push("## Platforms".to_string());
    if stats.platform_breakdown.is_empty() {
        lines.push("- none yet".to_string());
    }
    for (platform, count) in &stats.platform_breakdown {
        lines.push(format!("- `{platform}`: {count}"));
    }
    lines.push(String::new());

    lines.push(format!("## Recent Changes (latest {recent})"));
    let changes = catalog.get_price_changes(None, None);
    if changes.is_empty() {
        lines.push("- none".to_string());
    }
    for change in changes.into_iter().take(recent) {
        let title = catalog
            .get_product(&change.canonical_id)
            .map(|p| p.display_title.as_str())
            .unwrap_or("unknown product");
        lines.push(format!(
            "- {} `{}` {}: ¥{} -> ¥{} ({:+.1}%)",
            change.detected_at.format("%Y-%m-%d %H:%M"),
            change.platform,
            title,
            change.old_price,
            change.new_price,
            change.pct_change * 100.0
        ));
    }
    lines.push(String::new());

    lines.join("\n")
}
