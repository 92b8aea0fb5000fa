//! CLI output formatting
//!
//! Every formatter renders either a comfy-table (human) or pretty JSON.

use chrono::Datelike;
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use ivory_core::analytics::{HeatmapData, IntervalComparison, Metric, TrendDirection};
use ivory_core::catalog::CatalogPage;
use ivory_core::format_duration_ms;
use ivory_core::models::LearnScores;
use serde::Serialize;

// ============================================================================
// Heatmap
// ============================================================================

/// Per-month rollup of a heatmap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthSummary {
    pub month: u32,
    pub active_days: usize,
    pub sessions: usize,
    pub duration_ms: u64,
    pub max_level: u8,
}

pub fn monthly_summary(heatmap: &HeatmapData) -> Vec<MonthSummary> {
    let mut months: Vec<MonthSummary> = (1..=12)
        .map(|month| MonthSummary {
            month,
            ..MonthSummary::default()
        })
        .collect();

    for day in &heatmap.days {
        let summary = &mut months[day.date.month0() as usize];
        summary.sessions += day.sessions;
        summary.duration_ms += day.duration_ms;
        summary.max_level = summary.max_level.max(day.level);
        if day.is_active() {
            summary.active_days += 1;
        }
    }

    months
}

pub fn format_heatmap(heatmap: &HeatmapData, json: bool, no_color: bool) -> String {
    if json {
        return to_json(heatmap);
    }

    let mut table = new_table(
        &["Month", "Active days", "Sessions", "Practice", "Peak level"],
        no_color,
    );

    for summary in monthly_summary(heatmap) {
        let month = chrono::Month::try_from(summary.month as u8)
            .map(|m| m.name()[..3].to_string())
            .unwrap_or_else(|_| summary.month.to_string());
        table.add_row(Row::from(vec![
            month,
            summary.active_days.to_string(),
            summary.sessions.to_string(),
            format_duration_ms(summary.duration_ms),
            level_bar(summary.max_level, heatmap.levels),
        ]));
    }

    let totals = &heatmap.totals;
    format!(
        "Practice heatmap {}\n{}\n\nActive days: {}  Current streak: {}  Longest streak: {}  \
         Sessions: {}  Total: {}",
        heatmap.year,
        table,
        totals.active_days,
        totals.current_streak,
        totals.longest_streak,
        totals.total_sessions,
        format_duration_ms(totals.total_duration_ms)
    )
}

/// `###..` style bar for a level out of `levels - 1`
fn level_bar(level: u8, levels: usize) -> String {
    let max = levels.saturating_sub(1);
    let filled = usize::from(level).min(max);
    format!("{}{}", "#".repeat(filled), ".".repeat(max - filled))
}

// ============================================================================
// Trends
// ============================================================================

pub fn format_comparison(comparison: &IntervalComparison, json: bool, no_color: bool) -> String {
    if json {
        return to_json(comparison);
    }

    let mut table = new_table(&["Metric", "Current", "Previous", "Change", "Trend"], no_color);

    for m in &comparison.metrics {
        let (current, previous) = match m.metric {
            Metric::PracticeTime => (format_duration_ms(m.current), format_duration_ms(m.previous)),
            _ => (m.current.to_string(), m.previous.to_string()),
        };
        let (arrow, color) = match m.trend {
            TrendDirection::Increase => ("up", Color::Green),
            TrendDirection::Decrease => ("down", Color::Red),
            TrendDirection::Stable => ("flat", Color::Grey),
        };
        let trend = if no_color {
            Cell::new(arrow)
        } else {
            Cell::new(arrow).fg(color)
        };

        table.add_row(Row::from(vec![
            Cell::new(m.metric.as_str()),
            Cell::new(current),
            Cell::new(previous),
            Cell::new(format!("{:+}%", m.percentage_change)),
            trend,
        ]));
    }

    format!(
        "{} window {} ({} .. {}) vs previous ({} .. {})\n{}",
        comparison.interval,
        comparison.window_index,
        comparison.current_window.start.format("%Y-%m-%d"),
        comparison.current_window.end.format("%Y-%m-%d"),
        comparison.previous_window.start.format("%Y-%m-%d"),
        comparison.previous_window.end.format("%Y-%m-%d"),
        table
    )
}

// ============================================================================
// Catalog
// ============================================================================

pub fn format_catalog_page(page: &CatalogPage, json: bool, no_color: bool) -> String {
    if json {
        return to_json(page);
    }

    if page.items.is_empty() {
        return format!(
            "No songs found (page {} of {}, {} total).",
            page.page, page.total_pages, page.total_count
        );
    }

    let mut table = new_table(
        &[
            "Title", "Composer", "Genre", "Length", "Diff", "Fav", "Owned", "Last played",
        ],
        no_color,
    );

    for item in &page.items {
        let song = &item.song;
        table.add_row(Row::from(vec![
            truncate(&song.title, 40),
            song.composer.clone().unwrap_or_else(|| "-".to_string()),
            song.genre.clone().unwrap_or_else(|| "-".to_string()),
            format_duration_ms(song.duration_ms),
            song.difficulty.to_string(),
            flag(item.is_favorite),
            flag(item.is_owned),
            item.last_played
                .map(|ts| ts.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]));
    }

    format!(
        "{}\nPage {} of {} ({} songs)",
        table, page.page, page.total_pages, page.total_count
    )
}

pub fn format_genres(genres: &[String], json: bool) -> String {
    if json {
        return to_json(genres);
    }
    if genres.is_empty() {
        return "No genres found.".to_string();
    }
    genres.join("\n")
}

// ============================================================================
// Learn scores
// ============================================================================

pub fn format_learn_scores(scores: &LearnScores, json: bool) -> String {
    if json {
        return to_json(scores);
    }
    format!(
        "Performance: {}%\nAccuracy:    {}%",
        scores.performance, scores.accuracy
    )
}

// ============================================================================
// Utilities
// ============================================================================

fn new_table(headers: &[&str], no_color: bool) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    if no_color {
        table.set_header(headers.to_vec());
    } else {
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
    table
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn flag(value: bool) -> String {
    let mark = if value { "yes" } else { "-" };
    mark.to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max - 1).collect::<String>() + "…"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ivory_core::analytics::build_heatmap;
    use ivory_core::config::HeatmapConfig;

    fn empty_heatmap() -> HeatmapData {
        build_heatmap(
            &[],
            2024,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            &HeatmapConfig::default(),
            chrono::FixedOffset::east_opt(0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_monthly_summary_covers_year() {
        let summary = monthly_summary(&empty_heatmap());
        assert_eq!(summary.len(), 12);
        assert_eq!(summary[1].month, 2);
        assert!(summary.iter().all(|m| m.active_days == 0 && m.max_level == 0));
    }

    #[test]
    fn test_level_bar() {
        assert_eq!(level_bar(0, 5), "....");
        assert_eq!(level_bar(3, 5), "###.");
        assert_eq!(level_bar(9, 5), "####");
    }

    #[test]
    fn test_learn_scores_output() {
        let scores = LearnScores::from_counts(15, 5, 2);
        assert_eq!(
            format_learn_scores(&scores, false),
            "Performance: 68%\nAccuracy:    75%"
        );
        let json: serde_json::Value =
            serde_json::from_str(&format_learn_scores(&scores, true)).unwrap();
        assert_eq!(json["performance"], 68);
    }

    #[test]
    fn test_empty_catalog_page() {
        let page = CatalogPage {
            items: Vec::new(),
            total_count: 0,
            total_pages: 0,
            page: 1,
            page_size: 20,
        };
        assert_eq!(
            format_catalog_page(&page, false, true),
            "No songs found (page 1 of 0, 0 total)."
        );
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("Étude in E major", 6), "Étude…");
        assert_eq!(truncate("Air", 6), "Air");
    }
}
