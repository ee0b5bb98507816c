use std::io::{self, IsTerminal, Write};

use anyhow::Result;
use chrono::{DateTime, Utc};
use prtriage::{AnalysisState, CheckState, CheckStatus, DiffStats, Field, PrState, Review};

const TABLE_HEADERS: &[&str] = &[
    "URL", "CI", "+/-", "FILES", "REVIEWS", "AI", "UPDATED", "TITLE",
];
const TITLE_COLUMN_INDEX: usize = TABLE_HEADERS.len() - 1;
const COLUMN_SEPARATOR: &str = "  ";
const TITLE_TRUNCATION_SUFFIX: &str = "...";
const MIN_TITLE_WIDTH_FOR_TRUNCATION: usize = 3;
const LOADING: &str = "…";
const FAILED: &str = "error";

fn format_relative_time(time: DateTime<Utc>) -> String {
    use chrono_humanize::HumanTime;
    HumanTime::from(time).to_string()
}

fn format_ci(field: &Field<CheckStatus>) -> String {
    match field {
        Field::Loading => LOADING.to_string(),
        Field::Failed(_) => FAILED.to_string(),
        Field::Loaded(status) => {
            let mark = match status.state {
                CheckState::Success => "✓",
                CheckState::Failure | CheckState::Error => "✗",
                CheckState::Pending => "●",
            };
            format!("{mark} {}", status.description)
        }
    }
}

fn format_diff(field: &Field<DiffStats>) -> (String, String) {
    match field {
        Field::Loading => (LOADING.to_string(), LOADING.to_string()),
        Field::Failed(_) => (FAILED.to_string(), FAILED.to_string()),
        Field::Loaded(stats) => (
            format!("+{}/-{}", stats.additions, stats.deletions),
            stats.files.to_string(),
        ),
    }
}

fn format_reviews(field: &Field<Vec<Review>>) -> String {
    let reviews = match field {
        Field::Loading => return LOADING.to_string(),
        Field::Failed(_) => return FAILED.to_string(),
        Field::Loaded(reviews) => reviews,
    };

    let approved = reviews.iter().filter(|r| r.state == "APPROVED").count();
    let changes = reviews
        .iter()
        .filter(|r| r.state == "CHANGES_REQUESTED")
        .count();
    match (approved, changes) {
        (0, 0) if reviews.is_empty() => "-".to_string(),
        (0, 0) => format!("{} comments", reviews.len()),
        (a, 0) => format!("{a}✓"),
        (0, c) => format!("{c}✗"),
        (a, c) => format!("{a}✓ {c}✗"),
    }
}

fn format_analysis(state: &AnalysisState) -> String {
    match state {
        AnalysisState::Disabled => "-".to_string(),
        AnalysisState::Waiting | AnalysisState::Running => LOADING.to_string(),
        AnalysisState::Done(analysis) => {
            format!("{} ({})", analysis.recommendation, analysis.risk_level)
        }
        AnalysisState::Failed(_) => FAILED.to_string(),
        AnalysisState::Skipped(_) => "skipped".to_string(),
    }
}

fn pr_to_table_row(state: &PrState) -> Vec<String> {
    let (lines, files) = format_diff(&state.diff_stats);
    let title = if state.auto_merge {
        format!("{} [auto-merge]", state.pr.title)
    } else {
        state.pr.title.clone()
    };

    vec![
        state.pr.url.clone(),
        format_ci(&state.check_status),
        lines,
        files,
        format_reviews(&state.reviews),
        format_analysis(&state.analysis),
        format_relative_time(state.pr.updated_at),
        title,
    ]
}

fn cell_width(cell: &str) -> usize {
    cell.chars().count()
}

fn calculate_column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = headers.iter().map(|h| cell_width(h)).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell_width(cell));
        }
    }
    widths
}

fn terminal_width() -> usize {
    if io::stdout().is_terminal() {
        terminal_size::terminal_size()
            .map(|(w, _)| w.0 as usize)
            .unwrap_or(usize::MAX)
    } else {
        usize::MAX
    }
}

fn apply_title_truncation(rows: &mut [Vec<String>], widths: &mut [usize], terminal_width: usize) {
    if terminal_width == usize::MAX {
        return;
    }

    let separator_width = COLUMN_SEPARATOR.len() * (widths.len() - 1);
    let non_title_width: usize =
        widths[..TITLE_COLUMN_INDEX].iter().sum::<usize>() + separator_width;
    if non_title_width >= terminal_width {
        return;
    }

    let available = terminal_width - non_title_width;
    if widths[TITLE_COLUMN_INDEX] <= available || available <= MIN_TITLE_WIDTH_FOR_TRUNCATION {
        return;
    }

    widths[TITLE_COLUMN_INDEX] = available;
    let keep = available - TITLE_TRUNCATION_SUFFIX.len();
    for row in rows {
        if let Some(title) = row.get_mut(TITLE_COLUMN_INDEX)
            && cell_width(title) > available
        {
            *title = format!(
                "{}{TITLE_TRUNCATION_SUFFIX}",
                title.chars().take(keep).collect::<String>()
            );
        }
    }
}

fn render_row<W: Write>(cells: &[&str], widths: &[usize], writer: &mut W) -> Result<()> {
    let last = cells.len() - 1;
    for (i, cell) in cells.iter().enumerate() {
        if i == last {
            write!(writer, "{cell}")?;
        } else {
            let pad = widths[i].saturating_sub(cell_width(cell));
            write!(writer, "{cell}{}{COLUMN_SEPARATOR}", " ".repeat(pad))?;
        }
    }
    writeln!(writer)?;
    Ok(())
}

fn display_table_with_width<W: Write>(
    prs: &[PrState],
    writer: &mut W,
    terminal_width: usize,
) -> Result<()> {
    let mut rows: Vec<Vec<String>> = prs.iter().map(pr_to_table_row).collect();
    let mut widths = calculate_column_widths(TABLE_HEADERS, &rows);
    apply_title_truncation(&mut rows, &mut widths, terminal_width);

    render_row(TABLE_HEADERS, &widths, writer)?;
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    render_row(
        &separator.iter().map(String::as_str).collect::<Vec<_>>(),
        &widths,
        writer,
    )?;
    for row in &rows {
        render_row(
            &row.iter().map(String::as_str).collect::<Vec<_>>(),
            &widths,
            writer,
        )?;
    }
    Ok(())
}

/// Prints the enriched list as a table sized to the terminal.
pub fn display_pr_table<W: Write>(prs: &[PrState], writer: &mut W) -> Result<()> {
    if prs.is_empty() {
        writeln!(writer, "No open pull requests match the query.")?;
        return Ok(());
    }
    display_table_with_width(prs, writer, terminal_width())
}

/// Prints AI reasoning for every PR that has an analysis.
pub fn display_analyses<W: Write>(prs: &[PrState], writer: &mut W) -> Result<()> {
    for state in prs {
        if let AnalysisState::Done(analysis) = &state.analysis {
            writeln!(writer)?;
            writeln!(
                writer,
                "{} {} (risk {})",
                state.pr.url, analysis.recommendation, analysis.risk_level
            )?;
            for line in analysis.reasoning.lines() {
                writeln!(writer, "  {line}")?;
            }
        }
    }
    Ok(())
}
