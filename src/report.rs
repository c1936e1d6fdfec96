use std::fmt::Write;

use crate::dashboard::DashboardState;
use crate::risk;

/// Attendance may be stored as a fraction (0.873) or, in older rows, as a
/// percentage (87.3). Both render as `87.3%`.
pub fn format_attendance(rate: f64) -> String {
    if rate > 1.0 {
        format!("{rate:.1}%")
    } else {
        format!("{:.1}%", rate * 100.0)
    }
}

/// Integer with `,` thousands separators.
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        grouped.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

pub fn build_dashboard(state: &DashboardState) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Student Dropout Prediction");
    let _ = writeln!(output, "Monitor and analyze student risk factors");
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Total Students: {}",
        group_thousands(state.total_count)
    );
    let _ = writeln!(
        output,
        "At Risk Students: {}",
        group_thousands(state.at_risk_count)
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "| Student ID | Grade | Attendance Rate | GPA | Risk Status | Risk Reason |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|");

    if state.is_loading {
        let _ = writeln!(output, "Loading students...");
    } else if state.students.is_empty() {
        let _ = writeln!(output, "No students found");
    } else {
        for student in state.students.iter() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {:.2} | {} | {} |",
                student.student_id,
                student.grade,
                format_attendance(student.attendance_rate),
                student.gpa,
                risk::badge_label(student.risk_prediction),
                student
                    .risk_reason
                    .as_deref()
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or("-")
            );
        }
    }

    if state.shows_pagination() {
        let previous = if state.has_previous() {
            "[< Previous]"
        } else {
            "(< Previous)"
        };
        let next = if state.has_next() {
            "[Next >]"
        } else {
            "(Next >)"
        };
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "Page {} of {}  {previous} {next}",
            state.current_page,
            state.total_pages()
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::record;
    use crate::risk::RiskPrediction;

    #[test]
    fn attendance_renders_both_storage_conventions() {
        assert_eq!(format_attendance(0.873), "87.3%");
        assert_eq!(format_attendance(87.3), "87.3%");
        assert_eq!(format_attendance(1.0), "100.0%");
        assert_eq!(format_attendance(0.0), "0.0%");
    }

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
        assert_eq!(group_thousands(-4200), "-4,200");
    }

    #[test]
    fn renders_rows_with_badges_and_reasons() {
        let mut high = record("S1", Some(RiskPrediction::High));
        high.risk_reason = Some("Low attendance".to_string());
        high.attendance_rate = 0.42;
        high.gpa = 1.5;
        let state = DashboardState {
            students: vec![high, record("S2", None)],
            total_count: 2,
            at_risk_count: 1,
            ..DashboardState::default()
        };

        let output = build_dashboard(&state);

        assert!(output.contains("| S1 | 9 | 42.0% | 1.50 | High Risk | Low attendance |"));
        assert!(output.contains("| S2 | 9 | 90.0% | 3.00 | Processing... | - |"));
        assert!(output.contains("At Risk Students: 1"));
        assert!(!output.contains("Page "));
    }

    #[test]
    fn empty_reason_renders_as_dash() {
        let mut low = record("S3", Some(RiskPrediction::Low));
        low.risk_reason = Some(String::new());
        let state = DashboardState {
            students: vec![low],
            total_count: 1,
            ..DashboardState::default()
        };

        let output = build_dashboard(&state);

        assert!(output.contains("| S3 | 9 | 90.0% | 3.00 | On Track | - |"));
    }

    #[test]
    fn empty_and_loading_states() {
        let empty = DashboardState::default();
        assert!(build_dashboard(&empty).contains("No students found"));

        let loading = DashboardState {
            is_loading: true,
            total_count: 100,
            ..DashboardState::default()
        };
        let output = build_dashboard(&loading);
        assert!(output.contains("Loading students..."));
        assert!(!output.contains("Page "));
    }

    #[test]
    fn footer_marks_disabled_navigation() {
        let state = DashboardState {
            students: vec![record("S1", None)],
            total_count: 45,
            current_page: 3,
            ..DashboardState::default()
        };

        let output = build_dashboard(&state);

        assert!(output.contains("Page 3 of 3  [< Previous] (Next >)"));
    }
}
