use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::risk::RiskPrediction;

/// Rows shown per dashboard page.
pub const PAGE_SIZE: i64 = 20;

/// A stored student row as read back from the `students` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentRecord {
    #[serde(rename = "Student_id")]
    pub student_id: String,
    #[serde(rename = "Grade")]
    pub grade: String,
    #[serde(rename = "Year")]
    pub year: Option<i32>,
    #[serde(rename = "Semester")]
    pub semester: Option<i32>,
    #[serde(rename = "Age")]
    pub age: Option<i32>,
    #[serde(rename = "Gender")]
    pub gender: Option<String>,
    #[serde(rename = "Attendance_rate")]
    pub attendance_rate: f64,
    #[serde(rename = "Gpa")]
    pub gpa: f64,
    #[serde(rename = "Assignments_completed")]
    pub assignments_completed: Option<i32>,
    #[serde(rename = "Behavior_incidents")]
    pub behavior_incidents: Option<i32>,
    #[serde(rename = "Parent_engagement")]
    pub parent_engagement: Option<String>,
    #[serde(rename = "Socioeconomic_status")]
    pub socioeconomic_status: Option<String>,
    #[serde(rename = "Fee_balance")]
    pub fee_balance: Option<f64>,
    #[serde(rename = "Mental_health_flag")]
    pub mental_health_flag: Option<String>,
    pub risk_prediction: Option<RiskPrediction>,
    pub risk_reason: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload produced by the CSV pipeline. Risk columns are left to the
/// external scoring job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStudent {
    pub student_id: String,
    pub grade: String,
    pub year: Option<i32>,
    pub semester: Option<i32>,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub attendance_rate: f64,
    pub gpa: f64,
    pub assignments_completed: Option<i32>,
    pub behavior_incidents: Option<i32>,
    pub parent_engagement: Option<String>,
    pub socioeconomic_status: Option<String>,
    pub fee_balance: Option<f64>,
    pub mental_health_flag: Option<String>,
    pub user_id: Uuid,
}

/// Inclusive row window `[from, to]` for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub from: i64,
    pub to: i64,
}

impl PageWindow {
    pub fn for_page(page: i64, page_size: i64) -> Self {
        let from = (page.max(1) - 1).saturating_mul(page_size);
        PageWindow {
            from,
            to: from.saturating_add(page_size - 1),
        }
    }

    pub fn len(&self) -> i64 {
        self.to - self.from + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentPage {
    pub rows: Vec<StudentRecord>,
    pub total_count: i64,
}

pub fn total_pages(total_count: i64, page_size: i64) -> i64 {
    if total_count <= 0 {
        return 0;
    }
    (total_count - 1) / page_size + 1
}
