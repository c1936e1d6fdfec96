use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use uuid::Uuid;

use crate::db::{StoreError, StudentStore};
use crate::models::NewStudent;

/// What to do with a present value that does not parse as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericPolicy {
    /// Float columns store NaN, integer columns store null.
    #[default]
    Sentinel,
    /// Store null. A required column that ends up null rejects the row.
    Null,
    /// Drop the row.
    Reject,
}

impl FromStr for NumericPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sentinel" => Ok(NumericPolicy::Sentinel),
            "null" => Ok(NumericPolicy::Null),
            "reject" => Ok(NumericPolicy::Reject),
            other => Err(format!(
                "unknown numeric policy {other:?} (expected sentinel, null or reject)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { accepted: usize, skipped: usize },
    NoValidData { rows_read: usize },
}

#[derive(Debug)]
pub enum UploadError {
    Busy,
    Parse(csv::Error),
    Store(StoreError),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Busy => write!(f, "an upload is already in progress"),
            UploadError::Parse(e) => write!(f, "failed to parse CSV file: {e}"),
            UploadError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Busy => None,
            UploadError::Parse(e) => Some(e),
            UploadError::Store(e) => Some(e),
        }
    }
}

/// Rows surviving validation plus how many were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub rows: Vec<NewStudent>,
    pub rows_read: usize,
}

impl Batch {
    pub fn skipped(&self) -> usize {
        self.rows_read - self.rows.len()
    }
}

/// One data line, mapped by header name. Missing columns, short rows and
/// empty fields all come through as `None`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    #[serde(rename = "Student_id")]
    student_id: Option<String>,
    #[serde(rename = "Grade")]
    grade: Option<String>,
    #[serde(rename = "Year")]
    year: Option<String>,
    #[serde(rename = "Semester")]
    semester: Option<String>,
    #[serde(rename = "Age")]
    age: Option<String>,
    #[serde(rename = "Gender")]
    gender: Option<String>,
    #[serde(rename = "Attendance_rate")]
    attendance_rate: Option<String>,
    #[serde(rename = "Gpa")]
    gpa: Option<String>,
    #[serde(rename = "Assignments_completed")]
    assignments_completed: Option<String>,
    #[serde(rename = "Behavior_incidents")]
    behavior_incidents: Option<String>,
    #[serde(rename = "Parent_engagement")]
    parent_engagement: Option<String>,
    #[serde(rename = "Socioeconomic_status")]
    socioeconomic_status: Option<String>,
    #[serde(rename = "Fee_balance")]
    fee_balance: Option<String>,
    #[serde(rename = "Mental_health_flag")]
    mental_health_flag: Option<String>,
}

fn text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed numeric field: absent, a number, or present but unparseable.
enum Numeric<T> {
    Absent,
    Value(T),
    Invalid,
}

fn numeric<T>(raw: Option<&str>, parse: fn(&str) -> Option<T>) -> Numeric<T> {
    match raw.map(str::trim) {
        None | Some("") => Numeric::Absent,
        Some(text) => match parse(text) {
            Some(value) => Numeric::Value(value),
            None => Numeric::Invalid,
        },
    }
}

fn leading_digits(bytes: &[u8], from: usize) -> usize {
    bytes
        .get(from..)
        .map_or(0, |rest| rest.iter().take_while(|b| b.is_ascii_digit()).count())
}

/// Longest leading decimal number, so `95%` reads as 95 and `3.8abc` as 3.8.
fn float_prefix(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));

    if text[end..].starts_with("Infinity") {
        let infinity = if bytes[0] == b'-' {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
        return Some(infinity);
    }

    let int_digits = leading_digits(bytes, end);
    end += int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = leading_digits(bytes, end + 1);
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let exp_digits = leading_digits(bytes, exponent);
        if exp_digits > 0 {
            end = exponent + exp_digits;
        }
    }

    text[..end].parse().ok()
}

/// Leading base-10 integer, so `2025.0` reads as 2025. Values outside `i32`
/// count as unparseable.
fn int_prefix(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits = leading_digits(bytes, sign);
    if digits == 0 {
        return None;
    }
    text[..sign + digits].parse().ok()
}

/// Reads the whole input. Any reader error aborts before a row is returned.
pub fn parse_batch<R: Read>(
    reader: R,
    owner: Uuid,
    policy: NumericPolicy,
) -> Result<Batch, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    let mut rows_read = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        rows_read += 1;
        if let Some(student) = transform(row, owner, policy) {
            rows.push(student);
        }
    }

    tracing::debug!(rows_read, accepted = rows.len(), "parsed CSV batch");
    Ok(Batch { rows, rows_read })
}

fn transform(row: CsvRow, owner: Uuid, policy: NumericPolicy) -> Option<NewStudent> {
    let student_id = row.student_id.filter(|v| !v.is_empty())?;
    let grade = row.grade.filter(|v| !v.is_empty())?;
    let attendance_raw = row.attendance_rate.filter(|v| !v.is_empty())?;
    let gpa_raw = row.gpa.filter(|v| !v.is_empty())?;

    let attendance = float(Some(attendance_raw.as_str()), policy)?? / 100.0;
    let gpa = float(Some(gpa_raw.as_str()), policy)??;

    Some(NewStudent {
        student_id,
        grade,
        year: integer(row.year.as_deref(), policy)?,
        semester: integer(row.semester.as_deref(), policy)?,
        age: integer(row.age.as_deref(), policy)?,
        gender: text(row.gender),
        attendance_rate: attendance,
        gpa,
        assignments_completed: integer(row.assignments_completed.as_deref(), policy)?,
        behavior_incidents: integer(row.behavior_incidents.as_deref(), policy)?,
        parent_engagement: text(row.parent_engagement),
        socioeconomic_status: text(row.socioeconomic_status),
        fee_balance: float(row.fee_balance.as_deref(), policy)?,
        mental_health_flag: text(row.mental_health_flag),
        user_id: owner,
    })
}

/// Outer `None` rejects the row; inner `None` stores null.
fn float(raw: Option<&str>, policy: NumericPolicy) -> Option<Option<f64>> {
    match (numeric(raw, float_prefix), policy) {
        (Numeric::Absent, _) => Some(None),
        (Numeric::Value(value), _) => Some(Some(value)),
        (Numeric::Invalid, NumericPolicy::Sentinel) => Some(Some(f64::NAN)),
        (Numeric::Invalid, NumericPolicy::Null) => Some(None),
        (Numeric::Invalid, NumericPolicy::Reject) => None,
    }
}

fn integer(raw: Option<&str>, policy: NumericPolicy) -> Option<Option<i32>> {
    match (numeric(raw, int_prefix), policy) {
        (Numeric::Absent, _) => Some(None),
        (Numeric::Value(value), _) => Some(Some(value)),
        (Numeric::Invalid, NumericPolicy::Reject) => None,
        (Numeric::Invalid, _) => Some(None),
    }
}

/// Turns an uploaded file into one batch insert. Only one upload can be in
/// flight per uploader.
#[derive(Debug, Default)]
pub struct Uploader {
    uploading: AtomicBool,
    policy: NumericPolicy,
}

/// Returns the uploader to `Idle` when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Uploader {
    pub fn new(policy: NumericPolicy) -> Self {
        Self {
            uploading: AtomicBool::new(false),
            policy,
        }
    }

    pub fn state(&self) -> UploadState {
        if self.uploading.load(Ordering::Acquire) {
            UploadState::Uploading
        } else {
            UploadState::Idle
        }
    }

    fn begin(&self) -> Option<InFlight<'_>> {
        self.uploading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.uploading))
    }

    pub async fn upload<S, R>(
        &self,
        store: &S,
        reader: R,
        owner: Uuid,
    ) -> Result<UploadOutcome, UploadError>
    where
        S: StudentStore + ?Sized,
        R: Read,
    {
        let _in_flight = self.begin().ok_or(UploadError::Busy)?;

        let batch = parse_batch(reader, owner, self.policy).map_err(|e| {
            tracing::error!(error = %e, "parse error");
            UploadError::Parse(e)
        })?;

        if batch.rows.is_empty() {
            tracing::info!(rows_read = batch.rows_read, "no valid rows in upload");
            return Ok(UploadOutcome::NoValidData {
                rows_read: batch.rows_read,
            });
        }

        store.insert(&batch.rows).await.map_err(|e| {
            tracing::error!(error = %e, "upload error");
            UploadError::Store(e)
        })?;

        let accepted = batch.rows.len();
        tracing::info!(accepted, skipped = batch.skipped(), %owner, "uploaded students");
        Ok(UploadOutcome::Uploaded {
            accepted,
            skipped: batch.skipped(),
        })
    }
}
