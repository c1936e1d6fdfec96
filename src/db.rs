use std::fmt;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::models::{NewStudent, PageWindow, StudentPage, StudentRecord};
use crate::risk::{self, RiskPrediction};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_ROWS_PER_STATEMENT: usize = 65535 / INSERT_COLUMNS;
const INSERT_COLUMNS: usize = 15;

const SELECT_COLUMNS: &str = r#""Student_id", "Grade", "Year", "Semester", "Age", "Gender",
    "Attendance_rate", "Gpa", "Assignments_completed", "Behavior_incidents",
    "Parent_engagement", "Socioeconomic_status", "Fee_balance", "Mental_health_flag",
    risk_prediction, risk_reason, user_id, created_at"#;

/// Failure reported by the record store. The message is the backend's own
/// text so it can be shown to the user unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => StoreError::new(db_err.message()),
            _ => StoreError::new(err.to_string()),
        }
    }
}

/// The `students` collection as the dashboard sees it.
#[async_trait]
pub trait StudentStore: Send + Sync {
    /// Inserts the whole batch or nothing. Returns the number of rows stored.
    async fn insert(&self, rows: &[NewStudent]) -> Result<u64, StoreError>;

    /// Rows ordered by `Student_id` ascending inside `window`, plus the exact
    /// row count of the table.
    async fn select_page(&self, window: PageWindow) -> Result<StudentPage, StoreError>;

    /// Exact number of rows classified `High`.
    async fn count_high_risk(&self) -> Result<i64, StoreError>;

    /// Deletes every row whose `Student_id` is not the empty string.
    async fn delete_all(&self) -> Result<u64, StoreError>;
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStudentStore {
    pool: PgPool,
}

impl PgStudentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StudentStore for PgStudentStore {
    async fn insert(&self, rows: &[NewStudent]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO students
                ("Student_id", "Grade", "Year", "Semester", "Age", "Gender",
                 "Attendance_rate", "Gpa", "Assignments_completed", "Behavior_incidents",
                 "Parent_engagement", "Socioeconomic_status", "Fee_balance",
                 "Mental_health_flag", user_id) "#,
            );
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.student_id.clone())
                    .push_bind(row.grade.clone())
                    .push_bind(row.year)
                    .push_bind(row.semester)
                    .push_bind(row.age)
                    .push_bind(row.gender.clone())
                    .push_bind(row.attendance_rate)
                    .push_bind(row.gpa)
                    .push_bind(row.assignments_completed)
                    .push_bind(row.behavior_incidents)
                    .push_bind(row.parent_engagement.clone())
                    .push_bind(row.socioeconomic_status.clone())
                    .push_bind(row.fee_balance)
                    .push_bind(row.mental_health_flag.clone())
                    .push_bind(row.user_id.to_string());
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn select_page(&self, window: PageWindow) -> Result<StudentPage, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let total_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM students")
            .fetch_one(&mut *tx)
            .await?;

        let query = format!(
            r#"SELECT {SELECT_COLUMNS} FROM students
            ORDER BY "Student_id" ASC
            OFFSET $1 LIMIT $2"#
        );
        let records = sqlx::query(&query)
            .bind(window.from)
            .bind(window.len())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut rows = Vec::with_capacity(records.len());
        for row in records {
            rows.push(student_from_row(&row)?);
        }

        Ok(StudentPage { rows, total_count })
    }

    async fn count_high_risk(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM students WHERE risk_prediction = $1")
                .bind(RiskPrediction::High.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(r#"DELETE FROM students WHERE "Student_id" <> $1"#)
            .bind("")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn student_from_row(row: &PgRow) -> Result<StudentRecord, sqlx::Error> {
    let risk_prediction: Option<String> = row.try_get("risk_prediction")?;
    Ok(StudentRecord {
        student_id: row.try_get("Student_id")?,
        grade: row.try_get("Grade")?,
        year: row.try_get("Year")?,
        semester: row.try_get("Semester")?,
        age: row.try_get("Age")?,
        gender: row.try_get("Gender")?,
        attendance_rate: row.try_get("Attendance_rate")?,
        gpa: row.try_get("Gpa")?,
        assignments_completed: row.try_get("Assignments_completed")?,
        behavior_incidents: row.try_get("Behavior_incidents")?,
        parent_engagement: row.try_get("Parent_engagement")?,
        socioeconomic_status: row.try_get("Socioeconomic_status")?,
        fee_balance: row.try_get("Fee_balance")?,
        mental_health_flag: row.try_get("Mental_health_flag")?,
        risk_prediction: risk::from_column(risk_prediction.as_deref()),
        risk_reason: row.try_get("risk_reason")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
    })
}
