use std::fmt;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use password_hash::SaltString;
use rand_core::OsRng;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use uuid::Uuid;

pub const MAX_EMAIL_LEN: usize = 255;
pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Uuid,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum AuthError {
    Validation(String),
    InvalidCredentials,
    AlreadyRegistered,
    Db(sqlx::Error),
    Hash(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Validation(message) => write!(f, "{message}"),
            AuthError::InvalidCredentials => write!(f, "Invalid email or password"),
            AuthError::AlreadyRegistered => {
                write!(f, "This email is already registered. Please login instead.")
            }
            AuthError::Db(e) => write!(f, "Database error: {e}"),
            AuthError::Hash(e) => write!(f, "Hash error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Db(err)
    }
}

/// Trims and checks an email address, returning the normalized form.
pub fn validate_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim();
    let invalid = || AuthError::Validation("Invalid email address".to_string());

    if email.len() > MAX_EMAIL_LEN {
        return Err(AuthError::Validation(format!(
            "Email must be at most {MAX_EMAIL_LEN} characters"
        )));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(invalid());
    }
    Ok(email.to_string())
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at most {MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, AuthError>;

    /// `None` for unknown or expired tokens.
    async fn get_session(&self, token: Uuid) -> Result<Option<Session>, AuthError>;

    async fn sign_out(&self, token: Uuid) -> Result<(), AuthError>;

    /// Succeeds for unknown addresses so callers cannot discover which accounts exist.
    async fn reset_password_for_email(&self, email: &str, redirect_to: &str)
        -> Result<(), AuthError>;
}

pub struct PgAuth {
    pool: PgPool,
    session_ttl: Duration,
}

impl PgAuth {
    pub fn new(pool: PgPool, session_ttl: Duration) -> Self {
        Self { pool, session_ttl }
    }

    /// Completes a reset started by `reset_password_for_email`.
    pub async fn update_password(&self, reset_token: Uuid, password: &str) -> Result<(), AuthError> {
        validate_password(password)?;
        let password_hash = hash_password(password)?;

        let mut tx = self.pool.begin().await?;
        let user_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE password_resets SET used_at = now()
            WHERE token = $1 AND used_at IS NULL AND expires_at > now()
            RETURNING user_id
            "#,
        )
        .bind(reset_token)
        .fetch_optional(&mut *tx)
        .await?;

        let user_id = user_id
            .ok_or_else(|| AuthError::Validation("Reset link is invalid or expired".to_string()))?;

        sqlx::query("UPDATE auth_users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM auth_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(%user_id, "password updated from reset link");
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let hash = PasswordHash::new(stored).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .is_ok())
}

#[async_trait]
impl AuthProvider for PgAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = validate_email(email)?;
        validate_password(password)?;
        let password_hash = hash_password(password)?;

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO auth_users (id, email, password_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;

        let id = id.ok_or(AuthError::AlreadyRegistered)?;
        tracing::info!(user_id = %id, "user registered");
        Ok(User { id, email })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let email = validate_email(email)?;
        validate_password(password)?;

        let row = sqlx::query("SELECT id, password_hash FROM auth_users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let id: Uuid = row.try_get("id")?;
        let stored: String = row.try_get("password_hash")?;
        if !verify_password(password, &stored)? {
            tracing::warn!(user_id = %id, "rejected sign-in");
            return Err(AuthError::InvalidCredentials);
        }

        let token = Uuid::new_v4();
        let expires_at = Utc::now()
            .checked_add_signed(self.session_ttl)
            .ok_or_else(|| AuthError::Validation("Session lifetime is out of range".to_string()))?;
        sqlx::query("INSERT INTO auth_sessions (token, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token)
            .bind(id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        tracing::info!(user_id = %id, "signed in");
        Ok(Session {
            token,
            user: User { id, email },
            expires_at,
        })
    }

    async fn get_session(&self, token: Uuid) -> Result<Option<Session>, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT s.token, s.expires_at, u.id, u.email
            FROM auth_sessions s
            JOIN auth_users u ON u.id = s.user_id
            WHERE s.token = $1 AND s.expires_at > now()
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Session {
            token: row.try_get("token")?,
            expires_at: row.try_get("expires_at")?,
            user: User {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
            },
        }))
    }

    async fn sign_out(&self, token: Uuid) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        tracing::info!("signed out");
        Ok(())
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), AuthError> {
        let email = validate_email(email)?;
        let user_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM auth_users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?;

        let Some(user_id) = user_id else {
            tracing::info!("password reset requested for unknown address");
            return Ok(());
        };

        let token = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO password_resets (token, user_id, redirect_to, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(redirect_to)
        .bind(Utc::now() + Duration::hours(1))
        .execute(&self.pool)
        .await?;

        // No mail transport; the link is only logged.
        let link = format!("{redirect_to}?token={token}");
        tracing::info!(%user_id, %link, "password reset link issued");
        Ok(())
    }
}

/// Current session shared with everything that needs to know who is signed
/// in. Changes are broadcast to subscribers.
#[derive(Debug)]
pub struct SessionContext {
    tx: watch::Sender<Option<Session>>,
}

impl SessionContext {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Resolves a persisted token through the provider. Unknown or expired
    /// tokens start the context signed out.
    pub async fn restore<A>(auth: &A, token: Option<Uuid>) -> Result<Self, AuthError>
    where
        A: AuthProvider + ?Sized,
    {
        let session = match token {
            Some(token) => auth.get_session(token).await?,
            None => None,
        };
        Ok(Self::new(session))
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// Records an auth state change and notifies subscribers.
    pub fn set(&self, session: Option<Session>) {
        self.tx.send_replace(session);
    }

    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Unsubscribes when dropped.
#[derive(Debug)]
pub struct SessionSubscription {
    rx: watch::Receiver<Option<Session>>,
}

impl SessionSubscription {
    /// The latest session if it changed since the last call.
    pub fn take_change(&mut self) -> Option<Option<Session>> {
        match self.rx.has_changed() {
            Ok(true) => Some(self.rx.borrow_and_update().clone()),
            _ => None,
        }
    }

    pub fn unsubscribe(self) {}
}
