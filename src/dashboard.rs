use std::io::Read;

use uuid::Uuid;

use crate::auth::{AuthError, AuthProvider, SessionContext, SessionSubscription};
use crate::db::{StoreError, StudentStore};
use crate::ingest::{UploadError, UploadOutcome, Uploader};
use crate::models::{self, PageWindow, StudentPage, StudentRecord, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Destructive,
}

/// Transient user-facing message produced by an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub level: NoticeLevel,
}

impl Notice {
    fn info(title: &str, description: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            description: description.into(),
            level: NoticeLevel::Info,
        }
    }

    fn destructive(title: &str, description: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            description: description.into(),
            level: NoticeLevel::Destructive,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardState {
    pub students: Vec<StudentRecord>,
    pub total_count: i64,
    pub at_risk_count: i64,
    pub current_page: i64,
    pub is_loading: bool,
    pub page_size: i64,
}

impl Default for DashboardState {
    fn default() -> Self {
        Self {
            students: Vec::new(),
            total_count: 0,
            at_risk_count: 0,
            current_page: 1,
            is_loading: false,
            page_size: PAGE_SIZE,
        }
    }
}

impl DashboardState {
    pub fn total_pages(&self) -> i64 {
        models::total_pages(self.total_count, self.page_size)
    }

    pub fn has_previous(&self) -> bool {
        self.current_page > 1
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.total_pages()
    }

    pub fn shows_pagination(&self) -> bool {
        !self.is_loading && self.total_pages() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Ready,
    RedirectToAuth,
}

/// One user interaction. Each runs to completion before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    LoadPage(i64),
    NextPage,
    PreviousPage,
    Refresh,
    UploadComplete,
    ClearAll,
}

/// Tag for an issued page fetch. Only the latest one may update the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    seq: u64,
    page: i64,
}

pub struct Dashboard<S> {
    store: S,
    state: DashboardState,
    latest_page_request: u64,
    notices: Vec<Notice>,
    subscription: Option<SessionSubscription>,
    signed_in: bool,
    loaded: bool,
}

impl<S: StudentStore> Dashboard<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: DashboardState::default(),
            latest_page_request: 0,
            notices: Vec::new(),
            subscription: None,
            signed_in: false,
            loaded: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    /// Page to load on mount.
    pub fn start_at(&mut self, page: i64) {
        self.state.current_page = page.max(1);
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn begin_page_load(&mut self, page: i64) -> PageTicket {
        self.latest_page_request += 1;
        self.state.is_loading = true;
        let ticket = PageTicket {
            seq: self.latest_page_request,
            page: page.max(1),
        };
        tracing::debug!(page = ticket.page, seq = ticket.seq, "page fetch issued");
        ticket
    }

    /// Applies a page response. Returns `false` when the response belongs to
    /// a superseded request and was discarded.
    pub fn finish_page_load(
        &mut self,
        ticket: PageTicket,
        result: Result<StudentPage, StoreError>,
    ) -> bool {
        if ticket.seq != self.latest_page_request {
            tracing::warn!(
                page = ticket.page,
                latest = self.latest_page_request,
                seq = ticket.seq,
                "discarding stale page response"
            );
            return false;
        }

        self.state.is_loading = false;
        match result {
            Ok(page) => {
                self.state.students = page.rows;
                self.state.total_count = page.total_count;
                self.state.current_page = ticket.page;
            }
            Err(e) => {
                tracing::error!(error = %e, page = ticket.page, "error fetching students");
                self.notices
                    .push(Notice::destructive("Error", "Failed to fetch students"));
            }
        }
        true
    }

    fn apply_stats(&mut self, result: Result<i64, StoreError>) {
        match result {
            Ok(count) => self.state.at_risk_count = count,
            Err(e) => tracing::warn!(error = %e, "error fetching stats"),
        }
    }

    pub async fn load_page(&mut self, page: i64) {
        let ticket = self.begin_page_load(page);
        let window = PageWindow::for_page(ticket.page, self.state.page_size);
        let result = self.store.select_page(window).await;
        self.finish_page_load(ticket, result);
    }

    pub async fn load_stats(&mut self) {
        let result = self.store.count_high_risk().await;
        self.apply_stats(result);
    }

    /// The page fetch and the stats fetch share no state, so they are
    /// issued together.
    async fn load_page_and_stats(&mut self, page: i64) {
        let ticket = self.begin_page_load(page);
        let window = PageWindow::for_page(ticket.page, self.state.page_size);
        let (page_result, stats_result) = tokio::join!(
            self.store.select_page(window),
            self.store.count_high_risk()
        );
        self.finish_page_load(ticket, page_result);
        self.apply_stats(stats_result);
        self.loaded = true;
    }

    pub async fn refresh(&mut self) {
        self.load_page_and_stats(self.state.current_page).await;
        self.notices
            .push(Notice::info("Refreshed", "Data has been reloaded"));
    }

    pub async fn upload_complete(&mut self) {
        self.state.current_page = 1;
        self.load_page_and_stats(1).await;
    }

    pub async fn next_page(&mut self) {
        if self.state.has_next() {
            self.load_page(self.state.current_page + 1).await;
        }
    }

    pub async fn previous_page(&mut self) {
        if self.state.has_previous() {
            self.load_page(self.state.current_page - 1).await;
        }
    }

    pub async fn clear_all(&mut self) -> Result<u64, StoreError> {
        match self.store.delete_all().await {
            Ok(deleted) => {
                tracing::info!(deleted, "cleared student records");
                self.notices.push(Notice::info(
                    "Cleared",
                    format!("Deleted {deleted} student records"),
                ));
                self.upload_complete().await;
                Ok(deleted)
            }
            Err(e) => {
                tracing::error!(error = %e, "error clearing students");
                self.notices.push(Notice::destructive("Error", e.message()));
                Err(e)
            }
        }
    }

    /// Runs the ingestion pipeline and reloads page 1 when rows were stored.
    pub async fn upload<R: Read>(
        &mut self,
        uploader: &Uploader,
        reader: R,
        owner: Uuid,
    ) -> Result<UploadOutcome, UploadError> {
        let result = uploader.upload(&self.store, reader, owner).await;
        match &result {
            Ok(UploadOutcome::Uploaded { accepted, .. }) => {
                self.notices.push(Notice::info(
                    "Success",
                    format!("Uploaded {accepted} students successfully"),
                ));
                self.upload_complete().await;
            }
            Ok(UploadOutcome::NoValidData { .. }) => self
                .notices
                .push(Notice::destructive("Error", "No valid data found in CSV")),
            Err(UploadError::Parse(_)) => self
                .notices
                .push(Notice::destructive("Parse Error", "Failed to parse CSV file")),
            Err(UploadError::Store(e)) => self
                .notices
                .push(Notice::destructive("Upload Failed", e.message())),
            Err(UploadError::Busy) => self
                .notices
                .push(Notice::destructive("Error", "An upload is already in progress")),
        }
        result
    }

    /// Only a failed clear is reported back; load failures surface as notices.
    pub async fn dispatch(&mut self, action: Action) -> Result<(), StoreError> {
        tracing::debug!(?action, "dispatching");
        match action {
            Action::LoadPage(page) => self.load_page_and_stats(page).await,
            Action::NextPage => self.next_page().await,
            Action::PreviousPage => self.previous_page().await,
            Action::Refresh => self.refresh().await,
            Action::UploadComplete => self.upload_complete().await,
            Action::ClearAll => {
                self.clear_all().await?;
            }
        }
        Ok(())
    }

    /// Subscribes to session changes without fetching anything.
    pub fn attach(&mut self, session: &SessionContext) -> Gate {
        self.subscription = Some(session.subscribe());
        self.signed_in = session.current().is_some();
        if self.signed_in {
            Gate::Ready
        } else {
            Gate::RedirectToAuth
        }
    }

    /// Subscribes to session changes and loads data only when signed in.
    pub async fn mount(&mut self, session: &SessionContext) -> Gate {
        let gate = self.attach(session);
        if gate == Gate::Ready {
            self.load_page_and_stats(self.state.current_page).await;
        }
        gate
    }

    /// Reacts to a session change seen since the last call.
    pub async fn sync_session(&mut self) -> Gate {
        let change = self
            .subscription
            .as_mut()
            .and_then(SessionSubscription::take_change);

        if let Some(session) = change {
            self.signed_in = session.is_some();
            if self.signed_in && !self.loaded {
                self.load_page_and_stats(self.state.current_page).await;
            }
        }

        if self.signed_in {
            Gate::Ready
        } else {
            Gate::RedirectToAuth
        }
    }

    pub fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    pub async fn logout<A>(&mut self, auth: &A, session: &SessionContext) -> Result<Gate, AuthError>
    where
        A: AuthProvider + ?Sized,
    {
        if let Some(current) = session.current() {
            if let Err(e) = auth.sign_out(current.token).await {
                self.notices.push(Notice::destructive("Error", e.to_string()));
                return Err(e);
            }
        }
        session.set(None);
        self.teardown();
        self.signed_in = false;
        self.notices
            .push(Notice::info("Signed out", "You have been logged out"));
        Ok(Gate::RedirectToAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fake::{session, FakeAuth};
    use crate::db::memory::{record, Call, MemoryStore};
    use crate::risk::RiskPrediction;

    fn store_with(count: usize) -> MemoryStore {
        let rows = (0..count)
            .map(|i| {
                let risk = if i % 3 == 0 {
                    Some(RiskPrediction::High)
                } else {
                    None
                };
                record(&format!("S{i:03}"), risk)
            })
            .collect();
        MemoryStore::with_rows(rows)
    }

    #[tokio::test]
    async fn load_page_fetches_ordered_window_with_total() {
        let mut dashboard = Dashboard::new(store_with(45));
        dashboard.load_page(2).await;

        let state = dashboard.state();
        assert_eq!(state.current_page, 2);
        assert_eq!(state.total_count, 45);
        assert_eq!(state.students.len(), 20);
        assert_eq!(state.students[0].student_id, "S020");
        assert!(!state.is_loading);
        assert_eq!(
            dashboard.store().calls(),
            vec![Call::SelectPage(PageWindow { from: 20, to: 39 })]
        );
    }

    #[tokio::test]
    async fn navigation_is_disabled_exactly_at_the_boundaries() {
        let mut dashboard = Dashboard::new(store_with(45));
        dashboard.load_page(1).await;
        assert_eq!(dashboard.state().total_pages(), 3);
        assert!(!dashboard.state().has_previous());
        assert!(dashboard.state().has_next());

        dashboard.previous_page().await;
        assert_eq!(dashboard.state().current_page, 1);

        dashboard.dispatch(Action::NextPage).await.unwrap();
        dashboard.dispatch(Action::NextPage).await.unwrap();
        assert_eq!(dashboard.state().current_page, 3);
        assert!(dashboard.state().has_previous());
        assert!(!dashboard.state().has_next());
        assert_eq!(dashboard.state().students.len(), 5);

        let calls_before = dashboard.store().calls().len();
        dashboard.next_page().await;
        assert_eq!(dashboard.store().calls().len(), calls_before);
    }

    #[tokio::test]
    async fn failed_page_load_keeps_prior_data_and_notifies() {
        let mut dashboard = Dashboard::new(store_with(5));
        dashboard.load_page(1).await;
        dashboard.store().fail_select("connection reset");

        dashboard.load_page(1).await;

        assert_eq!(dashboard.state().students.len(), 5);
        assert!(!dashboard.state().is_loading);
        let notices = dashboard.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].description, "Failed to fetch students");
        assert_eq!(notices[0].level, NoticeLevel::Destructive);
    }

    #[tokio::test]
    async fn stats_failure_is_not_surfaced() {
        let mut dashboard = Dashboard::new(store_with(6));
        dashboard.load_stats().await;
        assert_eq!(dashboard.state().at_risk_count, 2);

        dashboard.store().fail_count("timeout");
        dashboard.load_stats().await;
        assert_eq!(dashboard.state().at_risk_count, 2);
        assert!(dashboard.take_notices().is_empty());
    }

    #[tokio::test]
    async fn refresh_always_confirms() {
        let mut dashboard = Dashboard::new(store_with(3));
        dashboard.store().fail_select("offline");
        dashboard.store().fail_count("offline");

        dashboard.dispatch(Action::Refresh).await.unwrap();

        let titles: Vec<_> = dashboard
            .take_notices()
            .into_iter()
            .map(|n| n.title)
            .collect();
        assert_eq!(titles, vec!["Error", "Refreshed"]);
    }

    #[tokio::test]
    async fn upload_resets_to_first_page_with_new_rows() {
        let mut dashboard = Dashboard::new(store_with(45));
        dashboard.load_page(3).await;
        let uploader = Uploader::default();
        let csv = "Student_id,Grade,Attendance_rate,Gpa\nA1,9,95,3.8\nA2,,90,3.2\n";

        let outcome = dashboard
            .upload(&uploader, csv.as_bytes(), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UploadOutcome::Uploaded {
                accepted: 1,
                skipped: 1
            }
        );
        let state = dashboard.state();
        assert_eq!(state.current_page, 1);
        assert_eq!(state.total_count, 46);
        assert_eq!(state.students[0].student_id, "A1");
        assert!((state.students[0].attendance_rate - 0.95).abs() < 1e-12);
        assert_eq!(state.at_risk_count, 15);
        assert_eq!(
            dashboard.take_notices()[0].description,
            "Uploaded 1 students successfully"
        );
    }

    #[tokio::test]
    async fn upload_complete_reflects_externally_scored_rows() {
        let mut dashboard = Dashboard::new(MemoryStore::new());
        let uploader = Uploader::default();
        let csv = "Student_id,Grade,Attendance_rate,Gpa\nS1,9,40,1.2\n";
        dashboard
            .upload(&uploader, csv.as_bytes(), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(dashboard.state().at_risk_count, 0);

        dashboard.store().set_risk("S1", RiskPrediction::High);
        dashboard.dispatch(Action::UploadComplete).await.unwrap();
        assert_eq!(dashboard.state().at_risk_count, 1);
        assert_eq!(
            dashboard.state().students[0].risk_prediction,
            Some(RiskPrediction::High)
        );
    }

    #[tokio::test]
    async fn invalid_upload_notifies_without_reloading() {
        let mut dashboard = Dashboard::new(MemoryStore::new());
        let uploader = Uploader::default();
        let csv = "Student_id,Grade,Attendance_rate,Gpa\nS1,,95,3.8\n";

        let outcome = dashboard
            .upload(&uploader, csv.as_bytes(), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(outcome, UploadOutcome::NoValidData { rows_read: 1 });
        assert!(dashboard.store().calls().is_empty());
        let notices = dashboard.take_notices();
        assert_eq!(notices[0].description, "No valid data found in CSV");
    }

    #[tokio::test]
    async fn failed_insert_reports_store_message() {
        let mut dashboard = Dashboard::new(MemoryStore::new());
        dashboard.store().fail_insert("duplicate key value");
        let uploader = Uploader::default();
        let csv = "Student_id,Grade,Attendance_rate,Gpa\nS1,9,95,3.8\n";

        let result = dashboard
            .upload(&uploader, csv.as_bytes(), Uuid::new_v4())
            .await;

        assert!(matches!(result, Err(UploadError::Store(_))));
        let notices = dashboard.take_notices();
        assert_eq!(notices[0].title, "Upload Failed");
        assert_eq!(notices[0].description, "duplicate key value");
    }

    #[tokio::test]
    async fn clear_all_then_reload_is_empty() {
        let mut dashboard = Dashboard::new(store_with(30));
        dashboard.load_page(2).await;

        dashboard.dispatch(Action::ClearAll).await.unwrap();
        dashboard.load_page(1).await;

        let state = dashboard.state();
        assert_eq!(state.total_count, 0);
        assert!(state.students.is_empty());
        assert_eq!(state.at_risk_count, 0);
        assert_eq!(state.current_page, 1);
        assert_eq!(state.total_pages(), 0);
    }

    #[tokio::test]
    async fn failed_clear_leaves_state_unchanged() {
        let mut dashboard = Dashboard::new(store_with(30));
        dashboard.load_page(1).await;
        dashboard.store().fail_delete("permission denied");

        let err = dashboard.clear_all().await.unwrap_err();

        assert_eq!(err.message(), "permission denied");
        assert_eq!(dashboard.state().total_count, 30);
        assert_eq!(dashboard.take_notices()[0].description, "permission denied");
    }

    #[tokio::test]
    async fn failed_clear_through_dispatch_returns_err() {
        let mut dashboard = Dashboard::new(store_with(5));
        dashboard.store().fail_delete("permission denied");

        let err = dashboard.dispatch(Action::ClearAll).await.unwrap_err();

        assert_eq!(err.message(), "permission denied");
        assert_eq!(dashboard.store().rows().len(), 5);
    }

    #[test]
    fn stale_page_response_is_discarded() {
        let mut dashboard = Dashboard::new(store_with(0));
        let first = dashboard.begin_page_load(2);
        let second = dashboard.begin_page_load(3);

        let newer = StudentPage {
            rows: vec![record("S040", None)],
            total_count: 41,
        };
        let older = StudentPage {
            rows: vec![record("S020", None)],
            total_count: 41,
        };

        assert!(dashboard.finish_page_load(second, Ok(newer)));
        assert!(!dashboard.finish_page_load(first, Ok(older)));

        let state = dashboard.state();
        assert_eq!(state.current_page, 3);
        assert_eq!(state.students[0].student_id, "S040");
        assert!(!state.is_loading);
    }

    #[test]
    fn loading_stays_set_until_latest_response_arrives() {
        let mut dashboard = Dashboard::new(store_with(0));
        let first = dashboard.begin_page_load(1);
        let _second = dashboard.begin_page_load(2);

        dashboard.finish_page_load(
            first,
            Ok(StudentPage {
                rows: Vec::new(),
                total_count: 0,
            }),
        );

        assert!(dashboard.state().is_loading);
        assert!(!dashboard.state().shows_pagination());
    }

    #[tokio::test]
    async fn mount_without_session_redirects_and_loads_nothing() {
        let context = SessionContext::new(None);
        let mut dashboard = Dashboard::new(store_with(3));

        assert_eq!(dashboard.mount(&context).await, Gate::RedirectToAuth);
        assert!(dashboard.store().calls().is_empty());

        context.set(Some(session()));
        assert_eq!(dashboard.sync_session().await, Gate::Ready);
        assert_eq!(dashboard.state().total_count, 3);
        assert_eq!(dashboard.state().at_risk_count, 1);
    }

    #[tokio::test]
    async fn mount_with_session_loads_page_and_stats() {
        let context = SessionContext::new(Some(session()));
        let mut dashboard = Dashboard::new(store_with(3));

        assert_eq!(dashboard.mount(&context).await, Gate::Ready);
        let calls = dashboard.store().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&Call::CountHighRisk));
        assert_eq!(context.subscriber_count(), 1);

        dashboard.teardown();
        assert_eq!(context.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn attach_subscribes_without_fetching() {
        let context = SessionContext::new(Some(session()));
        let mut dashboard = Dashboard::new(store_with(3));

        assert_eq!(dashboard.attach(&context), Gate::Ready);
        assert!(dashboard.store().calls().is_empty());
        assert_eq!(context.subscriber_count(), 1);

        dashboard.dispatch(Action::Refresh).await.unwrap();
        assert_eq!(dashboard.store().calls().len(), 2);
        assert_eq!(dashboard.state().total_count, 3);
    }

    #[tokio::test]
    async fn session_loss_redirects() {
        let context = SessionContext::new(Some(session()));
        let mut dashboard = Dashboard::new(store_with(3));
        dashboard.mount(&context).await;

        context.set(None);
        assert_eq!(dashboard.sync_session().await, Gate::RedirectToAuth);
    }

    #[tokio::test]
    async fn logout_signs_out_and_clears_session() {
        let auth = FakeAuth::default();
        let current = session();
        let context = SessionContext::new(Some(current.clone()));
        let mut dashboard = Dashboard::new(store_with(3));
        dashboard.mount(&context).await;

        let gate = dashboard.logout(&auth, &context).await.unwrap();

        assert_eq!(gate, Gate::RedirectToAuth);
        assert!(context.current().is_none());
        assert_eq!(context.subscriber_count(), 0);
        assert_eq!(*auth.signed_out.lock().unwrap(), vec![current.token]);
    }

    #[tokio::test]
    async fn failed_logout_keeps_session() {
        let auth = FakeAuth {
            fail_sign_out: true,
            ..FakeAuth::default()
        };
        let context = SessionContext::new(Some(session()));
        let mut dashboard = Dashboard::new(store_with(3));
        dashboard.mount(&context).await;

        assert!(dashboard.logout(&auth, &context).await.is_err());
        assert!(context.current().is_some());
    }
}
